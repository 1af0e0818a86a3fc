use log::trace;

use crate::config::GbMode;
use crate::scanline::{CaptureInput, OAM_SIZE, PALETTE_BYTES, SCREEN_LINES, ScanlinePipeline};
use crate::vram::VramTracker;

// Timing constants per LCD mode in T-cycles
const MODE0_CYCLES: u16 = 204; // HBlank
const MODE1_CYCLES: u16 = 456; // One line during VBlank
const MODE2_CYCLES: u16 = 80; // OAM scan
const MODE3_CYCLES: u16 = 172; // Pixel transfer

// Number of lines spent in VBlank
const VBLANK_LINES: u8 = 10;

/// Cycles in a full frame. Frames keep ending at this rate while the LCD
/// is off so the host display still gets refreshed.
pub const FRAME_CYCLES: u32 = 70224;

/// Largest slice `Ppu::step` accepts.
pub const STEP_CYCLES: u16 = 4;

const PAL_INDEX_MASK: u8 = 0x3F;
const PAL_AUTO_INCREMENT_BIT: u8 = 0x80;

// LCD modes used in the `mode` field
const MODE_HBLANK: u8 = 0;
const MODE_VBLANK: u8 = 1;
const MODE_OAM: u8 = 2;
const MODE_TRANSFER: u8 = 3;

// I/O registers owned by the PPU
const SAVED_REGISTERS: [u8; 17] = [
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4F, 0x68, 0x69, 0x6A,
    0x6B,
];

const fn gray(level: u16) -> [u8; 2] {
    (level | level << 5 | level << 10).to_le_bytes()
}

/// BGR555 shades loaded into the first palettes in monochrome mode.
const DMG_SHADES: [[u8; 2]; 4] = [gray(0x1F), gray(0x15), gray(0x0A), gray(0x00)];

/// Points in the LCD cycle the rest of the machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcdEvent {
    /// Mode 3 of this line just ended and the line was captured.
    HBlank(u8),
    /// A frame ended: either line 144 was reached or, with the LCD off, a
    /// frame's worth of cycles passed.
    VBlank,
}

pub struct Ppu {
    pub vram: VramTracker,
    pub oam: [u8; OAM_SIZE],
    pub pipeline: ScanlinePipeline,
    gb_mode: GbMode,

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    dma: u8,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,
    vbk: u8,
    bgpi: u8,
    obpi: u8,
    bgpd: [u8; PALETTE_BYTES],
    obpd: [u8; PALETTE_BYTES],

    mode: u8,
    mode_clock: u16,
    off_clock: u32,
    stat_irq_line: bool,
    frame_counter: u64,
}

impl Ppu {
    pub fn new(gb_mode: GbMode) -> Self {
        let mut ppu = Self {
            vram: VramTracker::new(),
            oam: [0; OAM_SIZE],
            pipeline: ScanlinePipeline::new(),
            gb_mode,
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            dma: 0,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            vbk: 0,
            bgpi: 0,
            obpi: 0,
            bgpd: [0; PALETTE_BYTES],
            obpd: [0; PALETTE_BYTES],
            mode: MODE_OAM,
            mode_clock: 0,
            off_clock: 0,
            stat_irq_line: false,
            frame_counter: 0,
        };
        ppu.reset_palettes();
        ppu
    }

    pub fn gb_mode(&self) -> GbMode {
        self.gb_mode
    }

    pub fn lcdc(&self) -> u8 {
        self.lcdc
    }

    pub fn ly(&self) -> u8 {
        self.ly
    }

    pub fn wx(&self) -> u8 {
        self.wx
    }

    pub fn wy(&self) -> u8 {
        self.wy
    }

    /// Current LCD mode (0-3).
    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc & 0x80 != 0
    }

    pub fn frames(&self) -> u64 {
        self.frame_counter
    }

    pub fn bg_palette_data(&self) -> &[u8; PALETTE_BYTES] {
        &self.bgpd
    }

    pub fn spr_palette_data(&self) -> &[u8; PALETTE_BYTES] {
        &self.obpd
    }

    /// Cycles into the current mode, as kept in save states.
    pub fn mode_clock(&self) -> u16 {
        self.mode_clock
    }

    pub fn set_mode_clock(&mut self, clock: u16) {
        self.mode_clock = clock;
    }

    /// Fill palette memory with white, then give monochrome games the
    /// four-shade ramp in BG palette 0 and both sprite palettes.
    pub fn reset_palettes(&mut self) {
        self.bgpd = [0xFF; PALETTE_BYTES];
        self.obpd = [0xFF; PALETTE_BYTES];
        if self.gb_mode == GbMode::Gb {
            let ramp = DMG_SHADES.concat();
            self.bgpd[..8].copy_from_slice(&ramp);
            self.obpd[..8].copy_from_slice(&ramp);
            self.obpd[8..16].copy_from_slice(&ramp);
        }
    }

    /// Replace both palette memories without raising dirty flags.
    pub fn load_palettes(&mut self, bg: &[u8; PALETTE_BYTES], spr: &[u8; PALETTE_BYTES]) {
        self.bgpd = *bg;
        self.obpd = *spr;
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                (self.stat & 0x78)
                    | 0x80
                    | (self.mode & 0x03)
                    | if self.ly == self.lyc { 0x04 } else { 0 }
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF46 => self.dma,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF4F => self.vbk,
            0xFF68 => self.bgpi,
            0xFF69 => self.bgpd[(self.bgpi & PAL_INDEX_MASK) as usize],
            0xFF6A => self.obpi,
            0xFF6B => self.obpd[(self.obpi & PAL_INDEX_MASK) as usize],
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF40 => {
                let changed = self.lcdc ^ val;
                if changed & 0x7B != 0 {
                    self.pipeline.mark_maps();
                }
                if changed & 0x04 != 0 {
                    self.pipeline.mark_sprites();
                }
                self.lcdc = val;
                if val & 0x80 == 0 {
                    self.ly = 0;
                    self.mode = MODE_HBLANK;
                    self.mode_clock = 0;
                } else if changed & 0x80 != 0 {
                    self.mode = MODE_OAM;
                    self.mode_clock = 0;
                    self.off_clock = 0;
                }
            }
            0xFF41 => self.stat = (self.stat & 0x07) | (val & 0xF8),
            0xFF42 => {
                if self.scy != val {
                    self.scy = val;
                    self.pipeline.mark_maps();
                }
            }
            0xFF43 => {
                if self.scx != val {
                    self.scx = val;
                    self.pipeline.mark_maps();
                }
            }
            0xFF44 => trace!("Ignoring LY write {val:#04x}"),
            0xFF45 => self.lyc = val,
            0xFF46 => self.dma = val,
            0xFF47 => {
                if self.gb_mode == GbMode::Gb && self.bgp != val {
                    self.pipeline.mark_bg_palettes();
                }
                self.bgp = val;
            }
            0xFF48 => {
                if self.gb_mode == GbMode::Gb && self.obp0 != val {
                    self.pipeline.mark_spr_palettes();
                }
                self.obp0 = val;
            }
            0xFF49 => {
                if self.gb_mode == GbMode::Gb && self.obp1 != val {
                    self.pipeline.mark_spr_palettes();
                }
                self.obp1 = val;
            }
            0xFF4A => {
                self.pipeline.window_y_written(val, self.ly);
                self.wy = val;
            }
            0xFF4B => self.wx = val,
            0xFF4F => {
                self.vbk = val & 1;
                if self.gb_mode.is_cgb() {
                    self.vram.select_bank(self.vbk as usize);
                }
            }
            0xFF68 => self.bgpi = val,
            0xFF69 => {
                let idx = (self.bgpi & PAL_INDEX_MASK) as usize;
                if self.bgpd[idx] != val {
                    self.bgpd[idx] = val;
                    self.pipeline.mark_bg_palettes();
                }
                if self.bgpi & PAL_AUTO_INCREMENT_BIT != 0 {
                    self.bgpi = PAL_AUTO_INCREMENT_BIT | self.bgpi.wrapping_add(1);
                }
            }
            0xFF6A => self.obpi = val,
            0xFF6B => {
                let idx = (self.obpi & PAL_INDEX_MASK) as usize;
                if self.obpd[idx] != val {
                    self.obpd[idx] = val;
                    self.pipeline.mark_spr_palettes();
                }
                if self.obpi & PAL_AUTO_INCREMENT_BIT != 0 {
                    self.obpi = PAL_AUTO_INCREMENT_BIT | self.obpi.wrapping_add(1);
                }
            }
            _ => {}
        }
    }

    /// Copy registers into an I/O page image for a save state.
    pub fn save_registers(&self, page: &mut [u8; 0x100]) {
        for reg in SAVED_REGISTERS {
            page[reg as usize] = self.read_reg(0xFF00 | reg as u16);
        }
    }

    /// Restore registers from a save-state I/O page. Nothing is marked dirty;
    /// callers refresh the renderer afterwards.
    pub fn load_registers(&mut self, page: &[u8; 0x100]) {
        self.lcdc = page[0x40];
        self.stat = page[0x41] & 0xF8;
        self.mode = page[0x41] & 0x03;
        self.scy = page[0x42];
        self.scx = page[0x43];
        self.ly = page[0x44];
        self.lyc = page[0x45];
        self.dma = page[0x46];
        self.bgp = page[0x47];
        self.obp0 = page[0x48];
        self.obp1 = page[0x49];
        self.wy = page[0x4A];
        self.wx = page[0x4B];
        self.vbk = page[0x4F] & 1;
        self.bgpi = page[0x68];
        self.obpi = page[0x6A];
        if self.gb_mode.is_cgb() {
            self.vram.select_bank(self.vbk as usize);
        } else {
            self.vram.select_bank(0);
        }
        self.off_clock = 0;
        self.stat_irq_line = false;
    }

    pub fn write_vram(&mut self, addr: u16, val: u8) {
        self.vram.write(addr, val, self.ly);
    }

    pub fn write_vram_block(&mut self, dest: u16, block: &[u8; 16]) {
        self.vram.write_block(dest, block, self.ly);
    }

    pub fn write_oam(&mut self, addr: u16, val: u8) {
        self.oam[(addr as usize) & 0xFF] = val;
        self.pipeline.mark_sprites();
    }

    /// OAM DMA from page `page`; the caller reads the source bytes.
    pub fn oam_dma(&mut self, page: u8, src: &[u8; OAM_SIZE]) {
        self.dma = page;
        self.oam = *src;
        self.pipeline.mark_sprites();
    }

    fn capture_line(&mut self) {
        let input = CaptureInput {
            lcdc: self.lcdc,
            scy: self.scy,
            scx: self.scx,
            ly: self.ly,
            wy: self.wy,
            bgp: self.bgp,
            obp0: self.obp0,
            obp1: self.obp1,
            cgb: self.gb_mode.is_cgb(),
            oam: &self.oam,
            bg_palette: &self.bgpd,
            spr_palette: &self.obpd,
        };
        self.pipeline.capture(self.ly as usize, &input);
    }

    /// Advance by at most `STEP_CYCLES`. Modes last far longer than that, so
    /// a single call produces at most one event.
    pub fn step(&mut self, cycles: u16, if_reg: &mut u8) -> Option<LcdEvent> {
        let increment = cycles.min(STEP_CYCLES);
        if self.lcdc & 0x80 == 0 {
            self.mode = MODE_HBLANK;
            self.ly = 0;
            self.mode_clock = 0;
            self.off_clock += increment as u32;
            if self.off_clock >= FRAME_CYCLES {
                self.off_clock -= FRAME_CYCLES;
                self.frame_counter = self.frame_counter.wrapping_add(1);
                return Some(LcdEvent::VBlank);
            }
            return None;
        }

        self.mode_clock += increment;
        let mut event = None;

        match self.mode {
            MODE_HBLANK => {
                if self.mode_clock >= MODE0_CYCLES {
                    self.mode_clock -= MODE0_CYCLES;
                    self.ly += 1;
                    if self.ly == SCREEN_LINES as u8 {
                        self.mode = MODE_VBLANK;
                        *if_reg |= 0x01;
                        event = Some(LcdEvent::VBlank);
                    } else {
                        self.mode = MODE_OAM;
                    }
                }
            }
            MODE_VBLANK => {
                if self.mode_clock >= MODE1_CYCLES {
                    self.mode_clock -= MODE1_CYCLES;
                    self.ly += 1;
                    if self.ly > SCREEN_LINES as u8 + VBLANK_LINES - 1 {
                        self.ly = 0;
                        self.frame_counter = self.frame_counter.wrapping_add(1);
                        self.mode = MODE_OAM;
                    }
                }
            }
            MODE_OAM => {
                if self.mode_clock >= MODE2_CYCLES {
                    self.mode_clock -= MODE2_CYCLES;
                    self.pipeline.latch_window_x(self.wx);
                    self.mode = MODE_TRANSFER;
                }
            }
            MODE_TRANSFER => {
                if self.mode_clock >= MODE3_CYCLES {
                    self.mode_clock -= MODE3_CYCLES;
                    self.capture_line();
                    self.mode = MODE_HBLANK;
                    event = Some(LcdEvent::HBlank(self.ly));
                }
            }
            _ => {}
        }

        self.update_stat_irq(if_reg);
        event
    }

    /// Re-evaluate the STAT line after a STAT or LYC write.
    pub fn refresh_stat(&mut self, if_reg: &mut u8) {
        if self.lcd_enabled() {
            self.update_stat_irq(if_reg);
        }
    }

    fn update_stat_irq(&mut self, if_reg: &mut u8) {
        let coincidence = self.ly == self.lyc && self.stat & 0x40 != 0;
        let mode_signal = match self.mode {
            MODE_HBLANK => self.stat & 0x08 != 0,
            MODE_VBLANK => self.stat & 0x10 != 0,
            MODE_OAM => self.stat & 0x20 != 0,
            _ => false,
        };
        let current = coincidence || mode_signal;
        if current && !self.stat_irq_line {
            *if_reg |= 0x02;
        }
        self.stat_irq_line = current;
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new(GbMode::Gb)
    }
}
