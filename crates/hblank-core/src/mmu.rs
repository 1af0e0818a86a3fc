use log::{debug, trace};

use crate::{
    cartridge::Cartridge,
    config::GbMode,
    ppu::Ppu,
    scanline::OAM_SIZE,
};

pub const WRAM_BANK_SIZE: usize = 0x1000;
pub const WRAM_BANKS: usize = 8;
const UNUSABLE_SIZE: usize = 0x60;

/// CPU clock in single-speed mode.
pub const CLOCK_SPEED: u32 = 4_194_304;

/// Bytes the high area takes in a save state: OAM, the unusable range and
/// the I/O page (which includes HRAM and IE).
pub const HIGH_AREA_SIZE: usize = 0x200;

/// I/O values written at power-on, in order.
const POWER_ON_IO: [(u8, u8); 14] = [
    (0x05, 0x00),
    (0x06, 0x00),
    (0x07, 0x00),
    (0x40, 0x91),
    (0x42, 0x00),
    (0x43, 0x00),
    (0x45, 0x00),
    (0x47, 0xFC),
    (0x48, 0xFF),
    (0x49, 0xFF),
    (0x4A, 0x00),
    (0x4B, 0x00),
    (0xFF, 0x00),
    (0x0F, 0x00),
];

#[derive(Debug, Default, Clone, Copy)]
struct HdmaState {
    /// Source pointer, low four bits clear.
    src: u16,
    /// Destination offset inside VRAM (0x0000-0x1FF0).
    dst: u16,
    /// Blocks left in an HBlank transfer; 0 when idle.
    remaining: u16,
}

pub struct Mmu {
    pub wram: [[u8; WRAM_BANK_SIZE]; WRAM_BANKS],
    pub wram_bank: usize,
    pub unusable: [u8; UNUSABLE_SIZE],
    pub cart: Option<Cartridge>,
    pub ppu: Ppu,
    /// Non-video I/O registers, HRAM and IE. Video registers live on the PPU.
    io: [u8; 0x100],
    hdma: HdmaState,
    gb_mode: GbMode,
    /// Active-low button lines: low nibble A/B/Select/Start, high nibble
    /// Right/Left/Up/Down.
    buttons: u8,
    event_pending: bool,
    extra_cycles: u32,
    /// Cycles until the running serial transfer completes; 0 when idle.
    pub serial_counter: i32,
}

impl Mmu {
    pub fn new(gb_mode: GbMode) -> Self {
        let mut mmu = Self {
            wram: [[0; WRAM_BANK_SIZE]; WRAM_BANKS],
            wram_bank: 1,
            unusable: [0; UNUSABLE_SIZE],
            cart: None,
            ppu: Ppu::new(gb_mode),
            io: [0; 0x100],
            hdma: HdmaState::default(),
            gb_mode,
            buttons: 0xFF,
            event_pending: false,
            extra_cycles: 0,
            serial_counter: 0,
        };
        for (reg, val) in POWER_ON_IO {
            mmu.write_io(reg, val);
        }
        mmu.io[0x55] = 0xFF;
        mmu.event_pending = false;
        mmu
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    pub fn gb_mode(&self) -> GbMode {
        self.gb_mode
    }

    pub fn double_speed(&self) -> bool {
        self.io[0x4D] & 0x80 != 0
    }

    /// Flip the current speed after a STOP with KEY1 armed.
    pub fn set_double_speed(&mut self, on: bool) {
        self.io[0x4D] = if on { 0x80 } else { 0 };
    }

    pub fn clock_speed(&self) -> u32 {
        if self.double_speed() {
            CLOCK_SPEED * 2
        } else {
            CLOCK_SPEED
        }
    }

    /// Press state for all eight buttons, one bit each, set = held.
    pub fn set_buttons(&mut self, held: u8) {
        self.buttons = !held;
    }

    pub fn if_reg(&self) -> u8 {
        self.io[0x0F]
    }

    pub fn set_if_reg(&mut self, val: u8) {
        self.io[0x0F] = val;
        self.check_interrupts();
    }

    pub fn ie_reg(&self) -> u8 {
        self.io[0xFF]
    }

    pub fn request_interrupt(&mut self, bits: u8) {
        self.io[0x0F] |= bits;
        self.check_interrupts();
    }

    fn check_interrupts(&mut self) {
        if self.io[0x0F] & self.io[0xFF] != 0 {
            self.event_pending = true;
        }
    }

    /// Whether a write since the last call needs the CPU loop to re-check
    /// interrupts or the LY compare.
    pub fn take_event_pending(&mut self) -> bool {
        std::mem::take(&mut self.event_pending)
    }

    /// Cycles the CPU should stall for DMA work done since the last call.
    pub fn take_extra_cycles(&mut self) -> u32 {
        std::mem::take(&mut self.extra_cycles)
    }

    pub fn hdma_active(&self) -> bool {
        self.hdma.remaining > 0
    }

    pub fn read_byte(&self, addr: u16) -> u8 {
        let offset = addr as usize & (WRAM_BANK_SIZE - 1);
        match addr >> 12 {
            0x0..=0x7 | 0xA | 0xB => self.cart.as_ref().map_or(0xFF, |c| c.read(addr)),
            0x8 | 0x9 => self.ppu.vram.read(addr),
            0xC | 0xE => self.wram[0][offset],
            0xD => self.wram[self.wram_bank][offset],
            _ => match addr {
                0xFF00..=0xFFFF => self.read_io(addr as u8),
                0xFE00..=0xFE9F => self.ppu.oam[(addr - 0xFE00) as usize],
                0xFEA0..=0xFEFF => self.unusable[(addr - 0xFEA0) as usize],
                _ => self.wram[self.wram_bank][offset],
            },
        }
    }

    pub fn read_word(&self, addr: u16) -> u16 {
        u16::from_le_bytes([self.read_byte(addr), self.read_byte(addr.wrapping_add(1))])
    }

    /// DMA sources see the echo RAM mapping across the whole F page.
    fn dma_read_byte(&self, addr: u16) -> u8 {
        let offset = addr as usize & (WRAM_BANK_SIZE - 1);
        match addr >> 12 {
            0xE => self.wram[0][offset],
            0xF => self.wram[self.wram_bank][offset],
            _ => self.read_byte(addr),
        }
    }

    pub fn read_io(&self, reg: u8) -> u8 {
        let val = self.io[reg as usize];
        match reg {
            0x00 => {
                if val & 0x20 == 0 {
                    0xC0 | (val & 0xF0) | (self.buttons & 0x0F)
                } else if val & 0x10 == 0 {
                    0xC0 | (val & 0xF0) | (self.buttons >> 4)
                } else {
                    val
                }
            }
            // Sound registers read back with their write-only bits set
            0x10 => val | 0x80,
            0x11 | 0x16 => val | 0x3F,
            0x14 | 0x19 | 0x1E | 0x23 => val | 0xBF,
            0x1A => val | 0x7F,
            0x1C => val | 0x9F,
            0x26 => val | 0x70,
            0x13 | 0x15 | 0x18 | 0x1B | 0x1D | 0x1F | 0x20 | 0x27..=0x2F => 0xFF,
            0x40..=0x4B | 0x4F | 0x68..=0x6B => self.ppu.read_reg(0xFF00 | reg as u16),
            0x70 => val | 0xF8,
            _ => val,
        }
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        let offset = addr as usize & (WRAM_BANK_SIZE - 1);
        match addr >> 12 {
            0x0..=0x7 | 0xA | 0xB => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0x8 | 0x9 => self.ppu.write_vram(addr, val),
            0xC | 0xE => self.wram[0][offset] = val,
            0xD => self.wram[self.wram_bank][offset] = val,
            _ => match addr {
                0xFF00..=0xFFFF => self.write_io(addr as u8, val),
                0xFE00..=0xFE9F => self.ppu.write_oam(addr, val),
                0xFEA0..=0xFEFF => {
                    self.unusable[(addr - 0xFEA0) as usize] = val;
                    self.ppu.pipeline.mark_sprites();
                }
                _ => self.wram[self.wram_bank][offset] = val,
            },
        }
    }

    pub fn write_word(&mut self, addr: u16, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.write_byte(addr, lo);
        self.write_byte(addr.wrapping_add(1), hi);
    }

    pub fn write_io(&mut self, reg: u8, val: u8) {
        match reg {
            0x02 => {
                self.io[0x02] = val;
                self.serial_counter = if val & 0x81 == 0x81 {
                    (self.clock_speed() / 1024) as i32
                } else {
                    0
                };
            }
            0x04 => self.io[0x04] = 0,
            0x0F | 0xFF => {
                self.io[reg as usize] = val;
                self.check_interrupts();
            }
            0x41 | 0x45 => {
                self.ppu.write_reg(0xFF00 | reg as u16, val);
                let mut if_reg = self.io[0x0F];
                self.ppu.refresh_stat(&mut if_reg);
                self.io[0x0F] = if_reg;
                self.event_pending = true;
            }
            0x44 => trace!("Ignoring LY write {val:#04x}"),
            0x46 => self.oam_dma(val),
            0x40..=0x4B | 0x4F | 0x68..=0x6B => self.ppu.write_reg(0xFF00 | reg as u16, val),
            0x4D => self.io[0x4D] = (self.io[0x4D] & 0x80) | (val & 1),
            0x55 => self.write_hdma(val),
            0x70 => {
                if self.gb_mode.is_cgb() {
                    self.wram_bank = ((val & 7) as usize).max(1);
                }
                self.io[0x70] = val & 7;
            }
            _ => self.io[reg as usize] = val,
        }
    }

    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        let mut block = [0u8; OAM_SIZE];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = self.dma_read_byte(base + i as u16);
        }
        self.ppu.oam_dma(page, &block);
    }

    fn write_hdma(&mut self, val: u8) {
        if !self.gb_mode.is_cgb() {
            self.io[0x55] = val;
            return;
        }
        if self.hdma.remaining > 0 {
            if val & 0x80 == 0 {
                debug!("HDMA cancelled with {} blocks left", self.hdma.remaining);
                self.io[0x55] |= 0x80;
                self.hdma.remaining = 0;
            }
            return;
        }

        let blocks = (val & 0x7F) as u16 + 1;
        self.hdma.src = u16::from_be_bytes([self.io[0x51], self.io[0x52]]) & 0xFFF0;
        self.hdma.dst = u16::from_be_bytes([self.io[0x53], self.io[0x54]]) & 0x1FF0;
        if val & 0x80 != 0 {
            self.hdma.remaining = blocks;
            self.io[0x55] = (blocks - 1) as u8;
            return;
        }

        for _ in 0..blocks {
            self.copy_hdma_block();
        }
        let speed = if self.double_speed() { 2 } else { 1 };
        self.extra_cycles += blocks as u32 * 8 * speed;
        self.io[0x55] = 0xFF;
        self.store_hdma_pointers();
    }

    fn copy_hdma_block(&mut self) {
        let mut block = [0u8; 16];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = self.dma_read_byte(self.hdma.src.wrapping_add(i as u16));
        }
        self.ppu.write_vram_block(self.hdma.dst, &block);
        self.hdma.src = self.hdma.src.wrapping_add(0x10);
        self.hdma.dst = self.hdma.dst.wrapping_add(0x10) & 0x1FF0;
    }

    fn store_hdma_pointers(&mut self) {
        [self.io[0x51], self.io[0x52]] = self.hdma.src.to_be_bytes();
        [self.io[0x53], self.io[0x54]] = self.hdma.dst.to_be_bytes();
    }

    /// Move one block of a running HBlank transfer. Returns whether a block
    /// was copied.
    pub fn hblank_dma(&mut self) -> bool {
        if self.hdma.remaining == 0 {
            return false;
        }
        self.copy_hdma_block();
        self.hdma.remaining -= 1;
        self.io[0x55] = match self.hdma.remaining {
            0 => 0xFF,
            n => (n - 1) as u8,
        };
        self.store_hdma_pointers();
        true
    }

    /// Image of OAM, the unusable range and the I/O page.
    pub fn high_area(&self) -> [u8; HIGH_AREA_SIZE] {
        let mut area = [0u8; HIGH_AREA_SIZE];
        area[..OAM_SIZE].copy_from_slice(&self.ppu.oam);
        area[OAM_SIZE..0x100].copy_from_slice(&self.unusable);
        let mut page = self.io;
        self.ppu.save_registers(&mut page);
        area[0x100..].copy_from_slice(&page);
        area
    }

    pub fn load_high_area(&mut self, area: &[u8; HIGH_AREA_SIZE]) {
        self.ppu.oam.copy_from_slice(&area[..OAM_SIZE]);
        self.unusable.copy_from_slice(&area[OAM_SIZE..0x100]);
        let mut page = [0u8; 0x100];
        page.copy_from_slice(&area[0x100..]);
        self.ppu.load_registers(&page);
        self.io = page;
        self.hdma.src = u16::from_be_bytes([page[0x51], page[0x52]]) & 0xFFF0;
        self.hdma.dst = u16::from_be_bytes([page[0x53], page[0x54]]) & 0x1FF0;
        self.hdma.remaining = if self.gb_mode.is_cgb() && page[0x55] & 0x80 == 0 {
            (page[0x55] & 0x7F) as u16 + 1
        } else {
            0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_registers() {
        let mmu = Mmu::new(GbMode::Gb);
        assert_eq!(mmu.read_byte(0xFF40), 0x91);
        assert_eq!(mmu.read_byte(0xFF47), 0xFC);
        assert_eq!(mmu.read_byte(0xFF55), 0xFF);
        assert_eq!(mmu.wram_bank, 1);
    }

    #[test]
    fn echo_ram_mirrors_work_ram() {
        let mut mmu = Mmu::new(GbMode::Gb);
        mmu.write_byte(0xC123, 0x42);
        assert_eq!(mmu.read_byte(0xE123), 0x42);
        mmu.write_byte(0xFD00, 0x24);
        assert_eq!(mmu.read_byte(0xDD00), 0x24);
    }

    #[test]
    fn cgb_wram_bank_zero_selects_one() {
        let mut mmu = Mmu::new(GbMode::Cgb);
        mmu.write_byte(0xFF70, 3);
        mmu.write_byte(0xD000, 0x33);
        mmu.write_byte(0xFF70, 0);
        assert_eq!(mmu.wram_bank, 1);
        assert_eq!(mmu.read_byte(0xFF70), 0xF8);
        assert_eq!(mmu.wram[3][0], 0x33);
    }

    #[test]
    fn joypad_reads_selected_group() {
        let mut mmu = Mmu::new(GbMode::Gb);
        mmu.set_buttons(0x01 | 0x80);
        mmu.write_byte(0xFF00, 0x10);
        assert_eq!(mmu.read_byte(0xFF00), 0xD0 | 0x0E);
        mmu.write_byte(0xFF00, 0x20);
        assert_eq!(mmu.read_byte(0xFF00), 0xE0 | 0x07);
    }

    #[test]
    fn sound_registers_read_with_mask() {
        let mut mmu = Mmu::new(GbMode::Gb);
        mmu.write_byte(0xFF26, 0x80);
        assert_eq!(mmu.read_byte(0xFF26), 0xF0);
        assert_eq!(mmu.read_byte(0xFF13), 0xFF);
    }

    #[test]
    fn oam_dma_copies_page_and_marks_sprites() {
        let mut mmu = Mmu::new(GbMode::Gb);
        for i in 0..OAM_SIZE as u16 {
            mmu.write_byte(0xC100 + i, i as u8);
        }
        mmu.ppu.pipeline.clear();
        mmu.write_byte(0xFF46, 0xC1);
        assert_eq!(mmu.read_byte(0xFE00), 0);
        assert_eq!(mmu.read_byte(0xFE9F), 0x9F);
        assert!(mmu.ppu.pipeline.dirty().sprites);
    }

    #[test]
    fn general_dma_copies_everything_at_once() {
        let mut mmu = Mmu::new(GbMode::Cgb);
        for i in 0..0x20u16 {
            mmu.write_byte(0xC000 + i, 0x80 | i as u8);
        }
        mmu.write_byte(0xFF51, 0xC0);
        mmu.write_byte(0xFF52, 0x00);
        mmu.write_byte(0xFF53, 0x80);
        mmu.write_byte(0xFF54, 0x10);
        mmu.write_byte(0xFF55, 0x01);
        assert_eq!(mmu.read_byte(0x8010), 0x80);
        assert_eq!(mmu.read_byte(0x802F), 0x9F);
        assert_eq!(mmu.read_byte(0xFF55), 0xFF);
        assert_eq!(mmu.take_extra_cycles(), 16);
        assert_eq!(mmu.read_byte(0xFF51), 0xC0);
        assert_eq!(mmu.read_byte(0xFF52), 0x20);
    }

    #[test]
    fn hblank_dma_moves_one_block_per_call() {
        let mut mmu = Mmu::new(GbMode::Cgb);
        mmu.write_byte(0xFF51, 0xC0);
        mmu.write_byte(0xFF52, 0x00);
        mmu.write_byte(0xFF53, 0x00);
        mmu.write_byte(0xFF54, 0x00);
        mmu.write_byte(0xFF55, 0x81);
        assert!(mmu.hdma_active());
        assert_eq!(mmu.read_byte(0xFF55), 0x01);

        assert!(mmu.hblank_dma());
        assert_eq!(mmu.read_byte(0xFF55), 0x00);
        assert!(mmu.hblank_dma());
        assert_eq!(mmu.read_byte(0xFF55), 0xFF);
        assert!(!mmu.hblank_dma());
    }

    #[test]
    fn hblank_dma_can_be_cancelled() {
        let mut mmu = Mmu::new(GbMode::Cgb);
        mmu.write_byte(0xFF55, 0x85);
        mmu.write_byte(0xFF55, 0x00);
        assert!(!mmu.hdma_active());
        assert_eq!(mmu.read_byte(0xFF55), 0x85);
    }

    #[test]
    fn interrupt_enable_write_flags_pending_event() {
        let mut mmu = Mmu::new(GbMode::Gb);
        mmu.request_interrupt(0x04);
        assert!(!mmu.take_event_pending());
        mmu.write_byte(0xFFFF, 0x04);
        assert!(mmu.take_event_pending());
        assert!(!mmu.take_event_pending());
    }

    #[test]
    fn high_area_round_trips_video_registers() {
        let mut mmu = Mmu::new(GbMode::Gb);
        mmu.write_byte(0xFF43, 0x12);
        mmu.write_byte(0xFF80, 0x34);
        mmu.write_byte(0xFE00, 0x56);
        let area = mmu.high_area();

        let mut other = Mmu::new(GbMode::Gb);
        other.load_high_area(&area);
        assert_eq!(other.read_byte(0xFF43), 0x12);
        assert_eq!(other.read_byte(0xFF80), 0x34);
        assert_eq!(other.read_byte(0xFE00), 0x56);
    }
}
