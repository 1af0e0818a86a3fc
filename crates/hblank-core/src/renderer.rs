//! Scanline composition onto the host display.
//!
//! The renderer reads the drawing buffer of the scanline pipeline at each
//! horizontal blank and programs [`HostDisplay`] layers, palettes and
//! sprites for that line. At the end of every emulated frame it swaps the
//! pipeline buffers and redraws tiles and map cells queued by the VRAM
//! tracker.

use log::debug;

use crate::{
    config::{BorderMode, CoreConfig, GbMode, InterruptWait},
    display::{
        BLACK, BLANK_OVERLAY, FIRST_GB_SPRITE, HOST_LAYERS, HostDisplay, HostSprite, MAP_FLIP_X,
        MAP_FLIP_Y, MAP_PALETTE_SHIFT, OFF_MAP_PALETTE_INDEX, SCREEN_OFFSET_X, SCREEN_OFFSET_Y,
        SpriteAttrs, TileBitmap, WHITE,
    },
    scanline::{
        LayerControl, LayerWords, MapPlane, OAM_SIZE, PALETTE_BYTES, SCREEN_LINES,
        ScanlinePipeline, ScanlineState,
    },
    vram::{MAP_CELLS, VramBanks, VramSink, VramTracker},
};

pub const SGB_MAP_WIDTH: usize = 20;
pub const SGB_MAP_HEIGHT: usize = 18;
pub const SGB_MAP_LEN: usize = SGB_MAP_WIDTH * SGB_MAP_HEIGHT;

const GB_SPRITES: usize = 40;
const SPRITE_PRIORITY: u8 = 2;
const SPRITE_PRIORITY_LOW: u8 = 3;

/// Blocks until the host display enters vertical blank.
///
/// After it returns the renderer runs its own vertical-blank work, so a
/// host that paces frames through this trait must not also call
/// [`Renderer::vblank`] for the same blank.
pub trait VsyncSource {
    fn wait_for_vblank(&mut self);
}

/// One-shot work run at the next vertical blank.
pub type VblankTask = Box<dyn FnOnce(&mut Renderer)>;

/// Host layers assigned to the window and the background on one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPlan {
    pub win: usize,
    pub bg: usize,
}

/// Split the host layers between window and background.
///
/// A loaded border takes one host layer, so one of the two GB layers has to
/// give up a priority split. The one whose map actually uses tile priority
/// keeps its two layers.
pub fn plan_layers(
    use_win: bool,
    win_x: u8,
    border: bool,
    bg_tile_priority: bool,
    win_tile_priority: bool,
) -> LayerPlan {
    match (use_win, win_x > 7, border) {
        (false, _, _) => LayerPlan { win: 0, bg: 3 },
        (true, false, _) => LayerPlan { win: 3, bg: 0 },
        (true, true, false) => LayerPlan { win: 2, bg: 2 },
        (true, true, true) if !bg_tile_priority && win_tile_priority => LayerPlan { win: 2, bg: 1 },
        (true, true, true) => LayerPlan { win: 1, bg: 2 },
    }
}

/// Tile cell of the SGB attribute map a sprite takes its palette from.
///
/// Sprites don't line up with the 8x8 attribute grid, so the cell is
/// estimated from which nearby lines had sprites enabled.
pub fn sgb_sprite_cell(x: i32, y: i32, tall: bool, drawing: &[ScanlineState]) -> (usize, usize) {
    let last = SCREEN_LINES as i32 - 1;
    let on = |line: i32| drawing[line.clamp(0, last) as usize].sprites_on;

    let x_pos = if x < 0 { 0 } else { x / 8 };
    let y_pos = if tall {
        if (y >= last - 14 && !on(last)) || (y < last - 14 && !on(y + 15)) {
            y / 8
        } else if (y < 0 && !on(0)) || !on(y) {
            (y + 15) / 8
        } else if y < -7 {
            0
        } else {
            (y + 7) / 8
        }
    } else if y > -8 && ((y >= last - 7 && !on(last)) || (y < last - 7 && !on(y + 8))) {
        y / 8
    } else if (y < 0 && !on(0)) || !on(y) {
        (y + 7) / 8
    } else if y < -3 {
        0
    } else {
        (y + 3) / 8
    };

    (
        x_pos.clamp(0, SGB_MAP_WIDTH as i32 - 1) as usize,
        y_pos.clamp(0, SGB_MAP_HEIGHT as i32 - 1) as usize,
    )
}

fn color_at(data: &[u8; PALETTE_BYTES], i: usize) -> u16 {
    u16::from_le_bytes([data[i], data[i + 1]])
}

fn with_palette(entry: u16, palette: u16) -> u16 {
    (entry & !(7 << MAP_PALETTE_SHIFT)) | (palette << MAP_PALETTE_SHIFT)
}

/// Host layer controls for one GB layer given `count` host layers. On DMG
/// a single layer suffices since the backdrop is shared.
fn split_layer(
    words: &LayerWords,
    count: usize,
    gb: bool,
    tile_priority: bool,
) -> ([LayerControl; 3], usize) {
    match count {
        _ if gb => ([words.colors; 3], 1),
        1 => ([words.all; 3], 1),
        2 if tile_priority => ([words.all, words.overlay, words.overlay], 2),
        2 => ([words.color0, words.colors, words.colors], 2),
        _ => ([words.color0, words.colors, words.overlay], 3),
    }
}

fn set_layer(d: &mut HostDisplay, layer: &mut usize, control: LayerControl, hofs: i32, vofs: i32) {
    let l = &mut d.layers[*layer];
    l.control = control;
    l.hofs = hofs;
    l.vofs = vofs;
    *layer += 1;
}

pub struct Renderer {
    display: HostDisplay,
    mode: GbMode,
    border: BorderMode,
    window_disabled: bool,
    hblank_disabled: bool,
    interrupt_wait: InterruptWait,
    fast_forward: bool,
    graphics_disabled: bool,
    screen_disabled: bool,
    last_screen_disabled: bool,
    line_completed: [bool; SCREEN_LINES],
    did_vblank: bool,
    frame_counter: u64,
    gfx_mask: u8,
    sgb_map: [u8; SGB_MAP_LEN],
    vblank_tasks: Vec<VblankTask>,
    vsync: Option<Box<dyn VsyncSource>>,
}

impl Renderer {
    pub fn new(config: &CoreConfig, mode: GbMode) -> Self {
        Self {
            display: HostDisplay::new(),
            mode,
            border: config.border,
            window_disabled: config.window_disabled,
            hblank_disabled: config.hblank_disabled,
            interrupt_wait: config.interrupt_wait,
            fast_forward: config.fast_forward,
            graphics_disabled: false,
            screen_disabled: false,
            last_screen_disabled: false,
            line_completed: [false; SCREEN_LINES],
            did_vblank: false,
            frame_counter: 0,
            gfx_mask: 0,
            sgb_map: [0; SGB_MAP_LEN],
            vblank_tasks: Vec::new(),
            vsync: None,
        }
    }

    pub fn apply_config(&mut self, config: &CoreConfig) {
        self.border = config.border;
        self.window_disabled = config.window_disabled;
        self.hblank_disabled = config.hblank_disabled;
        self.interrupt_wait = config.interrupt_wait;
        self.fast_forward = config.fast_forward;
    }

    pub fn display(&self) -> &HostDisplay {
        &self.display
    }

    pub fn mode(&self) -> GbMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: GbMode) {
        self.mode = mode;
    }

    pub fn set_vsync(&mut self, vsync: Box<dyn VsyncSource>) {
        self.vsync = Some(vsync);
    }

    pub fn set_fast_forward(&mut self, on: bool) {
        self.fast_forward = on;
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn is_line_completed(&self, line: usize) -> bool {
        self.line_completed.get(line).copied().unwrap_or(false)
    }

    pub fn screen_disabled(&self) -> bool {
        self.screen_disabled
    }

    pub fn graphics_disabled(&self) -> bool {
        self.graphics_disabled
    }

    pub fn gfx_mask(&self) -> u8 {
        self.gfx_mask
    }

    /// Freeze the picture (SGB MASK_EN); nonzero skips frame updates.
    pub fn set_gfx_mask(&mut self, mask: u8) {
        self.gfx_mask = mask;
    }

    pub fn sgb_map(&self) -> &[u8; SGB_MAP_LEN] {
        &self.sgb_map
    }

    pub fn sgb_map_mut(&mut self) -> &mut [u8; SGB_MAP_LEN] {
        &mut self.sgb_map
    }

    /// Queue `task` for the next vertical blank.
    pub fn schedule_at_vblank(&mut self, task: VblankTask) {
        self.vblank_tasks.push(task);
    }

    pub fn pending_vblank_tasks(&self) -> usize {
        self.vblank_tasks.len()
    }

    /// Horizontal-blank entry point for GB line `line`.
    ///
    /// Line 0 is drawn ahead of the visible area; later lines first catch up
    /// on the previous line if it was captured but never drawn.
    pub fn hblank(&mut self, line: usize, pipeline: &ScanlinePipeline, tile_priority: [i32; 2]) {
        if line >= SCREEN_LINES || self.graphics_disabled {
            return;
        }
        let drawing = pipeline.drawing();

        if line == 0 {
            if drawing[0].modified {
                self.draw_line(0, drawing, tile_priority);
            }
            self.line_completed[0] = true;
            return;
        }
        if self.hblank_disabled {
            return;
        }

        if drawing[line - 1].modified && !self.line_completed[line - 1] {
            self.draw_line(line - 1, drawing, tile_priority);
        }
        if !drawing[line].modified {
            return;
        }
        self.line_completed[line] = true;
        self.draw_line(line, drawing, tile_priority);
    }

    /// Host vertical-blank entry point. Runs the tasks queued before this
    /// call; tasks they queue wait for the next blank.
    pub fn vblank(&mut self) {
        self.did_vblank = true;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        self.line_completed = [false; SCREEN_LINES];

        let tasks = std::mem::take(&mut self.vblank_tasks);
        for task in tasks {
            task(self);
        }
    }

    /// Emulated frame boundary: pace against the host, swap the scanline
    /// buffers and redraw changed tiles and maps.
    pub fn end_frame(&mut self, pipeline: &mut ScanlinePipeline, vram: &mut VramTracker, lcdc: u8) {
        if !self.fast_forward {
            let wait = match self.interrupt_wait {
                InterruptWait::Always => true,
                InterruptWait::WhenBehind => !self.did_vblank,
            };
            if wait {
                if let Some(vsync) = self.vsync.as_mut() {
                    vsync.wait_for_vblank();
                    self.vblank();
                }
            }
        }
        self.did_vblank = false;

        if self.gfx_mask != 0 {
            return;
        }

        pipeline.swap_buffers();

        let lcd_off = lcdc & 0x80 == 0;
        self.screen_disabled = self.last_screen_disabled || lcd_off;
        self.last_screen_disabled = lcd_off;

        let redrawn = vram.flush(self);
        if redrawn > 0 {
            debug!("frame {}: redrew {redrawn} tiles/cells", self.frame_counter);
        }

        if self.mode == GbMode::Sgb {
            self.refresh_sgb_palette(pipeline.drawing());
        }
    }

    /// Redraw every tile and map cell and resynchronise the screen state.
    pub fn refresh_all(&mut self, vram: &mut VramTracker, pipeline: &mut ScanlinePipeline, lcdc: u8) {
        vram.refresh_all(self);
        self.last_screen_disabled = lcdc & 0x80 == 0;
        self.screen_disabled = self.last_screen_disabled;
        pipeline.reset_window();
    }

    /// Blank the screen and stop drawing until [`Renderer::enable`].
    pub fn clear(&mut self) {
        self.graphics_disabled = true;
        let loaded = self.border.is_loaded();
        let d = &mut self.display;
        let used = if loaded { 3 } else { 4 };
        d.layers[..used].iter_mut().for_each(|l| l.enabled = false);
        d.sprites_enabled = false;
        d.bg_palette[OFF_MAP_PALETTE_INDEX] = if loaded { WHITE } else { BLACK };
        d.layers[0].control = LayerControl::OFF;
        d.layers[0].enabled = true;
    }

    pub fn enable(&mut self) {
        self.graphics_disabled = false;
        let d = &mut self.display;
        d.layers.iter_mut().for_each(|l| l.enabled = true);
        d.bg_palette[OFF_MAP_PALETTE_INDEX] = WHITE;
    }

    /// Drop pending tasks and per-frame progress (ROM unload or reset).
    pub fn discard_pending(&mut self) {
        self.vblank_tasks.clear();
        self.line_completed = [false; SCREEN_LINES];
        self.did_vblank = false;
    }

    /// Load every BG palette straight from palette RAM so the first frame
    /// after a ROM load doesn't flash stale colours.
    pub fn prime_palettes(&mut self, bg: &[u8; PALETTE_BYTES]) {
        for pid in 0..8 {
            self.load_bg_palette_cgb(pid, bg);
        }
    }

    fn draw_line(&mut self, line: usize, drawing: &[ScanlineState], tile_priority: [i32; 2]) {
        let state = &drawing[line];

        if self.screen_disabled {
            let d = &mut self.display;
            d.sprites_enabled = false;
            d.layers[0].control = LayerControl {
                map: MapPlane::Off,
                ..LayerControl::default()
            };
            d.window_inside |= (if self.border.is_loaded() { 7 } else { 15 }) << 8;
            return;
        }

        if state.maps_modified {
            self.compose_layers(line, state, tile_priority);
        }

        if state.bg_palettes_modified {
            if self.mode.is_cgb() {
                for pid in 0..8 {
                    self.load_bg_palette_cgb(pid, &state.bg_palette);
                }
            } else {
                for pid in 0..4 {
                    self.load_bg_palette_dmg(pid, &state.bg_palette, state.bg_pal);
                }
            }
        }

        if state.spr_palettes_modified {
            if self.mode == GbMode::Gb {
                for pid in 0..4 {
                    self.load_sprite_palette(pid, &state.spr_palette, state.spr_pal[0]);
                    self.load_sprite_palette(pid + 4, &state.spr_palette, state.spr_pal[1]);
                }
            } else {
                for pid in 0..8 {
                    self.load_sprite_palette(pid, &state.spr_palette, 0);
                }
            }
        }

        if state.sprites_modified {
            self.draw_sprites(&state.sprites, state.tall_sprites, drawing);
        }
    }

    fn compose_layers(&mut self, line: usize, state: &ScanlineState, tile_priority: [i32; 2]) {
        let gb = self.mode == GbMode::Gb;
        let bg_prio = tile_priority[state.bg_map] != 0;
        let win_prio = tile_priority[state.win_map] != 0;
        let plan = plan_layers(
            state.win_on && !self.window_disabled,
            state.win_x,
            self.border.is_loaded(),
            bg_prio,
            win_prio,
        );

        let d = &mut self.display;
        d.sprites_enabled = state.sprites_on;
        if plan.win == 0 {
            d.window0_x = SCREEN_OFFSET_X + 160;
            d.window0_y = SCREEN_OFFSET_Y;
        }
        d.window_inside |= 15 << 8;

        let mut layer = 0;

        if plan.win != 0 {
            let whofs = -(state.win_x as i32 - 7) - SCREEN_OFFSET_X;
            let wvofs = -(line as i32 - state.win_pos_y) - SCREEN_OFFSET_Y;
            let (controls, n) = split_layer(&state.win, plan.win, gb, win_prio);
            for &c in &controls[..n] {
                set_layer(d, &mut layer, c, whofs, wvofs);
            }

            d.window0_x = if state.win_x <= 7 {
                SCREEN_OFFSET_X
            } else {
                state.win_x as i32 - 7 + SCREEN_OFFSET_X
            };
            d.window_inside &= !15;
            for i in 0..layer {
                d.window_inside &= !(1 << (8 + i));
                d.window_inside |= 1 << i;
            }
        }

        if plan.bg != 0 {
            let hofs = state.hofs as i32 - SCREEN_OFFSET_X;
            let vofs = state.vofs as i32 - SCREEN_OFFSET_Y;
            let (controls, n) = split_layer(&state.bg, plan.bg, gb, bg_prio);
            for &c in &controls[..n] {
                set_layer(d, &mut layer, c, hofs, vofs);
            }
        }

        if gb {
            // BG and window share one backdrop layer, shown over the window
            // area too.
            d.window_inside |= 1 << layer;
            set_layer(d, &mut layer, state.win.color0, 0, 0);
        }
        for i in layer..HOST_LAYERS {
            d.window_inside &= !((1 << i) << 8);
            d.window_inside &= !(1 << i);
        }
    }

    fn load_bg_palette_dmg(&mut self, pid: usize, data: &[u8; PALETTE_BYTES], dmg_pal: u8) {
        for i in 0..4 {
            let id = ((dmg_pal >> (i * 2)) & 3) as usize;
            self.display.bg_palette[pid * 16 + i + 1] = color_at(data, pid * 8 + id * 2);
        }
    }

    fn load_bg_palette_cgb(&mut self, pid: usize, data: &[u8; PALETTE_BYTES]) {
        for i in 0..4 {
            self.display.bg_palette[pid * 16 + i + 1] = color_at(data, pid * 8 + i * 2);
        }
    }

    fn load_sprite_palette(&mut self, pid: usize, data: &[u8; PALETTE_BYTES], dmg_pal: u8) {
        let gb = self.mode == GbMode::Gb;
        let src = if gb && pid >= 4 { pid - 4 } else { pid };
        for i in 0..4 {
            let id = if gb {
                ((dmg_pal >> (i * 2)) & 3) as usize
            } else {
                i
            };
            self.display.sprite_palette[pid * 16 + i] = color_at(data, src * 8 + id * 2);
        }
    }

    fn draw_sprites(&mut self, data: &[u8; OAM_SIZE], tall: bool, drawing: &[ScanlineState]) {
        for (i, entry) in data.chunks_exact(4).take(GB_SPRITES).enumerate() {
            let slot = FIRST_GB_SPRITE + i;
            if entry[0] == 0 {
                self.display.sprites[slot] = HostSprite::Hidden;
                continue;
            }

            let y = entry[0] as i32 - 16;
            let x = entry[1] as i32 - 8;
            let mut tile = entry[2] as u16;
            if tall {
                tile &= !1;
            }
            let attr = entry[3];
            let high_palette = attr & 0x10 != 0;

            let (bank, palette) = match self.mode {
                GbMode::Cgb => (u16::from(attr & 0x08 != 0), attr & 0x07),
                GbMode::Sgb => {
                    let (cx, cy) = sgb_sprite_cell(x, y, tall, drawing);
                    let base = self.sgb_map[cy * SGB_MAP_WIDTH + cx] & 3;
                    (0, base + if high_palette { 4 } else { 0 })
                }
                GbMode::Gb => (0, if high_palette { 5 } else { 0 }),
            };

            self.display.sprites[slot] = HostSprite::Visible(SpriteAttrs {
                x: x + SCREEN_OFFSET_X,
                y: y + SCREEN_OFFSET_Y,
                tile: tile + bank * 0x100,
                tall,
                flip_x: attr & 0x20 != 0,
                flip_y: attr & 0x40 != 0,
                palette,
                priority: if attr & 0x80 != 0 {
                    SPRITE_PRIORITY_LOW
                } else {
                    SPRITE_PRIORITY
                },
            });
        }
    }

    /// Push the SGB attribute map's palettes into the BG and window map
    /// entries, following scroll and window position line by line.
    pub fn refresh_sgb_palette(&mut self, drawing: &[ScanlineState]) {
        let mut bg_map = 0;
        let mut win_map = 0;
        let mut win_on = false;
        let (mut hofs, mut vofs, mut win_x, mut win_y) = (0i32, 0i32, 0i32, 0i32);

        for y in 0..SGB_MAP_HEIGHT as i32 {
            let mut win_just_disabled = false;
            for y_pix in (y * 8 - 7).max(0)..=y * 8 {
                let s = &drawing[y_pix as usize];
                if s.modified && s.maps_modified {
                    if !win_just_disabled {
                        win_just_disabled = win_on && !s.win_on;
                    }
                    win_on = s.win_on;
                    win_x = s.win_x as i32;
                    win_y = s.win_y as i32;
                    hofs = s.hofs as i32;
                    vofs = s.vofs as i32;
                    win_map = s.win_map;
                    bg_map = s.bg_map;
                }
            }

            for x in 0..SGB_MAP_WIDTH as i32 {
                let palette = (self.sgb_map[(y * 20 + x) as usize] & 3) as u16;
                // Tiles scrolling in at the edges take their neighbour's
                // palette.
                let x_loop = if x == 19 { 2 } else { 1 };

                let y_loop = if y == 0 || win_just_disabled { 2 } else { 1 };
                for yl in (0..y_loop).rev() {
                    for j in 0..x_loop {
                        let real_x = (((x + j) * 8 + hofs) & 0xFF) / 8;
                        let real_y = (((y - yl) * 8 + vofs + 7) & 0xFF) / 8;
                        let cell = &mut self.display.maps[bg_map][(real_y * 32 + real_x) as usize];
                        *cell = with_palette(*cell, palette);
                    }
                }

                if !win_on {
                    continue;
                }
                let y_loop = if y == 17 { 2 } else { 1 };
                for yl in (0..y_loop).rev() {
                    for j in 0..x_loop {
                        let real_x = ((x + j) * 8 - (win_x - 7)) / 8;
                        let real_y = ((y + yl) * 8 - win_y) / 8;
                        if (0..32).contains(&real_x) && (0..32).contains(&real_y) {
                            let cell =
                                &mut self.display.maps[win_map][(real_y * 32 + real_x) as usize];
                            *cell = with_palette(*cell, palette);
                        }
                    }
                }
            }
        }
    }
}

impl VramSink for Renderer {
    fn redraw_tile(&mut self, bank: usize, tile: usize, vram: &VramBanks) {
        let src = &vram[bank][tile * 16..tile * 16 + 16];
        let mut nonzero: TileBitmap = [0; 64];
        let mut all: TileBitmap = [0; 64];
        let mut sprite: TileBitmap = [0; 64];

        for row in 0..8 {
            let lo = src[row * 2];
            let hi = src[row * 2 + 1];
            for x in 0..8 {
                let bit = 7 - x;
                let color = ((lo >> bit) & 1) | (((hi >> bit) & 1) << 1);
                let p = row * 8 + x;
                all[p] = color + 1;
                nonzero[p] = if color != 0 { color + 1 } else { 0 };
                sprite[p] = color;
            }
        }

        let tiles = &mut self.display.tiles;
        if tile < 0x100 {
            let slot = bank * 0x100 + tile;
            tiles.nonzero[0][slot] = nonzero;
            tiles.all[0][slot] = all;
            tiles.sprite[slot] = sprite;
        }
        if tile >= 0x80 {
            let slot = bank * 0x100 + (tile & 0xFF);
            tiles.nonzero[1][slot] = nonzero;
            tiles.all[1][slot] = all;
        }
    }

    fn redraw_map_cell(&mut self, map: usize, cell: usize, vram: &VramBanks) {
        let addr = 0x1800 + map * MAP_CELLS + cell;
        let tile = vram[0][addr] as u16;

        let mut entry = tile;
        let mut palette = 0;
        let mut priority = false;
        if self.mode.is_cgb() {
            let attr = vram[1][addr];
            palette = (attr & 0x07) as u16;
            priority = attr & 0x80 != 0;
            entry += u16::from(attr & 0x08 != 0) * 0x100;
            entry |= palette << MAP_PALETTE_SHIFT;
            if attr & 0x20 != 0 {
                entry |= MAP_FLIP_X;
            }
            if attr & 0x40 != 0 {
                entry |= MAP_FLIP_Y;
            }
        }

        let d = &mut self.display;
        d.overlay_maps[map][cell] = if priority { entry } else { BLANK_OVERLAY };
        d.maps[map][cell] = entry;
        d.color0_maps[map][cell] = palette << MAP_PALETTE_SHIFT;
    }
}
