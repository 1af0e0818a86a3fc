//! Per-scanline register snapshots.
//!
//! Video register writes only raise dirty flags. At the end of mode 3 the
//! pipeline copies whatever those flags cover into the rendering buffer's
//! entry for the line; a line with nothing dirty is left unmodified and the
//! renderer keeps the previous line's hardware setup for it. Two buffers
//! alternate roles at every frame boundary.

pub const SCREEN_LINES: usize = 144;
pub const OAM_SIZE: usize = 0xA0;
pub const PALETTE_BYTES: usize = 0x40;

/// Window-X values at or above this hide the window.
pub const WINDOW_X_HIDDEN: u8 = 167;

/// Map plane read by a host layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapPlane {
    /// Constant map shown while the LCD is off.
    #[default]
    Off,
    /// Tile numbers with attributes, one per map.
    Normal(u8),
    /// Palette-only entries over the solid colour-0 tile.
    Color0(u8),
    /// Entries for priority tiles only; other cells are blank.
    Overlay(u8),
}

/// Tile bitmap set a host layer draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileSet {
    /// One tile filled with colour 0.
    #[default]
    Solid,
    /// Colours 1-3 only, colour 0 transparent.
    NonZero { signed: bool },
    /// All four colours opaque.
    All { signed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerControl {
    pub map: MapPlane,
    pub tiles: TileSet,
    /// Host priority, 0 drawn in front.
    pub priority: u8,
}

impl LayerControl {
    pub const OFF: Self = Self {
        map: MapPlane::Off,
        tiles: TileSet::Solid,
        priority: 3,
    };

    const fn new(map: MapPlane, tiles: TileSet, priority: u8) -> Self {
        Self {
            map,
            tiles,
            priority,
        }
    }
}

const COLOR0_PRIORITY: u8 = 3;
const COLORS_PRIORITY: u8 = 2;
const OVERLAY_PRIORITY: u8 = 1;
const ALL_PRIORITY: u8 = 2;

/// The four ways one GB layer can be split across host layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerWords {
    pub color0: LayerControl,
    pub colors: LayerControl,
    pub overlay: LayerControl,
    pub all: LayerControl,
}

impl LayerWords {
    const OFF: Self = Self {
        color0: LayerControl::OFF,
        colors: LayerControl::OFF,
        overlay: LayerControl::OFF,
        all: LayerControl::OFF,
    };

    fn for_map(map: u8, signed: bool, tile_priority: bool) -> Self {
        let overlay_priority = if tile_priority {
            OVERLAY_PRIORITY
        } else {
            COLORS_PRIORITY
        };
        Self {
            color0: LayerControl::new(MapPlane::Color0(map), TileSet::Solid, COLOR0_PRIORITY),
            colors: LayerControl::new(
                MapPlane::Normal(map),
                TileSet::NonZero { signed },
                COLORS_PRIORITY,
            ),
            overlay: LayerControl::new(
                MapPlane::Overlay(map),
                TileSet::NonZero { signed },
                overlay_priority,
            ),
            all: LayerControl::new(MapPlane::Normal(map), TileSet::All { signed }, ALL_PRIORITY),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanlineState {
    pub modified: bool,
    pub maps_modified: bool,
    pub bg_palettes_modified: bool,
    pub spr_palettes_modified: bool,
    pub sprites_modified: bool,

    pub sprites_on: bool,
    pub tall_sprites: bool,
    pub sprites: [u8; OAM_SIZE],

    pub bg_map: usize,
    pub win_map: usize,
    pub tile_signed: bool,
    pub bg: LayerWords,
    pub win: LayerWords,
    pub win_on: bool,
    pub hofs: u8,
    pub vofs: u8,
    pub win_x: u8,
    pub win_y: u8,
    pub win_pos_y: i32,

    pub bg_pal: u8,
    pub spr_pal: [u8; 2],
    pub bg_palette: [u8; PALETTE_BYTES],
    pub spr_palette: [u8; PALETTE_BYTES],
    pub bg_hash: u32,
}

impl Default for ScanlineState {
    fn default() -> Self {
        Self {
            modified: false,
            maps_modified: false,
            bg_palettes_modified: false,
            spr_palettes_modified: false,
            sprites_modified: false,
            sprites_on: false,
            tall_sprites: false,
            sprites: [0; OAM_SIZE],
            bg_map: 0,
            win_map: 0,
            tile_signed: false,
            bg: LayerWords::default(),
            win: LayerWords::default(),
            win_on: false,
            hofs: 0,
            vofs: 0,
            win_x: 0,
            win_y: 0,
            win_pos_y: -1,
            bg_pal: 0,
            spr_pal: [0; 2],
            bg_palette: [0; PALETTE_BYTES],
            spr_palette: [0; PALETTE_BYTES],
            bg_hash: 0,
        }
    }
}

/// Internal window line counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowRow {
    /// Not started this frame.
    #[default]
    Disabled,
    /// WY was written at or above the current line; the next capture
    /// derives the row from LY - WY.
    PendingReset,
    Row(i32),
}

impl WindowRow {
    /// Legacy encoding: -1 disabled, -2 pending, else the row.
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Disabled => -1,
            Self::PendingReset => -2,
            Self::Row(n) => n,
        }
    }
}

/// Dirty flags raised by register writes since the last capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyFlags {
    pub line: bool,
    pub maps: bool,
    pub bg_palettes: bool,
    pub spr_palettes: bool,
    pub sprites: bool,
}

/// Register and memory state read at capture time.
pub struct CaptureInput<'a> {
    pub lcdc: u8,
    pub scy: u8,
    pub scx: u8,
    pub ly: u8,
    pub wy: u8,
    pub bgp: u8,
    pub obp0: u8,
    pub obp1: u8,
    pub cgb: bool,
    pub oam: &'a [u8; OAM_SIZE],
    pub bg_palette: &'a [u8; PALETTE_BYTES],
    pub spr_palette: &'a [u8; PALETTE_BYTES],
}

/// djb2-style hash over the palette as sixteen little-endian words.
pub fn palette_hash(data: &[u8; PALETTE_BYTES]) -> u32 {
    data.chunks_exact(4).fold(0u32, |hash, word| {
        let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        (hash << 5).wrapping_add(hash).wrapping_add(w)
    })
}

pub struct ScanlinePipeline {
    buffers: [Vec<ScanlineState>; 2],
    rendering: usize,
    dirty: DirtyFlags,
    window_row: WindowRow,
    win_x: u8,
    hblank_disabled: bool,
}

impl ScanlinePipeline {
    pub fn new() -> Self {
        Self {
            buffers: [
                vec![ScanlineState::default(); SCREEN_LINES],
                vec![ScanlineState::default(); SCREEN_LINES],
            ],
            rendering: 1,
            dirty: DirtyFlags::default(),
            window_row: WindowRow::Disabled,
            win_x: 0,
            hblank_disabled: false,
        }
    }

    pub fn set_hblank_disabled(&mut self, disabled: bool) {
        self.hblank_disabled = disabled;
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn window_row(&self) -> WindowRow {
        self.window_row
    }

    /// Window X as latched at the end of the last mode 2.
    pub fn window_x(&self) -> u8 {
        self.win_x
    }

    /// Buffer the renderer reads from.
    pub fn drawing(&self) -> &[ScanlineState] {
        &self.buffers[self.rendering ^ 1]
    }

    /// Buffer captures are written to.
    pub fn rendering(&self) -> &[ScanlineState] {
        &self.buffers[self.rendering]
    }

    pub fn mark_maps(&mut self) {
        self.dirty.line = true;
        self.dirty.maps = true;
    }

    pub fn mark_sprites(&mut self) {
        self.dirty.line = true;
        self.dirty.sprites = true;
    }

    pub fn mark_bg_palettes(&mut self) {
        self.dirty.line = true;
        self.dirty.bg_palettes = true;
    }

    pub fn mark_spr_palettes(&mut self) {
        self.dirty.line = true;
        self.dirty.spr_palettes = true;
    }

    /// Record a WY write made while the LCD is on line `ly`.
    pub fn window_y_written(&mut self, wy: u8, ly: u8) {
        self.window_row = if ly >= SCREEN_LINES as u8 || wy > ly {
            WindowRow::Disabled
        } else {
            WindowRow::PendingReset
        };
        self.mark_maps();
    }

    /// Latch WX at the end of mode 2.
    ///
    /// Shiren GB2 writes WX during mode 3 and expects the change, at least
    /// between shown (<167) and hidden (>=167), to appear on the following
    /// line only. Sampling WX here instead of at capture time reproduces
    /// that; no wider rule is implied.
    pub fn latch_window_x(&mut self, wx: u8) {
        if self.win_x != wx {
            self.win_x = wx;
            self.mark_maps();
        }
    }

    /// Snapshot the registers for `line` at the end of mode 3.
    pub fn capture(&mut self, line: usize, input: &CaptureInput<'_>) {
        if self.hblank_disabled || line >= SCREEN_LINES {
            return;
        }
        let lcdc = input.lcdc;
        let win_x = self.win_x;

        self.window_row = match self.window_row {
            WindowRow::PendingReset => WindowRow::Row(input.ly as i32 - input.wy as i32),
            row if lcdc & 0x20 != 0 && win_x < WINDOW_X_HIDDEN && input.wy as usize <= line => {
                WindowRow::Row(row.to_raw() + 1)
            }
            row => row,
        };

        let dirty = &mut self.dirty;
        let state = &mut self.buffers[self.rendering][line];
        state.sprites_on = lcdc & 0x02 != 0;

        if line == 0 {
            *dirty = DirtyFlags {
                line: true,
                maps: true,
                bg_palettes: true,
                spr_palettes: true,
                sprites: true,
            };
        } else if line == input.wy as usize {
            dirty.line = true;
            dirty.maps = true;
        } else if !dirty.line {
            state.modified = false;
            return;
        }
        state.modified = true;

        state.sprites_modified = dirty.sprites;
        if dirty.sprites {
            state.sprites.copy_from_slice(input.oam);
            state.tall_sprites = lcdc & 0x04 != 0;
            dirty.sprites = false;
        }

        state.maps_modified = dirty.maps;
        if dirty.maps {
            dirty.maps = false;
            let signed = lcdc & 0x10 == 0;
            state.win_map = usize::from(lcdc & 0x40 != 0);
            state.bg_map = usize::from(lcdc & 0x08 != 0);

            if !input.cgb && lcdc & 0x01 == 0 {
                state.win = LayerWords::OFF;
                state.bg = LayerWords::OFF;
            } else {
                let tile_priority = input.cgb && lcdc & 0x01 != 0;
                state.tile_signed = signed;
                state.win = LayerWords::for_map(state.win_map as u8, signed, tile_priority);
                state.bg = LayerWords::for_map(state.bg_map as u8, signed, tile_priority);
            }

            state.win_on = lcdc & 0x20 != 0
                && win_x < WINDOW_X_HIDDEN
                && input.wy < SCREEN_LINES as u8
                && input.wy as usize <= line;
            state.hofs = input.scx;
            state.vofs = input.scy;
            state.win_x = win_x;
            state.win_pos_y = self.window_row.to_raw();
            state.win_y = input.wy;
        }

        state.bg_palettes_modified = dirty.bg_palettes;
        if dirty.bg_palettes {
            dirty.bg_palettes = false;
            state.bg_pal = input.bgp;
            let hash = palette_hash(input.bg_palette);
            if state.bg_hash != hash || line == 0 {
                state.bg_hash = hash;
                state.bg_palette = *input.bg_palette;
            }
        }

        state.spr_palettes_modified = dirty.spr_palettes;
        if dirty.spr_palettes {
            dirty.spr_palettes = false;
            state.spr_pal = [input.obp0, input.obp1];
            state.spr_palette = *input.spr_palette;
        }

        dirty.line = false;
    }

    /// Exchange the drawing and rendering buffers and restart the window
    /// row counter. Called once per frame.
    pub fn swap_buffers(&mut self) {
        self.rendering ^= 1;
        self.window_row = WindowRow::Disabled;
    }

    pub fn reset_window(&mut self) {
        self.window_row = WindowRow::Disabled;
    }

    /// Discard every capture and pending flag.
    pub fn clear(&mut self) {
        for buf in &mut self.buffers {
            buf.iter_mut().for_each(|s| *s = ScanlineState::default());
        }
        self.dirty = DirtyFlags::default();
        self.window_row = WindowRow::Disabled;
        self.win_x = 0;
    }
}

impl Default for ScanlinePipeline {
    fn default() -> Self {
        Self::new()
    }
}
