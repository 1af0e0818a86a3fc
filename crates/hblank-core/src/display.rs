//! Register-level model of the tiled composition hardware the renderer
//! programs: four background layers, a sprite table, two 256-colour
//! palettes, map planes and decoded tile bitmaps.

use crate::scanline::{LayerControl, MapPlane};

/// Position of the GB screen inside the host frame.
pub const SCREEN_OFFSET_X: i32 = 48;
pub const SCREEN_OFFSET_Y: i32 = 24;

pub const HOST_LAYERS: usize = 4;
pub const HOST_SPRITES: usize = 128;
/// Host sprite slot of GB sprite 0.
pub const FIRST_GB_SPRITE: usize = 88;
pub const MAP_ENTRIES: usize = 0x400;
pub const TILE_SLOTS: usize = 0x200;
pub const OFF_MAP_PALETTE_INDEX: usize = 15 * 16 + 1;

/// Map entries hold the tile slot in bits 0-9, flips in 10-11 and the
/// palette in 12-15.
pub const MAP_FLIP_X: u16 = 1 << 10;
pub const MAP_FLIP_Y: u16 = 1 << 11;
pub const MAP_PALETTE_SHIFT: u16 = 12;
/// Overlay entry for cells without the priority attribute.
pub const BLANK_OVERLAY: u16 = 0x300;

pub const WHITE: u16 = 0x7FFF;
pub const BLACK: u16 = 0x0000;

/// Pixels of one decoded 8x8 tile, row-major.
pub type TileBitmap = [u8; 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostLayer {
    pub enabled: bool,
    pub control: LayerControl,
    pub hofs: i32,
    pub vofs: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpriteAttrs {
    /// Host-space position.
    pub x: i32,
    pub y: i32,
    /// Tile slot including the VRAM bank.
    pub tile: u16,
    pub tall: bool,
    pub flip_x: bool,
    pub flip_y: bool,
    pub palette: u8,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostSprite {
    #[default]
    Disabled,
    /// Off-screen but still allocated; attributes are kept.
    Hidden,
    Visible(SpriteAttrs),
}

/// Decoded tile data, indexed `[unsigned, signed]` for the BG sets.
pub struct TileBanks {
    pub nonzero: [Vec<TileBitmap>; 2],
    pub all: [Vec<TileBitmap>; 2],
    pub sprite: Vec<TileBitmap>,
}

impl TileBanks {
    fn new() -> Self {
        let plane = || vec![[0u8; 64]; TILE_SLOTS];
        Self {
            nonzero: [plane(), plane()],
            all: [plane(), plane()],
            sprite: plane(),
        }
    }
}

pub struct HostDisplay {
    pub layers: [HostLayer; HOST_LAYERS],
    /// Bits 0-3 enable layers inside window 0 (the GB window area), bits
    /// 8-11 inside window 1 (the rest of the GB screen).
    pub window_inside: u16,
    pub window0_x: i32,
    pub window0_y: i32,
    pub sprites_enabled: bool,
    pub sprites: [HostSprite; HOST_SPRITES],
    pub bg_palette: [u16; 256],
    pub sprite_palette: [u16; 256],
    pub maps: [[u16; MAP_ENTRIES]; 2],
    pub color0_maps: [[u16; MAP_ENTRIES]; 2],
    pub overlay_maps: [[u16; MAP_ENTRIES]; 2],
    pub off_map: [u16; MAP_ENTRIES],
    pub tiles: TileBanks,
}

impl HostDisplay {
    pub fn new() -> Self {
        let mut display = Self {
            layers: [HostLayer::default(); HOST_LAYERS],
            window_inside: (1 << 4) | (1 << 12) | 1,
            window0_x: SCREEN_OFFSET_X,
            window0_y: SCREEN_OFFSET_Y,
            sprites_enabled: false,
            sprites: [HostSprite::Disabled; HOST_SPRITES],
            bg_palette: [0; 256],
            sprite_palette: [0; 256],
            maps: [[0; MAP_ENTRIES]; 2],
            color0_maps: [[0; MAP_ENTRIES]; 2],
            overlay_maps: [[BLANK_OVERLAY; MAP_ENTRIES]; 2],
            off_map: [15 << MAP_PALETTE_SHIFT; MAP_ENTRIES],
            tiles: TileBanks::new(),
        };
        display.layers.iter_mut().for_each(|l| l.enabled = true);
        display.bg_palette[OFF_MAP_PALETTE_INDEX] = WHITE;
        display
    }

    pub fn map_plane(&self, plane: MapPlane) -> &[u16; MAP_ENTRIES] {
        match plane {
            MapPlane::Off => &self.off_map,
            MapPlane::Normal(m) => &self.maps[m as usize & 1],
            MapPlane::Color0(m) => &self.color0_maps[m as usize & 1],
            MapPlane::Overlay(m) => &self.overlay_maps[m as usize & 1],
        }
    }

    pub fn gb_sprite(&self, index: usize) -> HostSprite {
        self.sprites[FIRST_GB_SPRITE + index]
    }
}

impl Default for HostDisplay {
    fn default() -> Self {
        Self::new()
    }
}
