//! Video RAM with change tracking.
//!
//! Writes that actually change a byte queue the affected tile or map cell
//! for redraw. Each index sits in a queue at most once; a parallel flag
//! array guards against duplicates. Queues drain last-in first-out.

pub const VRAM_BANK_SIZE: usize = 0x2000;
pub const TILES_PER_BANK: usize = 0x180;
pub const MAP_CELLS: usize = 0x400;

const MAP_BASE: usize = 0x1800;
const ATTR_PRIORITY: u8 = 0x80;

/// Lines during which the rasterizer has already consumed tile data for the
/// frame in progress. Single-byte writes here land in the next frame.
const LATE_TILE_LINES: std::ops::Range<u8> = 128..144;

pub type VramBanks = [[u8; VRAM_BANK_SIZE]; 2];

/// Consumer of queued VRAM changes.
pub trait VramSink {
    fn redraw_tile(&mut self, bank: usize, tile: usize, vram: &VramBanks);
    fn redraw_map_cell(&mut self, map: usize, cell: usize, vram: &VramBanks);
}

#[derive(Debug, Clone)]
struct IndexQueue {
    items: Vec<u16>,
    queued: Vec<bool>,
}

impl IndexQueue {
    fn new(slots: usize) -> Self {
        Self {
            items: Vec::with_capacity(slots),
            queued: vec![false; slots],
        }
    }

    fn push(&mut self, idx: usize) {
        if !self.queued[idx] {
            self.queued[idx] = true;
            self.items.push(idx as u16);
        }
    }

    fn pop(&mut self) -> Option<usize> {
        let idx = self.items.pop()? as usize;
        self.queued[idx] = false;
        Some(idx)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn contains(&self, idx: usize) -> bool {
        self.queued.get(idx).copied().unwrap_or(false)
    }

    fn clear(&mut self) {
        self.items.clear();
        self.queued.fill(false);
    }
}

/// Tile queue entries pack the bank above the tile number.
fn tile_key(bank: usize, tile: usize) -> usize {
    bank * TILES_PER_BANK + tile
}

fn split_tile_key(key: usize) -> (usize, usize) {
    (key / TILES_PER_BANK, key % TILES_PER_BANK)
}

pub struct VramTracker {
    data: Box<VramBanks>,
    bank: usize,
    tiles: IndexQueue,
    tiles_next_frame: IndexQueue,
    maps: [IndexQueue; 2],
    tile_priority: [i32; 2],
}

impl VramTracker {
    pub fn new() -> Self {
        Self {
            data: Box::new([[0; VRAM_BANK_SIZE]; 2]),
            bank: 0,
            tiles: IndexQueue::new(TILES_PER_BANK * 2),
            tiles_next_frame: IndexQueue::new(TILES_PER_BANK * 2),
            maps: [IndexQueue::new(MAP_CELLS), IndexQueue::new(MAP_CELLS)],
            tile_priority: [0; 2],
        }
    }

    pub fn banks(&self) -> &VramBanks {
        &self.data
    }

    pub fn bank(&self) -> usize {
        self.bank
    }

    pub fn select_bank(&mut self, bank: usize) {
        self.bank = bank & 1;
    }

    pub fn read(&self, addr: u16) -> u8 {
        self.data[self.bank][addr as usize & (VRAM_BANK_SIZE - 1)]
    }

    /// Map cells in `map` whose attribute byte has the BG-priority bit set.
    pub fn tile_priority_count(&self, map: usize) -> i32 {
        self.tile_priority[map]
    }

    pub fn tile_priority_counts(&self) -> [i32; 2] {
        self.tile_priority
    }

    pub fn pending_tiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn pending_next_frame(&self) -> usize {
        self.tiles_next_frame.len()
    }

    pub fn pending_map_cells(&self, map: usize) -> usize {
        self.maps[map].len()
    }

    pub fn is_tile_queued(&self, bank: usize, tile: usize) -> bool {
        self.tiles.contains(tile_key(bank, tile))
    }

    pub fn is_tile_deferred(&self, bank: usize, tile: usize) -> bool {
        self.tiles_next_frame.contains(tile_key(bank, tile))
    }

    /// CPU write into the current bank while the LCD is on line `ly`.
    pub fn write(&mut self, addr: u16, val: u8, ly: u8) {
        let addr = addr as usize & (VRAM_BANK_SIZE - 1);
        let bank = self.bank;
        let old = self.data[bank][addr];
        if old == val {
            return;
        }
        self.data[bank][addr] = val;

        if addr < MAP_BASE {
            let key = tile_key(bank, addr / 16);
            if LATE_TILE_LINES.contains(&ly) {
                self.tiles_next_frame.push(key);
            } else {
                self.tiles.push(key);
            }
        } else {
            let map = (addr - MAP_BASE) / MAP_CELLS;
            if bank == 1 {
                self.track_priority(map, old, val);
            }
            self.maps[map].push(addr & (MAP_CELLS - 1));
        }
    }

    /// 16-byte block write used by CGB DMA. `dest` is aligned to 16.
    ///
    /// Unlike single writes, every block landing while the screen is still
    /// being drawn (`ly < 144`) is deferred to the next frame.
    pub fn write_block(&mut self, dest: u16, src: &[u8; 16], ly: u8) {
        let dest = dest as usize & (VRAM_BANK_SIZE - 1) & !0xF;
        let bank = self.bank;
        let map_attrs = bank == 1 && dest >= MAP_BASE;

        let mut changed = false;
        for (i, &val) in src.iter().enumerate() {
            let addr = dest + i;
            let old = self.data[bank][addr];
            if old != val {
                changed = true;
                if map_attrs {
                    self.track_priority((addr - MAP_BASE) / MAP_CELLS, old, val);
                }
                self.data[bank][addr] = val;
            }
        }
        if !changed {
            return;
        }

        if dest < MAP_BASE {
            let key = tile_key(bank, dest / 16);
            if ly < 144 {
                self.tiles_next_frame.push(key);
            } else {
                self.tiles.push(key);
            }
        } else {
            let map = (dest - MAP_BASE) / MAP_CELLS;
            for i in 0..16 {
                self.maps[map].push((dest + i) & (MAP_CELLS - 1));
            }
        }
    }

    fn track_priority(&mut self, map: usize, old: u8, val: u8) {
        match (old & ATTR_PRIORITY != 0, val & ATTR_PRIORITY != 0) {
            (false, true) => self.tile_priority[map] += 1,
            (true, false) => self.tile_priority[map] -= 1,
            _ => {}
        }
    }

    /// Redraw every queued tile, then promote deferred tiles so they are
    /// drawn on the next flush.
    pub fn flush_tiles(&mut self, sink: &mut dyn VramSink) -> usize {
        let mut drawn = 0;
        while let Some(key) = self.tiles.pop() {
            let (bank, tile) = split_tile_key(key);
            sink.redraw_tile(bank, tile, &self.data);
            drawn += 1;
        }
        while let Some(key) = self.tiles_next_frame.pop() {
            self.tiles.push(key);
        }
        drawn
    }

    pub fn flush_maps(&mut self, sink: &mut dyn VramSink) -> usize {
        let mut drawn = 0;
        for map in 0..2 {
            while let Some(cell) = self.maps[map].pop() {
                sink.redraw_map_cell(map, cell, &self.data);
                drawn += 1;
            }
        }
        drawn
    }

    /// Frame-boundary flush of tiles and then maps.
    pub fn flush(&mut self, sink: &mut dyn VramSink) -> usize {
        self.flush_tiles(sink) + self.flush_maps(sink)
    }

    /// Redraw everything, drop all queues and recount the priority cells.
    pub fn refresh_all(&mut self, sink: &mut dyn VramSink) {
        for tile in 0..TILES_PER_BANK {
            sink.redraw_tile(0, tile, &self.data);
            sink.redraw_tile(1, tile, &self.data);
        }
        for cell in 0..MAP_CELLS {
            sink.redraw_map_cell(0, cell, &self.data);
            sink.redraw_map_cell(1, cell, &self.data);
        }
        self.clear_queues();
        self.recount_priority();
    }

    pub fn clear_queues(&mut self) {
        self.tiles.clear();
        self.tiles_next_frame.clear();
        self.maps[0].clear();
        self.maps[1].clear();
    }

    fn recount_priority(&mut self) {
        for (map, count) in self.tile_priority.iter_mut().enumerate() {
            let start = MAP_BASE + map * MAP_CELLS;
            *count = self.data[1][start..start + MAP_CELLS]
                .iter()
                .filter(|&&b| b & ATTR_PRIORITY != 0)
                .count() as i32;
        }
    }

    /// Replace both banks wholesale (state load). Queues are dropped; call
    /// `refresh_all` afterwards.
    pub fn load(&mut self, banks: &VramBanks) {
        self.data.copy_from_slice(banks);
        self.clear_queues();
        self.recount_priority();
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|b| b.fill(0));
        self.bank = 0;
        self.clear_queues();
        self.tile_priority = [0; 2];
    }
}

impl Default for VramTracker {
    fn default() -> Self {
        Self::new()
    }
}
