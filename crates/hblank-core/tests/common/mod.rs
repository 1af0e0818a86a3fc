#![allow(dead_code)]

use std::{
    cell::Cell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use hblank_core::{
    GameBoy,
    bank_store::ROM_BANK_SIZE,
    cartridge::{Cartridge, TimeSource},
    config::{CoreConfig, GbMode},
};

/// T-cycles per LCD line.
pub const LINE_CYCLES: u32 = 456;
/// Cycles from the start of a frame to the start of VBlank.
pub const VBLANK_START: u32 = 144 * LINE_CYCLES;

/// Offset inside every bank where the builders store the bank number.
pub const TAG_OFFSET: usize = 0x0200;

/// Header-valid ROM image whose banks are tagged with their own number at
/// `TAG_OFFSET` (little-endian u16).
pub fn rom(cart_type: u8, ram_size: u8, banks: usize) -> Vec<u8> {
    RomBuilder::new(cart_type, banks).ram_size(ram_size).build()
}

pub struct RomBuilder {
    cart_type: u8,
    ram_size: u8,
    banks: usize,
    title: &'static [u8],
    cgb_flag: u8,
    sgb_flag: u8,
}

impl RomBuilder {
    pub fn new(cart_type: u8, banks: usize) -> Self {
        Self {
            cart_type,
            ram_size: 0,
            banks,
            title: b"TEST",
            cgb_flag: 0,
            sgb_flag: 0,
        }
    }

    pub fn ram_size(mut self, ram_size: u8) -> Self {
        self.ram_size = ram_size;
        self
    }

    pub fn title(mut self, title: &'static [u8]) -> Self {
        self.title = title;
        self
    }

    pub fn cgb(mut self) -> Self {
        self.cgb_flag = 0x80;
        self
    }

    pub fn sgb(mut self) -> Self {
        self.sgb_flag = 0x03;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut data = vec![0u8; self.banks * ROM_BANK_SIZE];
        for (i, chunk) in data.chunks_exact_mut(ROM_BANK_SIZE).enumerate() {
            chunk[TAG_OFFSET] = i as u8;
            chunk[TAG_OFFSET + 1] = (i >> 8) as u8;
        }
        data[0x0134..0x0134 + self.title.len()].copy_from_slice(self.title);
        data[0x0143] = self.cgb_flag;
        data[0x0146] = self.sgb_flag;
        data[0x0147] = self.cart_type;
        data[0x0149] = self.ram_size;
        data
    }
}

pub fn cart(cart_type: u8, ram_size: u8, banks: usize) -> Cartridge {
    Cartridge::from_bytes(rom(cart_type, ram_size, banks), &CoreConfig::default()).unwrap()
}

pub fn write_rom(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}

/// Bank number visible in the switchable window, read through `read`.
pub fn mapped_bank(read: impl Fn(u16) -> u8) -> usize {
    let addr = 0x4000 + TAG_OFFSET as u16;
    read(addr) as usize | (read(addr + 1) as usize) << 8
}

/// Time source under test control, starting at `start`.
pub fn manual_clock(start: i64) -> (Rc<Cell<i64>>, TimeSource) {
    let now = Rc::new(Cell::new(start));
    let handle = Rc::clone(&now);
    (now, Box::new(move || handle.get()))
}

/// Machine running a plain ROM-only cartridge in monochrome mode.
pub fn dmg() -> GameBoy {
    let mut gb = GameBoy::default();
    gb.load_rom_bytes(rom(0x00, 0, 2)).unwrap();
    gb
}

/// Machine running a CGB-flagged cartridge.
pub fn cgb() -> GameBoy {
    let mut gb = GameBoy::default();
    gb.load_rom_bytes(RomBuilder::new(0x00, 2).cgb().build()).unwrap();
    assert_eq!(gb.gb_mode(), GbMode::Cgb);
    gb
}
