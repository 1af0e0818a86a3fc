//! Resident ROM bank pool.
//!
//! Bank 0 always lives in slot 0. The remaining slots hold switchable banks
//! and are recycled least-recently-selected first when the ROM is larger
//! than the pool.

use std::{
    collections::VecDeque,
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use log::{debug, warn};

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const MAX_ROM_BANKS: usize = 512;
pub const DEFAULT_MAX_LOADED_BANKS: usize = 128;

/// Backing storage the pool reads banks from.
pub trait RomSource {
    /// Total image length in bytes.
    fn byte_len(&self) -> u64;

    /// Fill `buf` with the contents of `bank`. Bytes past the end of the
    /// image read as 0xFF.
    fn read_bank(&mut self, bank: usize, buf: &mut [u8]) -> io::Result<()>;
}

/// ROM image held entirely in memory.
pub struct MemoryRom {
    data: Vec<u8>,
}

impl MemoryRom {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl RomSource for MemoryRom {
    fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_bank(&mut self, bank: usize, buf: &mut [u8]) -> io::Result<()> {
        let start = bank * ROM_BANK_SIZE;
        buf.fill(0xFF);
        if let Some(src) = self.data.get(start..) {
            let n = src.len().min(buf.len());
            buf[..n].copy_from_slice(&src[..n]);
        }
        Ok(())
    }
}

/// ROM image streamed from disk on demand.
pub struct FileRom {
    file: File,
    len: u64,
}

impl FileRom {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl RomSource for FileRom {
    fn byte_len(&self) -> u64 {
        self.len
    }

    fn read_bank(&mut self, bank: usize, buf: &mut [u8]) -> io::Result<()> {
        buf.fill(0xFF);
        self.file
            .seek(SeekFrom::Start((bank * ROM_BANK_SIZE) as u64))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(())
    }
}

/// Called with `(bank, bytes)` whenever a bank becomes resident.
pub type BankLoadedHook = Box<dyn FnMut(usize, &mut [u8])>;

/// Number of 16 KiB banks for an image of `len` bytes, rounded up to a
/// power of two. Never less than two so the switchable window always has a
/// bank behind it.
pub fn bank_count_for_len(len: u64) -> usize {
    let banks = (len as usize).div_ceil(ROM_BANK_SIZE).max(2);
    banks.next_power_of_two().min(MAX_ROM_BANKS)
}

pub struct BankStore {
    slots: Vec<u8>,
    slot_of: Vec<Option<usize>>,
    /// Switchable banks, most recently selected first. Bank 0 is never listed.
    lru: VecDeque<usize>,
    num_banks: usize,
    active_bank: usize,
    active_slot: usize,
    source: Option<Box<dyn RomSource>>,
    scratch: Vec<u8>,
    on_bank_loaded: Option<BankLoadedHook>,
}

impl BankStore {
    pub fn new(mut source: Box<dyn RomSource>, max_loaded: usize) -> io::Result<Self> {
        let num_banks = bank_count_for_len(source.byte_len());
        let resident = num_banks.min(max_loaded.clamp(2, MAX_ROM_BANKS));

        let mut slots = vec![0xFF; resident * ROM_BANK_SIZE];
        let mut slot_of = vec![None; num_banks];
        let mut lru = VecDeque::with_capacity(resident);
        for (bank, chunk) in slots.chunks_exact_mut(ROM_BANK_SIZE).enumerate() {
            source.read_bank(bank, chunk)?;
            slot_of[bank] = Some(bank);
            if bank != 0 {
                lru.push_back(bank);
            }
        }

        // Everything fits: the backing storage is no longer needed.
        let source = (resident < num_banks).then_some(source);

        Ok(Self {
            slots,
            slot_of,
            lru,
            num_banks,
            active_bank: 1,
            active_slot: 1,
            source,
            scratch: vec![0; ROM_BANK_SIZE],
            on_bank_loaded: None,
        })
    }

    pub fn from_bytes(data: Vec<u8>, max_loaded: usize) -> io::Result<Self> {
        Self::new(Box::new(MemoryRom::new(data)), max_loaded)
    }

    pub fn open<P: AsRef<Path>>(path: P, max_loaded: usize) -> io::Result<Self> {
        Self::new(Box::new(FileRom::open(path)?), max_loaded)
    }

    pub fn num_banks(&self) -> usize {
        self.num_banks
    }

    pub fn resident_count(&self) -> usize {
        self.slots.len() / ROM_BANK_SIZE
    }

    pub fn is_resident(&self, bank: usize) -> bool {
        matches!(self.slot_of.get(bank), Some(Some(_)))
    }

    /// Switchable banks from most to least recently selected.
    pub fn recency(&self) -> impl Iterator<Item = usize> + '_ {
        self.lru.iter().copied()
    }

    /// Contents of a resident bank.
    pub fn rom_bank(&self, bank: usize) -> Option<&[u8]> {
        let slot = (*self.slot_of.get(bank)?)?;
        Some(self.slot(slot))
    }

    pub fn active_bank(&self) -> usize {
        self.active_bank
    }

    /// Bytes currently mapped at 0x4000-0x7FFF.
    pub fn active_high_bank(&self) -> &[u8] {
        self.slot(self.active_slot)
    }

    pub fn bank0(&self) -> &[u8] {
        self.slot(0)
    }

    /// Read from the ROM window (0x0000-0x7FFF).
    #[inline]
    pub fn read(&self, addr: u16) -> u8 {
        let addr = addr as usize;
        if addr < ROM_BANK_SIZE {
            self.slots[addr]
        } else {
            self.slots[self.active_slot * ROM_BANK_SIZE + (addr & (ROM_BANK_SIZE - 1))]
        }
    }

    /// Make `bank` resident, evicting the least recently selected bank if
    /// the pool is full. Returns the slot holding it.
    pub fn load_bank(&mut self, bank: usize) -> Option<usize> {
        if bank >= self.num_banks {
            warn!("Tried to access bank {bank:#x}");
            return None;
        }
        if let Some(slot) = self.slot_of[bank] {
            self.touch(bank);
            return Some(slot);
        }

        let source = self.source.as_mut()?;
        let victim = self.lru.pop_back()?;
        let Some(slot) = self.slot_of[victim] else {
            self.lru.push_back(victim);
            return None;
        };

        if let Err(e) = source.read_bank(bank, &mut self.scratch) {
            warn!("Failed to read ROM bank {bank:#x}: {e}");
            self.lru.push_back(victim);
            return None;
        }

        #[cfg(feature = "bank-trace")]
        debug!("bank {bank:#x} replaces {victim:#x} in slot {slot}");

        self.slot_of[victim] = None;
        self.slot_of[bank] = Some(slot);
        let range = slot * ROM_BANK_SIZE..(slot + 1) * ROM_BANK_SIZE;
        self.slots[range.clone()].copy_from_slice(&self.scratch);
        self.lru.push_front(bank);

        if let Some(hook) = self.on_bank_loaded.as_mut() {
            hook(bank, &mut self.slots[range]);
        }
        Some(slot)
    }

    /// Map `bank` into the switchable window. Out-of-range or unreadable
    /// banks leave the current mapping untouched.
    pub fn select(&mut self, bank: usize) -> bool {
        match self.load_bank(bank) {
            Some(slot) => {
                self.active_bank = bank;
                self.active_slot = slot;
                true
            }
            None => false,
        }
    }

    /// Install the bank-loaded observer and run it over every resident bank.
    pub fn set_bank_loaded_hook(&mut self, hook: BankLoadedHook) {
        self.on_bank_loaded = Some(hook);
        self.reapply_hook();
    }

    pub fn clear_bank_loaded_hook(&mut self) {
        self.on_bank_loaded = None;
    }

    /// Run the bank-loaded observer over every resident bank again.
    pub fn reapply_hook(&mut self) {
        let Some(hook) = self.on_bank_loaded.as_mut() else {
            return;
        };
        for (bank, slot) in self.slot_of.iter().enumerate() {
            if let Some(slot) = *slot {
                let range = slot * ROM_BANK_SIZE..(slot + 1) * ROM_BANK_SIZE;
                hook(bank, &mut self.slots[range]);
            }
        }
        debug!("re-applied bank hook to {} resident banks", self.resident_count());
    }

    fn touch(&mut self, bank: usize) {
        if bank == 0 || self.lru.front() == Some(&bank) {
            return;
        }
        if let Some(pos) = self.lru.iter().position(|&b| b == bank) {
            self.lru.remove(pos);
            self.lru.push_front(bank);
        }
    }

    fn slot(&self, slot: usize) -> &[u8] {
        &self.slots[slot * ROM_BANK_SIZE..(slot + 1) * ROM_BANK_SIZE]
    }
}

impl fmt::Debug for BankStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankStore")
            .field("num_banks", &self.num_banks)
            .field("resident", &self.resident_count())
            .field("active_bank", &self.active_bank)
            .field("streaming", &self.source.is_some())
            .finish()
    }
}
