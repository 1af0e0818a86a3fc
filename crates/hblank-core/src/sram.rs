//! Battery-backed cartridge RAM and its save file.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::rtc::{RTC_BLOCK_LEN, RtcClock};

pub const RAM_BANK_SIZE: usize = 0x2000;
pub const SECTOR_SIZE: usize = 512;

const AUTOSAVE_FRAMES: u32 = 120;
const AUTOSAVE_FRAMES_FAST_FORWARD: u32 = 960;

/// One bit per 512-byte sector of external RAM.
#[derive(Debug, Clone, Default)]
pub struct DirtySectors {
    words: Vec<u64>,
    len: usize,
}

impl DirtySectors {
    pub fn new(sectors: usize) -> Self {
        Self {
            words: vec![0; sectors.div_ceil(64)],
            len: sectors,
        }
    }

    pub fn mark(&mut self, sector: usize) {
        if sector < self.len {
            self.words[sector / 64] |= 1 << (sector % 64);
        }
    }

    pub fn clear(&mut self, sector: usize) {
        if sector < self.len {
            self.words[sector / 64] &= !(1 << (sector % 64));
        }
    }

    pub fn is_dirty(&self, sector: usize) -> bool {
        sector < self.len && self.words[sector / 64] & (1 << (sector % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&s| self.is_dirty(s))
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }
}

#[derive(Debug, Clone)]
pub struct ExternalRam {
    data: Vec<u8>,
    dirty: DirtySectors,
    writes: u32,
    modified: bool,
}

impl ExternalRam {
    pub fn new(num_banks: usize) -> Self {
        let len = num_banks * RAM_BANK_SIZE;
        Self {
            data: vec![0; len],
            dirty: DirtySectors::new(len / SECTOR_SIZE),
            writes: 0,
            modified: false,
        }
    }

    pub fn num_banks(&self) -> usize {
        self.data.len() / RAM_BANK_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the contents without marking anything dirty.
    pub fn load(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
    }

    pub fn read(&self, bank: usize, offset: u16) -> u8 {
        self.data
            .get(bank * RAM_BANK_SIZE + (offset as usize & (RAM_BANK_SIZE - 1)))
            .copied()
            .unwrap_or(0xFF)
    }

    /// Store `val`, tracking the sector only when the byte actually changes.
    pub fn write(&mut self, bank: usize, offset: u16, val: u8) -> bool {
        let pos = bank * RAM_BANK_SIZE + (offset as usize & (RAM_BANK_SIZE - 1));
        match self.data.get_mut(pos) {
            Some(b) if *b != val => {
                *b = val;
                self.dirty.mark(pos / SECTOR_SIZE);
                self.writes += 1;
                self.modified = true;
                true
            }
            _ => false,
        }
    }

    pub fn dirty(&self) -> &DirtySectors {
        &self.dirty
    }

    /// Writes since the last sector sync.
    pub fn write_count(&self) -> u32 {
        self.writes
    }

    /// Whether a write happened since the last call.
    pub fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }

    pub(crate) fn mark_modified(&mut self) {
        self.modified = true;
    }
}

/// Open `.sav` file: RAM image followed by an optional clock block.
#[derive(Debug)]
pub struct SaveFile {
    path: PathBuf,
    file: File,
    ram_len: usize,
    has_clock: bool,
}

impl SaveFile {
    /// Open `path`, creating it or zero-extending it to the expected size.
    pub fn open<P: AsRef<Path>>(path: P, ram_len: usize, has_clock: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let needed = (ram_len + if has_clock { RTC_BLOCK_LEN } else { 0 }) as u64;
        let current = file.metadata()?.len();
        if current < needed {
            debug!(
                "extending save file {} from {current} to {needed} bytes",
                path.display()
            );
            file.set_len(needed)?;
        }

        Ok(Self {
            path,
            file,
            ram_len,
            has_clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored RAM image and clock.
    pub fn read_into(&mut self, ram: &mut ExternalRam) -> io::Result<Option<RtcClock>> {
        let mut buf = vec![0u8; self.ram_len];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        ram.load(&buf);

        if !self.has_clock {
            return Ok(None);
        }
        let mut block = [0u8; RTC_BLOCK_LEN];
        self.file.read_exact(&mut block)?;
        Ok(Some(RtcClock::from_bytes(&block)))
    }

    /// Rewrite the whole file sequentially.
    pub fn write_full(&mut self, ram: &mut ExternalRam, clock: Option<&RtcClock>) -> io::Result<()> {
        info!("Full game save to {}", self.path.display());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(ram.data())?;
        if let (true, Some(clock)) = (self.has_clock, clock) {
            self.file.write_all(&clock.to_bytes())?;
        }
        self.file.flush()?;
        ram.dirty.clear_all();
        ram.writes = 0;
        Ok(())
    }

    /// Persist just the clock block.
    pub fn write_clock(&mut self, clock: &RtcClock) -> io::Result<()> {
        if !self.has_clock {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.ram_len as u64))?;
        self.file.write_all(&clock.to_bytes())?;
        self.file.flush()
    }

    /// Write every dirty sector in place. Returns how many were written.
    pub fn sync_dirty(&mut self, ram: &mut ExternalRam) -> io::Result<usize> {
        let dirty: Vec<usize> = ram.dirty.iter().collect();
        let mut next_pos = None;
        for &sector in &dirty {
            let start = sector * SECTOR_SIZE;
            if next_pos != Some(start) {
                self.file.seek(SeekFrom::Start(start as u64))?;
            }
            self.file.write_all(&ram.data[start..start + SECTOR_SIZE])?;
            ram.dirty.clear(sector);
            next_pos = Some(start + SECTOR_SIZE);
        }
        self.file.sync_data()?;
        ram.writes = 0;
        debug!("SAVE {} sectors", dirty.len());
        Ok(dirty.len())
    }
}

/// Decides when dirty sectors should be flushed.
///
/// A sync happens once SRAM has been written on 120 consecutive frames
/// (960 while fast-forwarding), or on the first frame without writes after
/// a burst of them.
#[derive(Debug, Clone, Default)]
pub struct AutosaveScheduler {
    started: bool,
    frames_since_start: u32,
    wrote_recently: bool,
}

impl AutosaveScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> bool {
        self.started
    }

    /// Call once per emulated frame. Returns true when a sync is due.
    pub fn end_frame(&mut self, modified_this_frame: bool, fast_forward: bool) -> bool {
        if self.started {
            self.frames_since_start += 1;
        }

        let limit = if fast_forward {
            AUTOSAVE_FRAMES_FAST_FORWARD
        } else {
            AUTOSAVE_FRAMES
        };
        let due = self.started
            && (self.frames_since_start >= limit || (!modified_this_frame && self.wrote_recently));
        if due {
            self.started = false;
            self.frames_since_start = 0;
            self.wrote_recently = false;
        }

        if modified_this_frame {
            self.wrote_recently = true;
            self.started = true;
        }
        due
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
