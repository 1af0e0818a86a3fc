//! Cartridge real-time clocks (MBC3 and HuC3).
//!
//! Both variants live in one persisted block so a save file has the same
//! trailer layout regardless of which chip the cartridge carries.

use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the clock block appended to the save file and embedded in save
/// states.
pub const RTC_BLOCK_LEN: usize = 40;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_DAY: u64 = 24 * 60 * 60;
const MINUTES_PER_DAY: u32 = 24 * 60;
const DAYS_PER_YEAR: u32 = 365;

const MBC3_DAY_LIMIT: u32 = 0x200;
const MBC3_CTRL_DAY_HIGH: u32 = 0x01;
const MBC3_CTRL_HALT: u32 = 0x40;
const MBC3_CTRL_CARRY: u32 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    Mbc3,
    Huc3,
}

/// MBC3 registers exactly as the game last wrote or latched them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mbc3Clock {
    pub seconds: u32,
    pub minutes: u32,
    pub hours: u32,
    pub days: u32,
    pub ctrl: u32,
}

impl Mbc3Clock {
    pub fn halted(&self) -> bool {
        self.ctrl & MBC3_CTRL_HALT != 0
    }

    pub fn carry(&self) -> bool {
        self.ctrl & MBC3_CTRL_CARRY != 0
    }

    /// Register value seen on the bus for RTC select `reg` (0x08-0x0C).
    pub fn read_register(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.seconds as u8,
            0x09 => self.minutes as u8,
            0x0A => self.hours as u8,
            0x0B => (self.days & 0xFF) as u8,
            0x0C => self.ctrl as u8,
            _ => 0xFF,
        }
    }

    /// Store a register write. Returns whether anything changed.
    pub fn write_register(&mut self, reg: u8, val: u8) -> bool {
        let val32 = val as u32;
        match reg {
            0x08 if self.seconds != val32 => self.seconds = val32,
            0x09 if self.minutes != val32 => self.minutes = val32,
            0x0A if self.hours != val32 => self.hours = val32,
            0x0B if self.days & 0xFF != val32 => self.days = (self.days & 0x100) | val32,
            0x0C if self.ctrl != val32 => {
                self.days = (self.days & 0xFF) | ((val32 & 1) << 8);
                self.ctrl = val32;
            }
            _ => return false,
        }
        true
    }

    fn advance(&mut self, elapsed: u64) {
        self.seconds += (elapsed % SECS_PER_MINUTE) as u32;
        self.minutes += self.seconds / 60;
        self.seconds %= 60;

        self.minutes += ((elapsed / SECS_PER_MINUTE) % 60) as u32;
        self.hours += self.minutes / 60;
        self.minutes %= 60;

        self.hours += ((elapsed / SECS_PER_HOUR) % 24) as u32;
        self.days += self.hours / 24;
        self.hours %= 24;

        self.days = self
            .days
            .saturating_add((elapsed / SECS_PER_DAY).min(u32::MAX as u64) as u32);
        if self.days >= MBC3_DAY_LIMIT {
            self.ctrl |= MBC3_CTRL_CARRY;
            self.days %= MBC3_DAY_LIMIT;
        }
        self.ctrl &= !MBC3_CTRL_DAY_HIGH;
        if self.days > 0xFF {
            self.ctrl |= MBC3_CTRL_DAY_HIGH;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Huc3Clock {
    pub minutes: u32,
    pub days: u32,
    pub years: u32,
}

impl Huc3Clock {
    fn advance(&mut self, elapsed: u64) {
        self.minutes += ((elapsed / SECS_PER_MINUTE) % MINUTES_PER_DAY as u64) as u32;
        self.days += self.minutes / MINUTES_PER_DAY;
        self.minutes %= MINUTES_PER_DAY;

        let whole_days = elapsed / SECS_PER_DAY;
        self.days += (whole_days % DAYS_PER_YEAR as u64) as u32;
        self.years += self.days / DAYS_PER_YEAR;
        self.days %= DAYS_PER_YEAR;
        self.years = self
            .years
            .saturating_add((whole_days / DAYS_PER_YEAR as u64).min(u32::MAX as u64) as u32);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcClock {
    pub mbc3: Mbc3Clock,
    pub huc3: Huc3Clock,
    /// Unix time of the last latch; zero until the first one.
    pub last: i64,
}

impl RtcClock {
    /// Advance the registers of `kind` by the wall time elapsed since the
    /// previous latch.
    pub fn latch(&mut self, kind: ClockKind, now: i64) {
        if self.last == 0 || now <= self.last {
            self.last = self.last.max(now);
            return;
        }
        let elapsed = (now - self.last) as u64;
        match kind {
            ClockKind::Mbc3 => {
                if !self.mbc3.halted() {
                    self.mbc3.advance(elapsed);
                }
            }
            ClockKind::Huc3 => self.huc3.advance(elapsed),
        }
        self.last = now;
    }

    pub fn to_bytes(&self) -> [u8; RTC_BLOCK_LEN] {
        let mut out = [0u8; RTC_BLOCK_LEN];
        let words = [
            self.mbc3.seconds,
            self.mbc3.minutes,
            self.mbc3.hours,
            self.mbc3.days,
            self.mbc3.ctrl,
            self.huc3.minutes,
            self.huc3.days,
            self.huc3.years,
        ];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out[32..40].copy_from_slice(&self.last.to_le_bytes());
        out
    }

    /// Decode a clock block. Missing trailing bytes read as zero.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buf = [0u8; RTC_BLOCK_LEN];
        let n = data.len().min(RTC_BLOCK_LEN);
        buf[..n].copy_from_slice(&data[..n]);

        let word = |i: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_le_bytes(w)
        };
        let mut last = [0u8; 8];
        last.copy_from_slice(&buf[32..40]);

        Self {
            mbc3: Mbc3Clock {
                seconds: word(0),
                minutes: word(1),
                hours: word(2),
                days: word(3),
                ctrl: word(4),
            },
            huc3: Huc3Clock {
                minutes: word(5),
                days: word(6),
                years: word(7),
            },
            last: i64::from_le_bytes(last),
        }
    }
}

/// Current wall-clock time in Unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
