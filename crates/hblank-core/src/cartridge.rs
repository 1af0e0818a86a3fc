use std::{
    fmt,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{
    bank_store::{BankLoadedHook, BankStore, FileRom, RomSource},
    config::CoreConfig,
    error::{CoreError, Result},
    rtc::{ClockKind, RTC_BLOCK_LEN, RtcClock, unix_now},
    sram::{ExternalRam, RAM_BANK_SIZE, SaveFile},
};

const HEADER_END: usize = 0x150;

/// Title of the MBC1 clone whose bank register drops bit 3 for values
/// above 15.
const ROCKMAN_TITLE: &str = "ROCKMAN 99";

/// Called with the new motor state when an MBC5 rumble cartridge toggles it.
pub type RumbleHook = Box<dyn FnMut(bool)>;

/// Wall-clock source for RTC latching, in Unix seconds.
pub type TimeSource = Box<dyn FnMut() -> i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcKind {
    None,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc4,
    Mbc5,
    Mbc7,
    Huc1,
    Huc3,
}

impl MbcKind {
    pub fn clock(self) -> Option<ClockKind> {
        match self {
            Self::Mbc3 => Some(ClockKind::Mbc3),
            Self::Huc3 => Some(ClockKind::Huc3),
            _ => None,
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Mbc4 | Self::Mbc7)
    }
}

impl fmt::Display for MbcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "ROM",
            Self::Mbc1 => "MBC1",
            Self::Mbc2 => "MBC2",
            Self::Mbc3 => "MBC3",
            Self::Mbc4 => "MBC4",
            Self::Mbc5 => "MBC5",
            Self::Mbc7 => "MBC7",
            Self::Huc1 => "HuC1",
            Self::Huc3 => "HuC3",
        })
    }
}

/// Controller and rumble flag for a header cartridge-type byte.
pub fn controller_for(cart_type: u8) -> Option<(MbcKind, bool)> {
    let kind = match cart_type {
        0x00 | 0x08 | 0x09 => MbcKind::None,
        // 0xEA is a hacked Sonic 3D Blast 5 header.
        0x01..=0x03 | 0xEA => MbcKind::Mbc1,
        0x05 | 0x06 => MbcKind::Mbc2,
        0x0F..=0x13 => MbcKind::Mbc3,
        0x15..=0x17 => MbcKind::Mbc4,
        0x19..=0x1B => MbcKind::Mbc5,
        0x1C..=0x1E => return Some((MbcKind::Mbc5, true)),
        0x22 => MbcKind::Mbc7,
        0xFE => MbcKind::Huc3,
        0xFF => MbcKind::Huc1,
        _ => return None,
    };
    Some((kind, false))
}

/// External RAM banks declared by the RAM-size header byte.
pub fn ram_banks_for(ram_size: u8, kind: MbcKind) -> usize {
    if kind == MbcKind::Mbc2 {
        return 1;
    }
    match ram_size {
        0 => 0,
        1 | 2 => 1,
        3 => 4,
        4 => 16,
        _ => {
            warn!("Invalid RAM bank number {ram_size:#04x}, defaulting to 4");
            4
        }
    }
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn byte(&self, offset: usize) -> u8 {
        self.data.get(offset).copied().unwrap_or(0)
    }

    fn cgb_flag(&self) -> u8 {
        self.byte(0x0143)
    }

    fn title(&self) -> String {
        let len = if matches!(self.cgb_flag(), 0x80 | 0xC0) {
            15
        } else {
            16
        };
        let mut slice = &self.data[0x0134..0x0134 + len];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim_end().to_string()
    }
}

/// Summary of the cartridge header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomInfo {
    pub title: String,
    pub cgb_flag: u8,
    pub sgb_flag: u8,
    pub cart_type: u8,
    pub kind: MbcKind,
    pub rumble: bool,
    pub rom_size: u8,
    pub rom_banks: usize,
    pub ram_size: u8,
    pub ram_banks: usize,
}

impl RomInfo {
    pub fn supports_cgb(&self) -> bool {
        self.cgb_flag & 0x80 != 0
    }

    pub fn supports_sgb(&self) -> bool {
        self.sgb_flag == 0x03
    }

    pub fn has_clock(&self) -> bool {
        self.kind.clock().is_some()
    }

    /// Bytes the save file must hold.
    pub fn save_len(&self) -> usize {
        self.ram_banks * RAM_BANK_SIZE + if self.has_clock() { RTC_BLOCK_LEN } else { 0 }
    }
}

impl fmt::Display for RomInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Title: \"{}\"", self.title)?;
        writeln!(
            f,
            "Cartridge type: {:02x} ({}{})",
            self.cart_type,
            self.kind,
            if self.rumble { "+RUMBLE" } else { "" }
        )?;
        writeln!(f, "ROM Size: {:02x} ({} banks)", self.rom_size, self.rom_banks)?;
        write!(f, "RAM Size: {:02x} ({} banks)", self.ram_size, self.ram_banks)
    }
}

/// Controller-specific registers. The bank numbers themselves live on the
/// cartridge since every controller shares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcState {
    None,
    Mbc1 {
        /// 0 = ROM banking, 1 = RAM banking.
        mode: u8,
    },
    Mbc2,
    Mbc3 {
        /// RTC register mapped at 0xA000 instead of RAM.
        rtc_select: Option<u8>,
    },
    Mbc5 {
        motor: bool,
    },
    Huc1 {
        mode: u8,
    },
    Huc3 {
        mode: u8,
        value: u8,
        shift: u8,
    },
}

impl MbcState {
    fn for_kind(kind: MbcKind) -> Self {
        match kind {
            MbcKind::Mbc1 => Self::Mbc1 { mode: 0 },
            MbcKind::Mbc2 => Self::Mbc2,
            MbcKind::Mbc3 => Self::Mbc3 { rtc_select: None },
            MbcKind::Mbc5 => Self::Mbc5 { motor: false },
            MbcKind::Huc1 => Self::Huc1 { mode: 0 },
            MbcKind::Huc3 => Self::Huc3 {
                mode: 0,
                value: 0,
                shift: 0,
            },
            MbcKind::None | MbcKind::Mbc4 | MbcKind::Mbc7 => Self::None,
        }
    }
}

/// Flat copy of the banking registers, as stored in save states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapperRegs {
    pub rom_bank: u16,
    pub ram_bank: u8,
    pub ram_enabled: bool,
    pub mode: u8,
    pub huc3_mode: u8,
    pub huc3_value: u8,
    pub huc3_shift: u8,
}

pub struct Cartridge {
    rom: BankStore,
    ram: ExternalRam,
    clock: RtcClock,
    save: Option<SaveFile>,
    info: RomInfo,
    rom_path: Option<PathBuf>,
    mbc_state: MbcState,
    ram_enabled: bool,
    ram_bank: usize,
    rockman: bool,
    rumble_hook: Option<RumbleHook>,
    time_source: TimeSource,
}

impl Cartridge {
    /// Build a cartridge from an in-memory image. No save file is attached.
    pub fn from_bytes(data: Vec<u8>, config: &CoreConfig) -> Result<Self> {
        if data.len() < HEADER_END {
            return Err(CoreError::RomTooSmall(data.len()));
        }
        validate_header(&data)?;
        let rom = BankStore::from_bytes(data, config.max_loaded_banks())?;
        Self::from_store(rom, None)
    }

    /// Stream a ROM from disk and open (or create) `<rom>.sav` next to it.
    pub fn open<P: AsRef<Path>>(path: P, config: &CoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let source = FileRom::open(path)?;
        let len = source.byte_len() as usize;
        if len < HEADER_END {
            return Err(CoreError::RomTooSmall(len));
        }

        let rom = BankStore::new(Box::new(source), config.max_loaded_banks())?;
        validate_header(rom.bank0())?;
        let mut cart = Self::from_store(rom, Some(path.to_path_buf()))?;
        if cart.info.save_len() > 0 {
            cart.attach_save_file(path.with_extension("sav"))?;
        }
        Ok(cart)
    }

    fn from_store(rom: BankStore, rom_path: Option<PathBuf>) -> Result<Self> {
        let bank0 = rom.bank0();
        let header = Header::parse(bank0);
        let cart_type = header.byte(0x0147);
        let (kind, rumble) =
            controller_for(cart_type).ok_or(CoreError::UnsupportedMapper(cart_type))?;
        let ram_size = header.byte(0x0149);
        let info = RomInfo {
            title: header.title(),
            cgb_flag: header.cgb_flag(),
            sgb_flag: header.byte(0x0146),
            cart_type,
            kind,
            rumble,
            rom_size: header.byte(0x0148),
            rom_banks: rom.num_banks(),
            ram_size,
            ram_banks: ram_banks_for(ram_size, kind),
        };
        info!(
            "Loaded ROM: {} ({}, {} banks)",
            info.title, info.kind, info.rom_banks
        );

        Ok(Self {
            ram: ExternalRam::new(info.ram_banks),
            clock: RtcClock::default(),
            save: None,
            rockman: info.title == ROCKMAN_TITLE,
            mbc_state: MbcState::for_kind(kind),
            ram_enabled: false,
            ram_bank: 0,
            rumble_hook: None,
            time_source: Box::new(unix_now),
            rom_path,
            info,
            rom,
        })
    }

    /// Load battery RAM from `path`, sizing the file as needed, then write
    /// it back in full.
    pub fn attach_save_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut save = SaveFile::open(
            path,
            self.ram.num_banks() * RAM_BANK_SIZE,
            self.info.has_clock(),
        )?;
        if let Some(clock) = save.read_into(&mut self.ram)? {
            self.clock = clock;
        }
        save.write_full(&mut self.ram, Some(&self.clock))?;
        self.save = Some(save);
        Ok(())
    }

    pub fn info(&self) -> &RomInfo {
        &self.info
    }

    pub fn kind(&self) -> MbcKind {
        self.info.kind
    }

    pub fn rom_path(&self) -> Option<&Path> {
        self.rom_path.as_deref()
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save.as_ref().map(SaveFile::path)
    }

    pub fn bank_store(&self) -> &BankStore {
        &self.rom
    }

    pub fn active_high_bank(&self) -> &[u8] {
        self.rom.active_high_bank()
    }

    pub fn ram(&self) -> &ExternalRam {
        &self.ram
    }

    pub fn ram_enabled(&self) -> bool {
        self.ram_enabled
    }

    pub fn ram_bank(&self) -> usize {
        self.ram_bank
    }

    pub fn state(&self) -> MbcState {
        self.mbc_state
    }

    pub fn clock(&self) -> &RtcClock {
        &self.clock
    }

    pub fn set_clock(&mut self, clock: RtcClock) {
        self.clock = clock;
    }

    pub fn set_time_source(&mut self, source: TimeSource) {
        self.time_source = source;
    }

    pub fn set_rumble_hook(&mut self, hook: RumbleHook) {
        self.rumble_hook = Some(hook);
    }

    pub fn set_bank_loaded_hook(&mut self, hook: BankLoadedHook) {
        self.rom.set_bank_loaded_hook(hook);
    }

    /// Whether an SRAM write happened since the last call.
    pub fn take_ram_modified(&mut self) -> bool {
        self.ram.take_modified()
    }

    /// Return the banking registers to their power-on values.
    pub fn reset_banking(&mut self) {
        self.mbc_state = MbcState::for_kind(self.info.kind);
        self.ram_enabled = false;
        self.ram_bank = 0;
        self.rom.select(1);
    }

    pub fn mapper_regs(&self) -> MapperRegs {
        let mut regs = MapperRegs {
            rom_bank: self.rom.active_bank() as u16,
            ram_bank: self.ram_bank as u8,
            ram_enabled: self.ram_enabled,
            ..Default::default()
        };
        match self.mbc_state {
            MbcState::Mbc1 { mode } | MbcState::Huc1 { mode } => regs.mode = mode,
            MbcState::Mbc3 {
                rtc_select: Some(reg),
            } => regs.ram_bank = reg,
            MbcState::Huc3 { mode, value, shift } => {
                regs.huc3_mode = mode;
                regs.huc3_value = value;
                regs.huc3_shift = shift;
            }
            _ => {}
        }
        regs
    }

    pub fn restore_mapper_regs(&mut self, regs: &MapperRegs) {
        self.reset_banking();
        self.ram_enabled = regs.ram_enabled;
        let ram_bank = regs.ram_bank as usize;
        if ram_bank < self.ram.num_banks() {
            self.ram_bank = ram_bank;
        }
        self.mbc_state = match self.mbc_state {
            MbcState::Mbc1 { .. } => MbcState::Mbc1 {
                mode: regs.mode & 1,
            },
            MbcState::Huc1 { .. } => MbcState::Huc1 {
                mode: regs.mode & 1,
            },
            MbcState::Mbc3 { .. } => MbcState::Mbc3 {
                rtc_select: (0x08..=0x0C).contains(&regs.ram_bank).then_some(regs.ram_bank),
            },
            MbcState::Huc3 { .. } => MbcState::Huc3 {
                mode: regs.huc3_mode,
                value: regs.huc3_value,
                shift: regs.huc3_shift,
            },
            other => other,
        };
        self.rom.select(regs.rom_bank as usize);
    }

    /// Overwrite external RAM from a save state.
    pub fn load_ram(&mut self, data: &[u8]) {
        self.ram.load(data);
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF => self.rom.read(addr),
            0xA000..=0xBFFF => self.read_ram(addr),
            _ => 0xFF,
        }
    }

    fn read_ram(&self, addr: u16) -> u8 {
        match self.mbc_state {
            MbcState::Mbc3 { rtc_select } => {
                if !self.ram_enabled {
                    return 0xFF;
                }
                match rtc_select {
                    Some(reg) => self.clock.mbc3.read_register(reg),
                    None => self.ram.read(self.ram_bank, addr),
                }
            }
            MbcState::Huc3 { mode, value, .. } => match mode {
                0x0C => value,
                // Some games need this to boot; the register's meaning is unknown.
                0x0B | 0x0D => 1,
                _ if self.ram_enabled => self.ram.read(self.ram_bank, addr),
                _ => 0xFF,
            },
            _ if self.ram.is_empty() => 0xFF,
            _ => self.ram.read(self.ram_bank, addr),
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        let mut state = self.mbc_state;
        match (&mut state, addr) {
            (MbcState::None, 0xA000..=0xBFFF) => {
                self.ram.write(self.ram_bank, addr, val);
            }
            (MbcState::None, _) => {}

            (MbcState::Mbc1 { .. }, 0x0000..=0x1FFF) => self.set_ram_enable(val),
            (MbcState::Mbc1 { .. }, 0x2000..=0x3FFF) => {
                let low = val & 0x1F;
                let bank = if self.rockman {
                    rockman_bank(low)
                } else {
                    (self.rom.active_bank() as u8 & 0xE0) | low
                };
                self.select_rom(nonzero(bank as usize));
            }
            (MbcState::Mbc1 { mode }, 0x4000..=0x5FFF) => {
                let val = val & 3;
                if *mode == 0 {
                    let bank = (self.rom.active_bank() & 0x1F) | ((val as usize) << 5);
                    self.select_rom(nonzero(bank));
                } else {
                    self.select_ram(val as usize);
                }
            }
            (MbcState::Mbc1 { mode }, 0x6000..=0x7FFF) => *mode = val & 1,

            (MbcState::Mbc2, 0x0000..=0x1FFF) => self.set_ram_enable(val),
            (MbcState::Mbc2, 0x2000..=0x3FFF) => self.select_rom(nonzero(val as usize)),
            (MbcState::Mbc2, 0xA000..=0xBFFF) => {
                if self.ram_enabled {
                    self.ram.write(self.ram_bank, addr, val & 0x0F);
                }
            }

            (MbcState::Mbc3 { .. }, 0x0000..=0x1FFF) => self.set_ram_enable(val),
            (MbcState::Mbc3 { .. }, 0x2000..=0x3FFF) => {
                self.select_rom(nonzero((val & 0x7F) as usize));
            }
            (MbcState::Mbc3 { rtc_select }, 0x4000..=0x5FFF) => match val {
                0x00..=0x03 => {
                    *rtc_select = None;
                    self.select_ram(val as usize);
                }
                0x08..=0x0C => *rtc_select = Some(val),
                _ => {}
            },
            (MbcState::Mbc3 { .. }, 0x6000..=0x7FFF) => {
                if val != 0 {
                    self.latch_clock();
                }
            }
            (MbcState::Mbc3 { rtc_select }, 0xA000..=0xBFFF) if self.ram_enabled => {
                match *rtc_select {
                    Some(reg) => {
                        if self.clock.mbc3.write_register(reg, val) {
                            self.persist_clock();
                        }
                    }
                    None => {
                        self.ram.write(self.ram_bank, addr, val);
                    }
                }
            }

            (MbcState::Mbc5 { .. }, 0x0000..=0x1FFF) => self.set_ram_enable(val),
            (MbcState::Mbc5 { .. }, 0x2000..=0x2FFF) => {
                let bank = (self.rom.active_bank() & 0x100) | val as usize;
                self.select_rom(bank);
            }
            (MbcState::Mbc5 { .. }, 0x3000..=0x3FFF) => {
                let bank = (self.rom.active_bank() & 0xFF) | (((val & 1) as usize) << 8);
                self.select_rom(bank);
            }
            (MbcState::Mbc5 { motor }, 0x4000..=0x5FFF) => {
                let mut val = val & 0x0F;
                if self.info.rumble {
                    let on = val & 0x08 != 0;
                    if on != *motor {
                        *motor = on;
                        if let Some(hook) = self.rumble_hook.as_mut() {
                            hook(on);
                        }
                    }
                    val &= 0x07;
                }
                self.select_ram(val as usize);
            }

            (MbcState::Huc1 { .. }, 0x0000..=0x1FFF) => self.set_ram_enable(val),
            (MbcState::Huc1 { .. }, 0x2000..=0x3FFF) => self.select_rom((val & 0x3F) as usize),
            (MbcState::Huc1 { mode }, 0x4000..=0x5FFF) => {
                let val = (val & 3) as usize;
                if *mode == 0 {
                    self.select_rom(val);
                } else {
                    self.select_ram(val);
                }
            }
            (MbcState::Huc1 { mode }, 0x6000..=0x7FFF) => *mode = val & 1,

            (MbcState::Huc3 { mode, .. }, 0x0000..=0x1FFF) => {
                self.set_ram_enable(val);
                *mode = val;
            }
            (MbcState::Huc3 { .. }, 0x2000..=0x3FFF) => self.select_rom(nonzero(val as usize)),
            (MbcState::Huc3 { .. }, 0x4000..=0x5FFF) => self.select_ram((val & 0x0F) as usize),
            (MbcState::Huc3 { mode, value, shift }, 0xA000..=0xBFFF) => match *mode {
                0x0B => self.huc3_command(val, value, shift),
                0x0C..=0x0E => {}
                _ => {
                    if self.ram_enabled {
                        self.ram.write(self.ram_bank, addr, val);
                    }
                }
            },

            (MbcState::Mbc1 { .. }, 0xA000..=0xBFFF)
            | (MbcState::Mbc5 { .. }, 0xA000..=0xBFFF)
            | (MbcState::Huc1 { .. }, 0xA000..=0xBFFF) => {
                if self.ram_enabled {
                    self.ram.write(self.ram_bank, addr, val);
                }
            }
            _ => {}
        }
        self.mbc_state = state;
    }

    fn huc3_command(&mut self, cmd: u8, value: &mut u8, shift: &mut u8) {
        match cmd & 0xF0 {
            0x10 => {
                if *shift > 24 {
                    return;
                }
                let huc3 = &self.clock.huc3;
                let nibble = match *shift {
                    0 | 4 | 8 => huc3.minutes >> *shift,
                    12 | 16 | 20 => huc3.days >> (*shift - 12),
                    _ => huc3.years,
                };
                *value = (nibble & 0x0F) as u8;
                *shift += 4;
            }
            0x40 => {
                if matches!(cmd & 0x0F, 0 | 4 | 7) {
                    *shift = 0;
                }
                self.latch_clock();
            }
            0x50 => {}
            0x60 => *value = 1,
            _ => warn!("unhandled HuC3 command {cmd:#04x}"),
        }
    }

    /// Advance the cartridge clock to the current wall time.
    pub fn latch_clock(&mut self) {
        if let Some(kind) = self.info.kind.clock() {
            let now = (self.time_source)();
            self.clock.latch(kind, now);
        }
    }

    fn persist_clock(&mut self) {
        self.ram.mark_modified();
        if let Some(save) = self.save.as_mut()
            && let Err(e) = save.write_clock(&self.clock)
        {
            warn!("Failed to write clock to {}: {e}", save.path().display());
        }
    }

    fn set_ram_enable(&mut self, val: u8) {
        self.ram_enabled = val & 0x0F == 0x0A;
    }

    fn select_rom(&mut self, bank: usize) {
        self.rom.select(bank);
    }

    fn select_ram(&mut self, bank: usize) {
        if bank < self.ram.num_banks() {
            self.ram_bank = bank;
        }
    }

    /// Write the whole save file.
    pub fn save_full(&mut self) -> Result<()> {
        if let Some(save) = self.save.as_mut() {
            save.write_full(&mut self.ram, Some(&self.clock))?;
        }
        Ok(())
    }

    /// Flush dirty SRAM sectors. Returns how many were written.
    pub fn sync_save(&mut self) -> Result<usize> {
        match self.save.as_mut() {
            Some(save) => Ok(save.sync_dirty(&mut self.ram)?),
            None => Ok(0),
        }
    }
}

impl fmt::Debug for Cartridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cartridge")
            .field("info", &self.info)
            .field("rom", &self.rom)
            .field("mbc_state", &self.mbc_state)
            .field("ram_enabled", &self.ram_enabled)
            .field("ram_bank", &self.ram_bank)
            .finish()
    }
}

fn validate_header(bank0: &[u8]) -> Result<()> {
    let cart_type = Header::parse(bank0).byte(0x0147);
    match controller_for(cart_type) {
        None => Err(CoreError::UnsupportedMapper(cart_type)),
        Some((kind, _)) if !kind.is_supported() => Err(CoreError::UnsupportedController(kind)),
        Some(_) => Ok(()),
    }
}

fn nonzero(bank: usize) -> usize {
    if bank == 0 { 1 } else { bank }
}

/// ROCKMAN 99 bank register: values above 15 lose 8. Observed on the cart,
/// not derived from a documented wiring.
fn rockman_bank(low: u8) -> u8 {
    if low > 0x0F { low - 8 } else { low }
}
