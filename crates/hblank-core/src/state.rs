//! Versioned save-state files.
//!
//! Every field is written explicitly in little-endian order, so a state
//! taken on one host loads on any other. Versions 1 through
//! [`STATE_VERSION`] are readable: v2 added the serial counter, v3 the
//! RAM-enable flag and the controller/SGB trailer. A state is parsed in
//! full before anything is applied.

use std::path::{Path, PathBuf};

use crate::{
    cartridge::{MapperRegs, MbcKind, RomInfo},
    config::GbMode,
    error::{CoreError, Result},
    mmu::{HIGH_AREA_SIZE, WRAM_BANK_SIZE, WRAM_BANKS},
    renderer::SGB_MAP_LEN,
    rtc::{RTC_BLOCK_LEN, RtcClock},
    scanline::PALETTE_BYTES,
    sram::RAM_BANK_SIZE,
    vram::{VRAM_BANK_SIZE, VramBanks},
};

pub const STATE_VERSION: u32 = 5;

/// Extension of the suspend slot, which is deleted once loaded.
const SUSPEND_EXTENSION: &str = "yss";

/// Registers and counters owned by the CPU interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub af: u16,
    pub bc: u16,
    pub de: u16,
    pub hl: u16,
    pub sp: u16,
    pub pc: u16,
    pub halt: i32,
    pub ime: bool,
    pub bios_on: bool,
    pub timer_counter: i32,
    pub phase_counter: i32,
    pub divider_counter: i32,
}

/// Progress of an SGB command packet being clocked in through the joypad
/// port. The packet decoder itself lives outside the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgbPacketState {
    pub packet_length: i32,
    pub packets_transferred: i32,
    pub packet_bit: i32,
    pub command: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgbBlock {
    pub packet: SgbPacketState,
    pub gfx_mask: u8,
    pub map: [u8; SGB_MAP_LEN],
}

/// A fully parsed save state.
#[derive(Debug, Clone)]
pub struct SaveState {
    pub version: u32,
    pub bg_palette: [u8; PALETTE_BYTES],
    pub spr_palette: [u8; PALETTE_BYTES],
    pub vram: Box<VramBanks>,
    pub wram: Box<[[u8; WRAM_BANK_SIZE]; WRAM_BANKS]>,
    pub high: Box<[u8; HIGH_AREA_SIZE]>,
    pub ext_ram: Vec<u8>,
    pub cpu: CpuState,
    pub double_speed: bool,
    pub gb_mode: GbMode,
    pub mapper: MapperRegs,
    pub wram_bank: u32,
    pub vram_bank: u32,
    pub clock: RtcClock,
    pub scanline_counter: i32,
    pub serial_counter: i32,
    pub sgb: Option<SgbBlock>,
}

/// `<rom>.ys<N>` for numbered slots, `<rom>.yss` for the suspend slot.
pub fn slot_path(rom: &Path, slot: Option<u32>) -> PathBuf {
    match slot {
        Some(n) => rom.with_extension(format!("ys{n}")),
        None => rom.with_extension(SUSPEND_EXTENSION),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CoreError::TruncatedState)?;
        let slice = self.data.get(self.pos..end).ok_or(CoreError::TruncatedState)?;
        self.pos = end;
        Ok(slice)
    }

    fn fill(&mut self, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(self.take(dst.len())?);
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    /// Trailer fields: older writers could stop early, absent bytes read
    /// as zero.
    fn lenient<T: Default>(&mut self, read: impl FnOnce(&mut Self) -> Result<T>) -> T {
        read(self).unwrap_or_default()
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }
}

impl SaveState {
    /// Parse a state written for the cartridge described by `info`.
    pub fn parse(data: &[u8], info: &RomInfo) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.u32()?;
        if version == 0 || version > STATE_VERSION {
            return Err(CoreError::IncompatibleState {
                found: version,
                supported: STATE_VERSION,
            });
        }

        let mut bg_palette = [0u8; PALETTE_BYTES];
        let mut spr_palette = [0u8; PALETTE_BYTES];
        r.fill(&mut bg_palette)?;
        r.fill(&mut spr_palette)?;

        let mut vram = Box::new([[0u8; VRAM_BANK_SIZE]; 2]);
        for bank in vram.iter_mut() {
            r.fill(bank)?;
        }
        let mut wram = Box::new([[0u8; WRAM_BANK_SIZE]; WRAM_BANKS]);
        for bank in wram.iter_mut() {
            r.fill(bank)?;
        }
        let mut high = Box::new([0u8; HIGH_AREA_SIZE]);
        r.fill(&mut high[..])?;

        // RAM-size byte 4 used to be read as 4 banks instead of 16.
        let ram_banks = if version <= 4 && info.ram_size == 0x04 {
            4
        } else {
            info.ram_banks
        };
        let ext_ram = r.take(ram_banks * RAM_BANK_SIZE)?.to_vec();

        let mut cpu = CpuState {
            af: r.u16()?,
            bc: r.u16()?,
            de: r.u16()?,
            hl: r.u16()?,
            sp: r.u16()?,
            pc: r.u16()?,
            halt: r.i32()?,
            ime: r.i32()? != 0,
            ..Default::default()
        };
        let double_speed = r.bool()?;
        cpu.bios_on = r.bool()?;
        let gb_mode = GbMode::from_byte(r.u32()? as u8).unwrap_or_default();
        let mut mapper = MapperRegs {
            rom_bank: r.u32()? as u16,
            ram_bank: r.u32()? as u8,
            ..Default::default()
        };
        let wram_bank = r.u32()?;
        let vram_bank = r.u32()?;
        mapper.mode = r.u32()? as u8;
        let clock = RtcClock::from_bytes(r.take(RTC_BLOCK_LEN)?);
        let scanline_counter = r.i32()?;
        cpu.timer_counter = r.i32()?;
        cpu.phase_counter = r.i32()?;
        cpu.divider_counter = r.i32()?;
        let serial_counter = if version >= 2 { r.i32()? } else { 0 };
        mapper.ram_enabled = if version >= 3 { r.bool()? } else { true };

        let mut sgb = None;
        if version >= 3 {
            match info.kind {
                MbcKind::Mbc3 if version == 3 => {
                    let rtc_reg = r.lenient(Reader::u8);
                    if rtc_reg != 0 {
                        mapper.ram_bank = rtc_reg;
                    }
                }
                MbcKind::Huc3 => {
                    mapper.huc3_mode = r.lenient(Reader::u8);
                    mapper.huc3_value = r.lenient(Reader::u8);
                    mapper.huc3_shift = r.lenient(Reader::u8);
                }
                _ => {}
            }
            if r.lenient(Reader::bool) {
                let packet = SgbPacketState {
                    packet_length: r.lenient(Reader::i32),
                    packets_transferred: r.lenient(Reader::i32),
                    packet_bit: r.lenient(Reader::i32),
                    command: r.lenient(Reader::u8),
                };
                let gfx_mask = r.lenient(Reader::u8);
                let mut map = [0u8; SGB_MAP_LEN];
                let avail = (data.len() - r.pos).min(SGB_MAP_LEN);
                map[..avail].copy_from_slice(&data[r.pos..r.pos + avail]);
                sgb = Some(SgbBlock {
                    packet,
                    gfx_mask,
                    map,
                });
            }
        }

        Ok(Self {
            version,
            bg_palette,
            spr_palette,
            vram,
            wram,
            high,
            ext_ram,
            cpu,
            double_speed,
            gb_mode,
            mapper,
            wram_bank,
            vram_bank,
            clock,
            scanline_counter,
            serial_counter,
            sgb,
        })
    }

    /// Serialize at [`STATE_VERSION`] for a cartridge with controller `kind`.
    pub fn encode(&self, kind: MbcKind) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(STATE_VERSION);
        w.bytes(&self.bg_palette);
        w.bytes(&self.spr_palette);
        self.vram.iter().for_each(|bank| w.bytes(bank));
        self.wram.iter().for_each(|bank| w.bytes(bank));
        w.bytes(&self.high[..]);
        w.bytes(&self.ext_ram);

        let cpu = &self.cpu;
        for reg in [cpu.af, cpu.bc, cpu.de, cpu.hl, cpu.sp, cpu.pc] {
            w.u16(reg);
        }
        w.i32(cpu.halt);
        w.i32(cpu.ime as i32);
        w.bool(self.double_speed);
        w.bool(cpu.bios_on);
        w.u32(self.gb_mode.to_byte() as u32);
        w.u32(self.mapper.rom_bank as u32);
        w.u32(self.mapper.ram_bank as u32);
        w.u32(self.wram_bank);
        w.u32(self.vram_bank);
        w.u32(self.mapper.mode as u32);
        w.bytes(&self.clock.to_bytes());
        w.i32(self.scanline_counter);
        w.i32(cpu.timer_counter);
        w.i32(cpu.phase_counter);
        w.i32(cpu.divider_counter);
        w.i32(self.serial_counter);
        w.bool(self.mapper.ram_enabled);

        if kind == MbcKind::Huc3 {
            w.u8(self.mapper.huc3_mode);
            w.u8(self.mapper.huc3_value);
            w.u8(self.mapper.huc3_shift);
        }
        w.bool(self.sgb.is_some());
        if let Some(sgb) = &self.sgb {
            w.i32(sgb.packet.packet_length);
            w.i32(sgb.packet.packets_transferred);
            w.i32(sgb.packet.packet_bit);
            w.u8(sgb.packet.command);
            w.u8(sgb.gfx_mask);
            w.bytes(&sgb.map);
        }
        w.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(kind: MbcKind, ram_size: u8, ram_banks: usize) -> RomInfo {
        RomInfo {
            title: "TEST".into(),
            cgb_flag: 0,
            sgb_flag: 0,
            cart_type: 0,
            kind,
            rumble: false,
            rom_size: 0,
            rom_banks: 2,
            ram_size,
            ram_banks,
        }
    }

    fn blank(ram_banks: usize) -> SaveState {
        SaveState {
            version: STATE_VERSION,
            bg_palette: [0; PALETTE_BYTES],
            spr_palette: [0; PALETTE_BYTES],
            vram: Box::new([[0; VRAM_BANK_SIZE]; 2]),
            wram: Box::new([[0; WRAM_BANK_SIZE]; WRAM_BANKS]),
            high: Box::new([0; HIGH_AREA_SIZE]),
            ext_ram: vec![0; ram_banks * RAM_BANK_SIZE],
            cpu: CpuState::default(),
            double_speed: false,
            gb_mode: GbMode::Gb,
            mapper: MapperRegs::default(),
            wram_bank: 1,
            vram_bank: 0,
            clock: RtcClock::default(),
            scanline_counter: 0,
            serial_counter: 0,
            sgb: None,
        }
    }

    #[test]
    fn slot_paths_replace_the_extension() {
        let rom = Path::new("/games/zelda.gbc");
        assert_eq!(slot_path(rom, Some(3)), PathBuf::from("/games/zelda.ys3"));
        assert_eq!(slot_path(rom, None), PathBuf::from("/games/zelda.yss"));
    }

    #[test]
    fn rejects_unknown_versions() {
        let info = info(MbcKind::None, 0, 0);
        for version in [0u32, STATE_VERSION + 1] {
            let err = SaveState::parse(&version.to_le_bytes(), &info).unwrap_err();
            assert!(matches!(
                err,
                CoreError::IncompatibleState { found, supported: STATE_VERSION } if found == version
            ));
        }
    }

    #[test]
    fn short_body_is_truncated() {
        let info = info(MbcKind::None, 0, 0);
        let mut data = blank(0).encode(MbcKind::None);
        data.truncate(0x1000);
        assert!(matches!(
            SaveState::parse(&data, &info),
            Err(CoreError::TruncatedState)
        ));
    }

    #[test]
    fn huc3_trailer_and_sgb_block_survive() {
        let info = info(MbcKind::Huc3, 2, 1);
        let mut state = blank(1);
        state.mapper.huc3_mode = 0x0B;
        state.mapper.huc3_value = 7;
        state.mapper.huc3_shift = 3;
        state.cpu.pc = 0x0150;
        state.cpu.ime = true;
        state.ext_ram[5] = 0xAA;
        let mut map = [0u8; SGB_MAP_LEN];
        map[SGB_MAP_LEN - 1] = 3;
        state.sgb = Some(SgbBlock {
            packet: SgbPacketState {
                packet_length: 2,
                packets_transferred: 1,
                packet_bit: 17,
                command: 0x11,
            },
            gfx_mask: 1,
            map,
        });

        let parsed = SaveState::parse(&state.encode(MbcKind::Huc3), &info).unwrap();
        assert_eq!(parsed.mapper, state.mapper);
        assert_eq!(parsed.cpu, state.cpu);
        assert_eq!(parsed.ext_ram[5], 0xAA);
        assert_eq!(parsed.sgb, state.sgb);
    }

    #[test]
    fn version_two_enables_ram_and_has_no_trailer() {
        let info = info(MbcKind::Mbc1, 2, 1);
        let mut data = blank(1).encode(MbcKind::Mbc1);
        // Drop ram_enabled and the trailer, then relabel as v2.
        data.truncate(data.len() - 2);
        data[..4].copy_from_slice(&2u32.to_le_bytes());
        let parsed = SaveState::parse(&data, &info).unwrap();
        assert!(parsed.mapper.ram_enabled);
        assert!(parsed.sgb.is_none());
    }

    #[test]
    fn old_versions_read_four_banks_for_size_byte_four() {
        let info = info(MbcKind::Mbc5, 0x04, 16);
        let mut v5 = blank(16).encode(MbcKind::Mbc5);
        v5[..4].copy_from_slice(&4u32.to_le_bytes());
        // A v4 writer would only have emitted 4 banks.
        let start = 4 + 2 * PALETTE_BYTES + 2 * VRAM_BANK_SIZE + WRAM_BANKS * WRAM_BANK_SIZE
            + HIGH_AREA_SIZE;
        v5.drain(start + 4 * RAM_BANK_SIZE..start + 16 * RAM_BANK_SIZE);
        let parsed = SaveState::parse(&v5, &info).unwrap();
        assert_eq!(parsed.ext_ram.len(), 4 * RAM_BANK_SIZE);
    }

    #[test]
    fn version_three_mbc3_reads_rtc_select() {
        let info = info(MbcKind::Mbc3, 3, 4);
        let mut data = blank(4).encode(MbcKind::Mbc3);
        data[..4].copy_from_slice(&3u32.to_le_bytes());
        // v3 wrote the RTC select byte before the SGB flag.
        let sgb_flag = data.len() - 1;
        data.insert(sgb_flag, 0x0A);
        let parsed = SaveState::parse(&data, &info).unwrap();
        assert_eq!(parsed.mapper.ram_bank, 0x0A);
    }
}
