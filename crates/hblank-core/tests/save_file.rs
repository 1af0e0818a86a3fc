use std::fs;

use hblank_core::{
    cartridge::{Cartridge, MbcKind},
    config::CoreConfig,
    rtc::{RTC_BLOCK_LEN, RtcClock},
    sram::{ExternalRam, RAM_BANK_SIZE, SECTOR_SIZE, SaveFile},
};
use tempfile::tempdir;

mod common;
use common::{mapped_bank, rom, write_rom};

#[test]
fn new_file_includes_the_clock_block() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clock.sav");
    let mut save = SaveFile::open(&path, RAM_BANK_SIZE, true).unwrap();
    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        (RAM_BANK_SIZE + RTC_BLOCK_LEN) as u64
    );

    let mut ram = ExternalRam::new(1);
    let clock = save.read_into(&mut ram).unwrap();
    assert_eq!(clock, Some(RtcClock::default()));
}

#[test]
fn longer_file_is_left_alone() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("long.sav");
    fs::write(&path, vec![0x11; 3 * RAM_BANK_SIZE]).unwrap();

    let mut save = SaveFile::open(&path, RAM_BANK_SIZE, false).unwrap();
    let mut ram = ExternalRam::new(1);
    assert_eq!(save.read_into(&mut ram).unwrap(), None);
    assert_eq!(ram.read(0, 0x1FFF), 0x11);
    assert_eq!(fs::metadata(&path).unwrap().len(), 3 * RAM_BANK_SIZE as u64);
}

#[test]
fn sector_sync_rewrites_only_dirty_sectors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sectors.sav");
    let mut save = SaveFile::open(&path, 2 * RAM_BANK_SIZE, false).unwrap();
    let mut ram = ExternalRam::new(2);

    // Bytes on disk outside dirty sectors must survive the sync.
    let mut disk = fs::read(&path).unwrap();
    disk[5] = 0xEE;
    fs::write(&path, &disk).unwrap();

    ram.write(1, 0x0400, 0x77);
    ram.write(1, 0x0400, 0x77);
    assert_eq!(ram.dirty().count(), 1);
    assert_eq!(save.sync_dirty(&mut ram).unwrap(), 1);
    assert_eq!(save.sync_dirty(&mut ram).unwrap(), 0);

    let disk = fs::read(&path).unwrap();
    let sector = (RAM_BANK_SIZE + 0x400) / SECTOR_SIZE;
    assert_eq!(disk[sector * SECTOR_SIZE], 0x77);
    assert_eq!(disk[5], 0xEE);
    assert_eq!(ram.write_count(), 0);
}

#[test]
fn clock_write_leaves_ram_image_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rtc.sav");
    let mut save = SaveFile::open(&path, RAM_BANK_SIZE, true).unwrap();
    let mut ram = ExternalRam::new(1);
    ram.write(0, 0, 0x42);
    save.write_full(&mut ram, None).unwrap();

    let mut clock = RtcClock::default();
    clock.mbc3.minutes = 59;
    clock.last = 1_700_000_000;
    save.write_clock(&clock).unwrap();

    let mut reloaded = ExternalRam::new(1);
    assert_eq!(save.read_into(&mut reloaded).unwrap(), Some(clock));
    assert_eq!(reloaded.read(0, 0), 0x42);
}

#[test]
fn open_streams_rom_and_creates_save_file() {
    let dir = tempdir().unwrap();
    let path = write_rom(dir.path(), "game.gb", &rom(0x03, 3, 16));

    let mut c = Cartridge::open(&path, &CoreConfig::default()).unwrap();
    assert_eq!(c.kind(), MbcKind::Mbc1);
    assert_eq!(c.rom_path(), Some(path.as_path()));

    let save = path.with_extension("sav");
    assert_eq!(c.save_path(), Some(save.as_path()));
    assert_eq!(
        fs::metadata(&save).unwrap().len(),
        4 * RAM_BANK_SIZE as u64
    );

    c.write(0x2000, 0x0B);
    assert_eq!(mapped_bank(|a| c.read(a)), 0x0B);
}

#[test]
fn rom_without_battery_ram_gets_no_save_file() {
    let dir = tempdir().unwrap();
    let path = write_rom(dir.path(), "plain.gb", &rom(0x01, 0, 4));

    let c = Cartridge::open(&path, &CoreConfig::default()).unwrap();
    assert!(c.save_path().is_none());
    assert!(!path.with_extension("sav").exists());
}

#[test]
fn short_save_file_is_extended_and_loaded() {
    let dir = tempdir().unwrap();
    let path = write_rom(dir.path(), "short.gb", &rom(0x1B, 3, 8));
    let save = path.with_extension("sav");
    fs::write(&save, [0x11, 0x22, 0x33]).unwrap();

    let mut c = Cartridge::open(&path, &CoreConfig::default()).unwrap();
    assert_eq!(
        fs::metadata(&save).unwrap().len(),
        4 * RAM_BANK_SIZE as u64
    );

    c.write(0x0000, 0x0A);
    assert_eq!(c.read(0xA000), 0x11);
    assert_eq!(c.read(0xA002), 0x33);
    assert_eq!(c.read(0xA003), 0x00);
}

#[test]
fn dirty_sectors_reach_disk_on_sync() {
    let dir = tempdir().unwrap();
    let path = write_rom(dir.path(), "sync.gb", &rom(0x03, 3, 4));
    let mut c = Cartridge::open(&path, &CoreConfig::default()).unwrap();

    c.write(0x0000, 0x0A);
    c.write(0x6000, 0x01);
    c.write(0x4000, 0x02);
    c.write(0xA000, 0xAA);
    c.write(0xA001, 0xAA);
    c.write(0xB000, 0xBB);
    assert_eq!(c.ram().dirty().count(), 2);

    assert_eq!(c.sync_save().unwrap(), 2);
    assert_eq!(c.ram().dirty().count(), 0);

    let disk = fs::read(path.with_extension("sav")).unwrap();
    assert_eq!(disk[2 * RAM_BANK_SIZE], 0xAA);
    assert_eq!(disk[2 * RAM_BANK_SIZE + 1], 0xAA);
    assert_eq!(disk[2 * RAM_BANK_SIZE + 0x1000], 0xBB);
    assert_eq!(disk[0], 0x00);
}

#[test]
fn battery_ram_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = write_rom(dir.path(), "persist.gb", &rom(0x1B, 2, 4));
    {
        let mut c = Cartridge::open(&path, &CoreConfig::default()).unwrap();
        c.write(0x0000, 0x0A);
        c.write(0xA123, 0x5A);
        c.save_full().unwrap();
    }

    let mut c = Cartridge::open(&path, &CoreConfig::default()).unwrap();
    c.write(0x0000, 0x0A);
    assert_eq!(c.read(0xA123), 0x5A);
}
