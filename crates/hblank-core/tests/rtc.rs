use hblank_core::{
    cartridge::Cartridge,
    config::CoreConfig,
    rtc::{RTC_BLOCK_LEN, RtcClock},
    sram::RAM_BANK_SIZE,
};
use tempfile::tempdir;

mod common;
use common::{cart, manual_clock, rom, write_rom};

const DAY: i64 = 24 * 60 * 60;

fn read_rtc(c: &mut Cartridge, reg: u8) -> u8 {
    c.write(0x4000, reg);
    c.read(0xA000)
}

fn write_rtc(c: &mut Cartridge, reg: u8, val: u8) {
    c.write(0x4000, reg);
    c.write(0xA000, val);
}

fn latch(c: &mut Cartridge) {
    c.write(0x6000, 0x00);
    c.write(0x6000, 0x01);
}

#[test]
fn latch_advances_mbc3_registers_by_elapsed_time() {
    let mut c = cart(0x10, 3, 4);
    let (now, source) = manual_clock(1_000_000);
    c.set_time_source(source);
    c.write(0x0000, 0x0A);
    latch(&mut c);

    now.set(now.get() + DAY + 3600 + 60 + 1);
    latch(&mut c);

    assert_eq!(read_rtc(&mut c, 0x08), 1);
    assert_eq!(read_rtc(&mut c, 0x09), 1);
    assert_eq!(read_rtc(&mut c, 0x0A), 1);
    assert_eq!(read_rtc(&mut c, 0x0B), 1);
    assert_eq!(read_rtc(&mut c, 0x0C), 0);
}

#[test]
fn clock_never_runs_backwards() {
    let mut c = cart(0x10, 3, 4);
    let (now, source) = manual_clock(5_000);
    c.set_time_source(source);
    c.write(0x0000, 0x0A);
    latch(&mut c);

    now.set(5_030);
    latch(&mut c);
    assert_eq!(read_rtc(&mut c, 0x08), 30);

    now.set(4_000);
    latch(&mut c);
    assert_eq!(read_rtc(&mut c, 0x08), 30);

    now.set(5_040);
    latch(&mut c);
    assert_eq!(read_rtc(&mut c, 0x08), 40);
}

#[test]
fn halted_clock_does_not_advance() {
    let mut c = cart(0x10, 3, 4);
    let (now, source) = manual_clock(10_000);
    c.set_time_source(source);
    c.write(0x0000, 0x0A);
    latch(&mut c);
    write_rtc(&mut c, 0x0C, 0x40);

    now.set(10_000 + 3 * DAY);
    latch(&mut c);
    assert_eq!(read_rtc(&mut c, 0x0B), 0);
    assert_eq!(read_rtc(&mut c, 0x08), 0);
}

#[test]
fn day_overflow_sets_carry_once() {
    let mut c = cart(0x10, 3, 4);
    let (now, source) = manual_clock(20_000);
    c.set_time_source(source);
    c.write(0x0000, 0x0A);
    latch(&mut c);
    write_rtc(&mut c, 0x0B, 0xFF);
    write_rtc(&mut c, 0x0C, 0x01);
    assert_eq!(c.clock().mbc3.days, 0x1FF);

    now.set(20_000 + DAY);
    latch(&mut c);
    assert_eq!(read_rtc(&mut c, 0x0B), 0);
    assert_eq!(read_rtc(&mut c, 0x0C), 0x80);
    assert!(c.clock().mbc3.carry());

    now.set(20_000 + 300 * DAY);
    latch(&mut c);
    assert_eq!(c.clock().mbc3.days, 299);
    assert_eq!(read_rtc(&mut c, 0x0C), 0x81);
}

#[test]
fn register_write_reaches_save_file_immediately() {
    let dir = tempdir().unwrap();
    let path = write_rom(dir.path(), "clock.gb", &rom(0x10, 3, 4));
    let mut c = Cartridge::open(&path, &CoreConfig::default()).unwrap();
    c.write(0x0000, 0x0A);
    write_rtc(&mut c, 0x08, 42);
    write_rtc(&mut c, 0x0A, 17);

    let disk = std::fs::read(path.with_extension("sav")).unwrap();
    let ram_len = 4 * RAM_BANK_SIZE;
    assert_eq!(disk.len(), ram_len + RTC_BLOCK_LEN);
    let stored = RtcClock::from_bytes(&disk[ram_len..]);
    assert_eq!(stored.mbc3.seconds, 42);
    assert_eq!(stored.mbc3.hours, 17);

    drop(c);
    let c = Cartridge::open(&path, &CoreConfig::default()).unwrap();
    assert_eq!(c.clock().mbc3.seconds, 42);
    assert_eq!(c.clock().mbc3.hours, 17);
}

#[test]
fn huc3_latch_reports_minutes_days_and_years() {
    let mut c = cart(0xFE, 3, 4);
    let (now, source) = manual_clock(100_000);
    c.set_time_source(source);

    c.write(0x0000, 0x0B);
    c.write(0xA000, 0x40);
    now.set(100_000 + 367 * DAY + 5 * 60);
    c.write(0xA000, 0x40);

    let mut nibbles = Vec::new();
    for _ in 0..7 {
        c.write(0x0000, 0x0B);
        c.write(0xA000, 0x10);
        c.write(0x0000, 0x0C);
        nibbles.push(c.read(0xA000));
    }
    assert_eq!(nibbles, vec![5, 0, 0, 2, 0, 0, 1]);
}
