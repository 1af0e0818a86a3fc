use hblank_core::{
    display::SCREEN_OFFSET_X,
    ppu::FRAME_CYCLES,
    scanline::{
        CaptureInput, OAM_SIZE, PALETTE_BYTES, ScanlinePipeline, WindowRow, palette_hash,
    },
};

mod common;
use common::{LINE_CYCLES, VBLANK_START, dmg};

fn input<'a>(
    ly: u8,
    oam: &'a [u8; OAM_SIZE],
    palette: &'a [u8; PALETTE_BYTES],
) -> CaptureInput<'a> {
    CaptureInput {
        lcdc: 0x91,
        scy: 0,
        scx: 0,
        ly,
        wy: 0,
        bgp: 0xE4,
        obp0: 0xE4,
        obp1: 0xE4,
        cgb: false,
        oam,
        bg_palette: palette,
        spr_palette: palette,
    }
}

#[test]
fn untouched_frame_only_captures_line_zero() {
    let mut gb = dmg();
    gb.step_video(FRAME_CYCLES);
    let drawing = gb.mmu.ppu.pipeline.drawing();
    assert!(drawing[0].modified);
    assert!(drawing[1..].iter().all(|line| !line.modified));
}

#[test]
fn palettes_are_copied_only_on_dirty_lines() {
    let oam = [0u8; OAM_SIZE];
    let mut palette = [0u8; PALETTE_BYTES];
    palette[2] = 0x1F;
    let mut pipeline = ScanlinePipeline::new();

    pipeline.capture(0, &input(0, &oam, &palette));
    assert_eq!(pipeline.rendering()[0].bg_hash, palette_hash(&palette));

    palette[2] = 0x00;
    palette[3] = 0x7C;
    pipeline.capture(4, &input(4, &oam, &palette));
    assert!(!pipeline.rendering()[4].modified);

    pipeline.mark_bg_palettes();
    pipeline.capture(5, &input(5, &oam, &palette));
    let line = &pipeline.rendering()[5];
    assert!(line.modified && line.bg_palettes_modified);
    assert!(!line.maps_modified);
    assert_eq!(line.bg_hash, palette_hash(&palette));
    assert_eq!(line.bg_palette, palette);
}

#[test]
fn window_starts_counting_at_wy() {
    let mut gb = dmg();
    gb.write_byte(0xFF40, 0xF1);
    gb.write_byte(0xFF4A, 20);
    gb.write_byte(0xFF4B, 7);
    // Past the capture of line 143; the frame end resets the counter.
    let last_capture = VBLANK_START - LINE_CYCLES + 300;
    gb.step_video(last_capture);
    assert_eq!(gb.mmu.ppu.pipeline.window_row(), WindowRow::Row(123));
    gb.step_video(FRAME_CYCLES - last_capture);

    let drawing = gb.mmu.ppu.pipeline.drawing();
    assert!(!drawing[0].win_on);
    assert_eq!(drawing[0].win_map, 1);
    assert!(drawing[20].modified && drawing[20].win_on);
    assert_eq!(drawing[20].win_pos_y, 0);
    assert_eq!(drawing[20].win_x, 7);
    assert_eq!(gb.mmu.ppu.pipeline.window_row(), WindowRow::Disabled);
}

#[test]
fn wx_written_during_a_line_shows_up_on_the_next_one() {
    let mut gb = dmg();
    gb.write_byte(0xFF40, 0xB1);
    gb.write_byte(0xFF4B, 7);
    // Mode 3 of line 30.
    gb.step_video(30 * LINE_CYCLES + 100);
    gb.write_byte(0xFF4B, 167);
    gb.step_video(FRAME_CYCLES - 30 * LINE_CYCLES - 100);

    let drawing = gb.mmu.ppu.pipeline.drawing();
    assert!(!drawing[30].modified);
    assert!(drawing[31].modified && !drawing[31].win_on);
    assert_eq!(drawing[31].win_x, 167);
}

#[test]
fn leftover_cycles_carry_into_the_next_call() {
    let mut gb = dmg();
    gb.step_video(6);
    assert_eq!(gb.mmu.ppu.mode_clock(), 4);
    gb.step_video(2);
    assert_eq!(gb.mmu.ppu.mode_clock(), 8);
}

#[test]
fn frame_end_raises_vblank_and_restarts_at_line_zero() {
    let mut gb = dmg();
    gb.step_video(VBLANK_START);
    assert_eq!(gb.read_byte(0xFF44), 144);
    assert_eq!(gb.read_byte(0xFF41) & 0x03, 1);
    assert_eq!(gb.mmu.if_reg() & 0x01, 0x01);

    gb.step_video(FRAME_CYCLES - VBLANK_START);
    assert_eq!(gb.read_byte(0xFF44), 0);
    assert_eq!(gb.mmu.ppu.frames(), 1);
}

#[test]
fn mid_frame_scroll_lands_on_the_next_captured_line() {
    let mut gb = dmg();
    gb.step_video(10 * LINE_CYCLES);
    gb.write_byte(0xFF43, 5);
    gb.step_video(FRAME_CYCLES - 10 * LINE_CYCLES);

    let drawing = gb.mmu.ppu.pipeline.drawing();
    assert!(drawing[0].modified);
    assert_eq!(drawing[0].hofs, 0);
    assert!(!drawing[9].modified);
    assert!(drawing[10].modified && drawing[10].maps_modified);
    assert_eq!(drawing[10].hofs, 5);
    assert!(!drawing[11].modified);

    // The next frame draws what the previous one captured.
    gb.step_video(11 * LINE_CYCLES);
    assert!(gb.renderer.is_line_completed(10));
    assert!(!gb.renderer.is_line_completed(11));
    assert_eq!(gb.renderer.display().layers[0].hofs, 5 - SCREEN_OFFSET_X);

    gb.host_vblank();
    assert!(!gb.renderer.is_line_completed(10));
}
