use std::{cell::Cell, rc::Rc};

use hblank_core::{
    GameBoy,
    config::{BorderMode, CoreConfig, GbMode, InterruptWait},
    display::{HostSprite, SCREEN_OFFSET_X, SCREEN_OFFSET_Y},
    ppu::FRAME_CYCLES,
    renderer::{Renderer, VsyncSource},
    scanline::LayerControl,
};

mod common;
use common::{LINE_CYCLES, RomBuilder, dmg};

struct CountingVsync(Rc<Cell<u32>>);

impl VsyncSource for CountingVsync {
    fn wait_for_vblank(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

fn paced(wait: InterruptWait) -> (GameBoy, Rc<Cell<u32>>) {
    let config = CoreConfig {
        interrupt_wait: wait,
        ..Default::default()
    };
    let mut gb = GameBoy::new(config);
    gb.load_rom_bytes(common::rom(0x00, 0, 2)).unwrap();
    let waits = Rc::new(Cell::new(0));
    gb.renderer
        .set_vsync(Box::new(CountingVsync(Rc::clone(&waits))));
    (gb, waits)
}

#[test]
fn frames_wait_only_when_the_host_is_behind() {
    let (mut gb, waits) = paced(InterruptWait::WhenBehind);
    gb.step_video(FRAME_CYCLES);
    assert_eq!(waits.get(), 1);
    assert_eq!(gb.renderer.frame_counter(), 1);

    gb.host_vblank();
    gb.step_video(FRAME_CYCLES);
    assert_eq!(waits.get(), 1);
    assert_eq!(gb.renderer.frame_counter(), 2);

    gb.step_video(FRAME_CYCLES);
    assert_eq!(waits.get(), 2);

    gb.renderer.set_fast_forward(true);
    gb.step_video(2 * FRAME_CYCLES);
    assert_eq!(waits.get(), 2);
}

#[test]
fn always_waits_even_after_a_host_blank() {
    let (mut gb, waits) = paced(InterruptWait::Always);
    gb.host_vblank();
    gb.step_video(FRAME_CYCLES);
    assert_eq!(waits.get(), 1);
    assert_eq!(gb.renderer.frame_counter(), 2);
}

#[test]
fn vblank_tasks_queued_by_tasks_wait_for_the_next_blank() {
    let mut gb = dmg();
    let runs = Rc::new(Cell::new(0));
    let outer = Rc::clone(&runs);
    gb.renderer
        .schedule_at_vblank(Box::new(move |r: &mut Renderer| {
            outer.set(outer.get() + 1);
            let inner = Rc::clone(&outer);
            r.schedule_at_vblank(Box::new(move |_: &mut Renderer| {
                inner.set(inner.get() + 10);
            }));
        }));
    assert_eq!(gb.renderer.pending_vblank_tasks(), 1);

    gb.host_vblank();
    assert_eq!(runs.get(), 1);
    assert_eq!(gb.renderer.pending_vblank_tasks(), 1);

    gb.host_vblank();
    assert_eq!(runs.get(), 11);
    assert_eq!(gb.renderer.pending_vblank_tasks(), 0);
}

#[test]
fn gfx_mask_freezes_the_picture() {
    let mut gb = dmg();
    gb.renderer.set_gfx_mask(1);
    gb.write_byte(0x8000, 0xFF);
    gb.step_video(FRAME_CYCLES);
    assert_eq!(gb.mmu.ppu.vram.pending_tiles(), 1);
    assert!(!gb.mmu.ppu.pipeline.drawing()[0].modified);

    gb.renderer.set_gfx_mask(0);
    gb.step_video(FRAME_CYCLES);
    assert_eq!(gb.mmu.ppu.vram.pending_tiles(), 0);
    assert!(gb.mmu.ppu.pipeline.drawing()[0].modified);
}

#[test]
fn cleared_screen_stops_drawing_until_enabled() {
    let mut gb = dmg();
    gb.renderer.clear();
    assert!(gb.renderer.graphics_disabled());
    let display = gb.renderer.display();
    assert!(!display.sprites_enabled);
    assert!(display.layers[0].enabled);
    assert_eq!(display.layers[0].control, LayerControl::OFF);
    assert!(!display.layers[1].enabled);

    gb.step_video(LINE_CYCLES);
    assert!(!gb.renderer.is_line_completed(0));

    gb.renderer.enable();
    assert!(gb.renderer.display().layers.iter().all(|l| l.enabled));
    gb.step_video(FRAME_CYCLES);
    assert!(gb.renderer.is_line_completed(0));
}

fn sprite_machine(border: BorderMode) -> GameBoy {
    let config = CoreConfig {
        border,
        ..Default::default()
    };
    let mut gb = GameBoy::new(config);
    gb.load_rom_bytes(RomBuilder::new(0x00, 2).sgb().build())
        .unwrap();
    // Top-left sprite using OBP1.
    for (i, val) in [16, 8, 0x02, 0x10].into_iter().enumerate() {
        gb.write_byte(0xFE00 + i as u16, val);
    }
    gb.renderer.sgb_map_mut()[0] = 2;
    // Captured in the first frame, drawn on line 0 of the second.
    gb.step_video(FRAME_CYCLES + LINE_CYCLES);
    gb
}

#[test]
fn sgb_sprites_take_their_palette_from_the_attribute_map() {
    let gb = sprite_machine(BorderMode::Sgb);
    assert_eq!(gb.gb_mode(), GbMode::Sgb);
    let HostSprite::Visible(attrs) = gb.renderer.display().gb_sprite(0) else {
        panic!("sprite 0 not drawn");
    };
    assert_eq!(attrs.palette, 6);
    assert_eq!(attrs.tile, 0x02);
    assert_eq!((attrs.x, attrs.y), (SCREEN_OFFSET_X, SCREEN_OFFSET_Y));
    assert_eq!(gb.renderer.display().gb_sprite(1), HostSprite::Hidden);

    let gb = sprite_machine(BorderMode::None);
    assert_eq!(gb.gb_mode(), GbMode::Gb);
    let HostSprite::Visible(attrs) = gb.renderer.display().gb_sprite(0) else {
        panic!("sprite 0 not drawn");
    };
    assert_eq!(attrs.palette, 5);
}

#[test]
fn lcd_off_keeps_frames_coming_with_a_blank_screen() {
    let mut gb = dmg();
    gb.write_byte(0xFF40, 0x11);
    assert_eq!(gb.read_byte(0xFF44), 0);

    gb.step_video(FRAME_CYCLES);
    assert_eq!(gb.mmu.ppu.frames(), 1);
    assert!(gb.renderer.screen_disabled());
    assert_eq!(gb.mmu.if_reg() & 0x01, 0);

    gb.write_byte(0xFF40, 0x91);
    gb.step_video(FRAME_CYCLES);
    // One more frame stays blank while the LCD warms up.
    assert!(gb.renderer.screen_disabled());
    gb.step_video(FRAME_CYCLES);
    assert!(!gb.renderer.screen_disabled());
}
