use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    bank_store::BankLoadedHook,
    cartridge::{Cartridge, RomInfo, RumbleHook, TimeSource},
    config::{CoreConfig, GbMode},
    error::{CoreError, Result},
    mmu::{Mmu, WRAM_BANKS},
    ppu::{LcdEvent, STEP_CYCLES},
    renderer::Renderer,
    sram::AutosaveScheduler,
    state::{CpuState, STATE_VERSION, SaveState, SgbBlock, SgbPacketState, slot_path},
};

/// The whole machine minus the CPU interpreter, which drives it through the
/// bus methods and [`GameBoy::step_video`].
pub struct GameBoy {
    pub mmu: Mmu,
    pub renderer: Renderer,
    /// SGB packet progress, carried in save states for the packet decoder.
    pub sgb: SgbPacketState,
    config: CoreConfig,
    autosave: AutosaveScheduler,
    leftover_cycles: u32,
}

impl GameBoy {
    pub fn new(config: CoreConfig) -> Self {
        let mut mmu = Mmu::new(GbMode::Gb);
        mmu.ppu.pipeline.set_hblank_disabled(config.hblank_disabled);
        Self {
            mmu,
            renderer: Renderer::new(&config, GbMode::Gb),
            sgb: SgbPacketState::default(),
            config,
            autosave: AutosaveScheduler::new(),
            leftover_cycles: 0,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Apply new settings. The bank pool size takes effect on the next load.
    pub fn set_config(&mut self, config: CoreConfig) {
        self.renderer.apply_config(&config);
        self.mmu
            .ppu
            .pipeline
            .set_hblank_disabled(config.hblank_disabled);
        self.config = config;
    }

    pub fn gb_mode(&self) -> GbMode {
        self.mmu.gb_mode()
    }

    pub fn cart(&self) -> Option<&Cartridge> {
        self.mmu.cart.as_ref()
    }

    pub fn cart_mut(&mut self) -> Option<&mut Cartridge> {
        self.mmu.cart.as_mut()
    }

    pub fn rom_info(&self) -> Option<&RomInfo> {
        self.cart().map(Cartridge::info)
    }

    /// Stream a ROM from disk, with its `.sav` file alongside.
    pub fn load_rom<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let cart = Cartridge::open(path, &self.config)?;
        self.insert(cart);
        Ok(())
    }

    pub fn load_rom_bytes(&mut self, data: Vec<u8>) -> Result<()> {
        let cart = Cartridge::from_bytes(data, &self.config)?;
        self.insert(cart);
        Ok(())
    }

    /// Replace the current cartridge (saving it first) and power on.
    pub fn insert(&mut self, cart: Cartridge) {
        self.unload();
        let info = cart.info();
        let mode = self.config.mode.resolve(
            info.supports_cgb(),
            info.supports_sgb(),
            self.config.border,
        );
        info!("Starting {} in {mode:?} mode", info.title);

        self.mmu = self.fresh_mmu(mode);
        self.mmu.load_cart(cart);
        self.renderer.set_mode(mode);
        self.renderer.set_gfx_mask(0);
        self.renderer.enable();
        self.sgb = SgbPacketState::default();
        self.refresh_graphics();
    }

    /// Save and remove the cartridge, blanking the screen.
    pub fn unload(&mut self) -> Option<Cartridge> {
        let mut cart = self.mmu.cart.take()?;
        if let Err(e) = cart.save_full() {
            warn!("Failed to save {}: {e}", cart.info().title);
        }
        self.mmu = self.fresh_mmu(self.mmu.gb_mode());
        self.renderer.discard_pending();
        self.renderer.clear();
        self.autosave.reset();
        self.leftover_cycles = 0;
        Some(cart)
    }

    /// Power-cycle while keeping the cartridge and its RAM.
    pub fn reset(&mut self) {
        let mode = self.mmu.gb_mode();
        let cart = self.mmu.cart.take();
        self.mmu = self.fresh_mmu(mode);
        if let Some(mut cart) = cart {
            cart.reset_banking();
            self.mmu.load_cart(cart);
        }
        self.renderer.discard_pending();
        self.sgb = SgbPacketState::default();
        self.autosave.reset();
        self.leftover_cycles = 0;
        self.refresh_graphics();
    }

    fn fresh_mmu(&self, mode: GbMode) -> Mmu {
        let mut mmu = Mmu::new(mode);
        mmu.ppu
            .pipeline
            .set_hblank_disabled(self.config.hblank_disabled);
        mmu
    }

    pub fn read_byte(&self, addr: u16) -> u8 {
        self.mmu.read_byte(addr)
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        self.mmu.write_byte(addr, val);
    }

    pub fn set_buttons(&mut self, held: u8) {
        self.mmu.set_buttons(held);
    }

    /// Run the LCD for `cycles` T-cycles, dispatching HBlank and frame-end
    /// work as it happens.
    pub fn step_video(&mut self, cycles: u32) {
        let mut remaining = cycles + self.leftover_cycles;
        while remaining >= STEP_CYCLES as u32 {
            remaining -= STEP_CYCLES as u32;
            let mut if_reg = self.mmu.if_reg();
            let event = self.mmu.ppu.step(STEP_CYCLES, &mut if_reg);
            self.mmu.set_if_reg(if_reg);
            match event {
                Some(LcdEvent::HBlank(line)) => self.hblank(line),
                Some(LcdEvent::VBlank) => self.end_frame(),
                None => {}
            }
        }
        self.leftover_cycles = remaining;
    }

    fn hblank(&mut self, line: u8) {
        self.mmu.hblank_dma();
        let ppu = &self.mmu.ppu;
        self.renderer
            .hblank(line as usize, &ppu.pipeline, ppu.vram.tile_priority_counts());
    }

    fn end_frame(&mut self) {
        let ppu = &mut self.mmu.ppu;
        let lcdc = ppu.lcdc();
        self.renderer
            .end_frame(&mut ppu.pipeline, &mut ppu.vram, lcdc);
        self.update_autosave();
    }

    /// Host vertical blank.
    pub fn host_vblank(&mut self) {
        self.renderer.vblank();
    }

    fn update_autosave(&mut self) {
        let Some(cart) = self.mmu.cart.as_mut() else {
            return;
        };
        let modified = cart.take_ram_modified();
        if !self.autosave.end_frame(modified, self.config.fast_forward) || !self.config.autosave {
            return;
        }
        match cart.sync_save() {
            Ok(sectors) => debug!("Autosave wrote {sectors} sectors"),
            Err(e) => warn!("Autosave failed: {e}"),
        }
    }

    pub fn autosave_pending(&self) -> bool {
        self.autosave.pending()
    }

    /// Write the whole save file now.
    pub fn save_game(&mut self) -> Result<()> {
        let cart = self.mmu.cart.as_mut().ok_or(CoreError::NoCartridge)?;
        cart.save_full()?;
        info!("Saved {}", cart.info().title);
        Ok(())
    }

    /// Redraw everything from VRAM and palette memory and mark every
    /// register group dirty for the next captures.
    pub fn refresh_graphics(&mut self) {
        let ppu = &mut self.mmu.ppu;
        let lcdc = ppu.lcdc();
        self.renderer.prime_palettes(ppu.bg_palette_data());
        self.renderer
            .refresh_all(&mut ppu.vram, &mut ppu.pipeline, lcdc);
        ppu.pipeline.mark_maps();
        ppu.pipeline.mark_sprites();
        ppu.pipeline.mark_bg_palettes();
        ppu.pipeline.mark_spr_palettes();
    }

    pub fn set_bank_loaded_hook(&mut self, hook: BankLoadedHook) -> Result<()> {
        let cart = self.mmu.cart.as_mut().ok_or(CoreError::NoCartridge)?;
        cart.set_bank_loaded_hook(hook);
        Ok(())
    }

    pub fn set_rumble_hook(&mut self, hook: RumbleHook) -> Result<()> {
        let cart = self.mmu.cart.as_mut().ok_or(CoreError::NoCartridge)?;
        cart.set_rumble_hook(hook);
        Ok(())
    }

    pub fn set_time_source(&mut self, source: TimeSource) -> Result<()> {
        let cart = self.mmu.cart.as_mut().ok_or(CoreError::NoCartridge)?;
        cart.set_time_source(source);
        Ok(())
    }

    /// Snapshot the machine together with the CPU's registers.
    pub fn capture_state(&self, cpu: &CpuState) -> Result<SaveState> {
        let cart = self.cart().ok_or(CoreError::NoCartridge)?;
        let ppu = &self.mmu.ppu;
        let mode = self.mmu.gb_mode();
        Ok(SaveState {
            version: STATE_VERSION,
            bg_palette: *ppu.bg_palette_data(),
            spr_palette: *ppu.spr_palette_data(),
            vram: Box::new(*ppu.vram.banks()),
            wram: Box::new(self.mmu.wram),
            high: Box::new(self.mmu.high_area()),
            ext_ram: cart.ram().data().to_vec(),
            cpu: *cpu,
            double_speed: self.mmu.double_speed(),
            gb_mode: mode,
            mapper: cart.mapper_regs(),
            wram_bank: self.mmu.wram_bank as u32,
            vram_bank: ppu.vram.bank() as u32,
            clock: *cart.clock(),
            scanline_counter: ppu.mode_clock() as i32,
            serial_counter: self.mmu.serial_counter,
            sgb: (mode == GbMode::Sgb).then(|| SgbBlock {
                packet: self.sgb,
                gfx_mask: self.renderer.gfx_mask(),
                map: *self.renderer.sgb_map(),
            }),
        })
    }

    /// Replace the machine state with `state` and hand back the CPU part.
    pub fn apply_state(&mut self, state: SaveState) -> Result<CpuState> {
        let mut cart = self.mmu.cart.take().ok_or(CoreError::NoCartridge)?;
        cart.restore_mapper_regs(&state.mapper);
        cart.load_ram(&state.ext_ram);
        cart.set_clock(state.clock);

        let mode = state.gb_mode;
        let mut mmu = self.fresh_mmu(mode);
        mmu.load_cart(cart);
        mmu.wram = *state.wram;
        mmu.load_high_area(&state.high);
        mmu.wram_bank = (state.wram_bank as usize).clamp(1, WRAM_BANKS - 1);
        mmu.set_double_speed(state.double_speed);
        mmu.serial_counter = state.serial_counter;
        let ppu = &mut mmu.ppu;
        ppu.load_palettes(&state.bg_palette, &state.spr_palette);
        ppu.vram.load(&state.vram);
        if mode.is_cgb() {
            ppu.vram.select_bank(state.vram_bank as usize);
        }
        ppu.set_mode_clock(state.scanline_counter.clamp(0, 455) as u16);
        self.mmu = mmu;

        self.renderer.set_mode(mode);
        self.renderer.discard_pending();
        match state.sgb {
            Some(sgb) => {
                self.sgb = sgb.packet;
                self.renderer.set_gfx_mask(sgb.gfx_mask);
                *self.renderer.sgb_map_mut() = sgb.map;
            }
            None => {
                self.sgb = SgbPacketState::default();
                self.renderer.set_gfx_mask(0);
            }
        }
        self.leftover_cycles = 0;
        self.refresh_graphics();
        Ok(state.cpu)
    }

    fn slot_file(&self, slot: Option<u32>) -> Result<PathBuf> {
        let rom = self
            .cart()
            .and_then(Cartridge::rom_path)
            .ok_or(CoreError::NoCartridge)?;
        Ok(slot_path(rom, slot))
    }

    /// Write slot `slot` (`None` for the suspend slot) next to the ROM.
    pub fn save_state(&self, slot: Option<u32>, cpu: &CpuState) -> Result<PathBuf> {
        let path = self.slot_file(slot)?;
        let state = self.capture_state(cpu)?;
        let kind = self.cart().map(Cartridge::kind).ok_or(CoreError::NoCartridge)?;
        fs::write(&path, state.encode(kind))?;
        info!("Saved state to {}", path.display());
        Ok(path)
    }

    /// Load slot `slot`. Nothing changes unless the whole file parses. The
    /// suspend slot is deleted once loaded; other slots resync the save
    /// file when autosave is on.
    pub fn load_state(&mut self, slot: Option<u32>) -> Result<CpuState> {
        let path = self.slot_file(slot)?;
        let data = fs::read(&path)?;
        let info = self.rom_info().ok_or(CoreError::NoCartridge)?;
        let state = SaveState::parse(&data, info)?;
        let version = state.version;
        let cpu = self.apply_state(state)?;
        info!("Loaded state v{version} from {}", path.display());

        match slot {
            None => {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {e}", path.display());
                }
            }
            Some(_) if self.config.autosave => self.save_game()?,
            Some(_) => {}
        }
        Ok(cpu)
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}
