mod cli_config;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use hblank_core::{
    GameBoy, Result,
    cartridge::Cartridge,
    config::CoreConfig,
    state::{SaveState, slot_path},
};
use log::info;

#[derive(Parser)]
#[command(name = "hblank", version, about = "Inspect ROMs, save files and save states")]
struct Args {
    /// Path to the core config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the cartridge header summary
    Info {
        /// Path to ROM file
        rom: PathBuf,
    },

    /// Create or resize the ROM's save file and write it in full
    SyncSave {
        /// Path to ROM file
        rom: PathBuf,
    },

    /// Describe a save state belonging to a ROM
    StateInfo {
        /// Path to ROM file
        rom: PathBuf,

        /// State slot; omit for the suspend state
        #[arg(long)]
        slot: Option<u32>,
    },

    /// Write the current config (defaults if none exists) back to disk
    InitConfig,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(cli_config::default_config_path);
    let config = cli_config::load_from_file(&config_path);

    let result = match args.command {
        Command::Info { rom } => print_info(&rom, &config),
        Command::SyncSave { rom } => sync_save(&rom, config),
        Command::StateInfo { rom, slot } => print_state(&rom, slot, &config),
        Command::InitConfig => match cli_config::save_to_file(&config_path, &config) {
            Ok(()) => {
                println!("Wrote {}", config_path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Parse the header from an in-memory copy so no save file is touched.
fn read_cart(rom: &Path, config: &CoreConfig) -> Result<Cartridge> {
    let data = std::fs::read(rom)?;
    Cartridge::from_bytes(data, config)
}

fn print_info(rom: &Path, config: &CoreConfig) -> Result<()> {
    let cart = read_cart(rom, config)?;
    let info = cart.info();
    println!("{info}");
    println!(
        "CGB: {}  SGB: {}  Save: {} bytes",
        if info.supports_cgb() { "yes" } else { "no" },
        if info.supports_sgb() { "yes" } else { "no" },
        info.save_len()
    );
    Ok(())
}

fn sync_save(rom: &Path, config: CoreConfig) -> Result<()> {
    let mut gb = GameBoy::new(config);
    gb.load_rom(rom)?;
    gb.save_game()?;
    match gb.cart().and_then(Cartridge::save_path) {
        Some(path) => println!("Synced {}", path.display()),
        None => println!("Cartridge has no battery RAM"),
    }
    gb.unload();
    Ok(())
}

fn print_state(rom: &Path, slot: Option<u32>, config: &CoreConfig) -> Result<()> {
    let cart = read_cart(rom, config)?;
    let path = slot_path(rom, slot);
    info!("Reading {}", path.display());
    let data = std::fs::read(&path)?;
    let state = SaveState::parse(&data, cart.info())?;

    println!("State: {} (version {})", path.display(), state.version);
    println!("Mode: {:?}", state.gb_mode);
    println!(
        "PC: {:04X}  SP: {:04X}  AF: {:04X}  IME: {}",
        state.cpu.pc, state.cpu.sp, state.cpu.af, state.cpu.ime
    );
    println!(
        "ROM bank: {}  RAM bank: {}  RAM enabled: {}",
        state.mapper.rom_bank, state.mapper.ram_bank, state.mapper.ram_enabled
    );
    println!("Double speed: {}", state.double_speed);
    if let Some(sgb) = &state.sgb {
        println!("SGB command: {:#04x}  mask: {}", sgb.packet.command, sgb.gfx_mask);
    }
    Ok(())
}
