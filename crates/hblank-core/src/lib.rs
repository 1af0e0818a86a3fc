//! Game Boy / Game Boy Color core built around a tile-composition display.
//!
//! ROM banks are streamed on demand, cartridge controllers are a closed set
//! of states, and the screen is rebuilt from per-scanline register
//! snapshots instead of being rasterized pixel by pixel. The CPU
//! interpreter is external and drives the machine through [`gameboy`].

/// On-demand ROM bank pool with LRU eviction.
pub mod bank_store;

/// Header parsing and memory bank controllers.
pub mod cartridge;

/// User-facing settings.
pub mod config;

/// Register model of the composition hardware the renderer programs.
pub mod display;

/// Error type for load-time and persistence operations.
pub mod error;

/// The machine aggregate.
pub mod gameboy;

/// Memory map, I/O registers and DMA.
pub mod mmu;

/// LCD registers and mode timing.
pub mod ppu;

/// Scanline-driven display composition.
pub mod renderer;

/// Cartridge real-time clocks.
pub mod rtc;

/// Per-scanline register snapshots.
pub mod scanline;

/// Battery RAM, save files and autosave.
pub mod sram;

/// Versioned save states.
pub mod state;

/// VRAM shadow with tile and map change queues.
pub mod vram;

pub use error::{CoreError, Result};
pub use gameboy::GameBoy;
