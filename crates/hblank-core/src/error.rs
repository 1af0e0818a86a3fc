use std::io;

use thiserror::Error;

use crate::cartridge::MbcKind;

/// Errors surfaced by load-time and persistence operations.
///
/// Bus accesses never produce these; they degrade to open-bus reads and
/// dropped writes instead.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported cartridge type {0:#04x}")]
    UnsupportedMapper(u8),

    #[error("{0} cartridges are not supported")]
    UnsupportedController(MbcKind),

    #[error("ROM image is too small ({0} bytes)")]
    RomTooSmall(usize),

    #[error("state is from an incompatible version ({found}, newest supported is {supported})")]
    IncompatibleState { found: u32, supported: u32 },

    #[error("state file is truncated")]
    TruncatedState,

    #[error("no cartridge loaded")]
    NoCartridge,
}

pub type Result<T> = std::result::Result<T, CoreError>;
