use serde::{Deserialize, Serialize};

use crate::bank_store::{DEFAULT_MAX_LOADED_BANKS, MAX_ROM_BANKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmulationMode {
    #[default]
    Auto,
    Dmg,
    Cgb,
}

impl EmulationMode {
    /// Hardware model to run a cartridge with the given header flags on.
    pub fn resolve(self, cgb_capable: bool, sgb_capable: bool, border: BorderMode) -> GbMode {
        match self {
            Self::Cgb => GbMode::Cgb,
            Self::Auto if cgb_capable => GbMode::Cgb,
            _ if sgb_capable && border == BorderMode::Sgb => GbMode::Sgb,
            _ => GbMode::Gb,
        }
    }
}

/// Hardware model the machine is currently running as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GbMode {
    #[default]
    Gb,
    Sgb,
    Cgb,
}

impl GbMode {
    pub fn is_cgb(self) -> bool {
        self == Self::Cgb
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Gb => 0,
            Self::Sgb => 1,
            Self::Cgb => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Gb),
            1 => Some(Self::Sgb),
            2 => Some(Self::Cgb),
            _ => None,
        }
    }
}

/// When the renderer waits for the host's vertical blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptWait {
    /// Always wait for the next vblank, even if one already passed.
    Always,
    /// Only wait when the emulator is ahead of the display.
    #[default]
    WhenBehind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BorderMode {
    #[default]
    None,
    Sgb,
    Custom,
}

impl BorderMode {
    pub fn is_loaded(self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoreConfig {
    pub max_loaded_banks: usize,
    pub autosave: bool,
    pub interrupt_wait: InterruptWait,
    pub fast_forward: bool,
    pub window_disabled: bool,
    pub hblank_disabled: bool,
    pub mode: EmulationMode,
    pub border: BorderMode,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_loaded_banks: DEFAULT_MAX_LOADED_BANKS,
            autosave: true,
            interrupt_wait: InterruptWait::default(),
            fast_forward: false,
            window_disabled: false,
            hblank_disabled: false,
            mode: EmulationMode::default(),
            border: BorderMode::default(),
        }
    }
}

impl CoreConfig {
    /// Resident ROM bank pool size, clamped to what the bank store accepts.
    pub fn max_loaded_banks(&self) -> usize {
        self.max_loaded_banks.clamp(2, MAX_ROM_BANKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_pool_size_is_clamped() {
        let mut cfg = CoreConfig::default();
        assert_eq!(cfg.max_loaded_banks(), 128);
        cfg.max_loaded_banks = 0;
        assert_eq!(cfg.max_loaded_banks(), 2);
        cfg.max_loaded_banks = 4096;
        assert_eq!(cfg.max_loaded_banks(), 512);
    }

    #[test]
    fn mode_resolution_prefers_color_hardware() {
        assert_eq!(EmulationMode::Auto.resolve(true, true, BorderMode::Sgb), GbMode::Cgb);
        assert_eq!(EmulationMode::Auto.resolve(false, true, BorderMode::Sgb), GbMode::Sgb);
        assert_eq!(EmulationMode::Auto.resolve(false, true, BorderMode::None), GbMode::Gb);
        assert_eq!(EmulationMode::Dmg.resolve(true, false, BorderMode::None), GbMode::Gb);
        assert_eq!(EmulationMode::Cgb.resolve(false, false, BorderMode::None), GbMode::Cgb);
    }
}
