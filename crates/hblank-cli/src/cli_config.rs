use hblank_core::config::CoreConfig;
use log::warn;
use std::path::{Path, PathBuf};

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("hblank").join("core.toml");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("hblank").join("core.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("hblank")
            .join("core.toml");
    }

    PathBuf::from("core.toml")
}

pub fn load_from_file(path: &Path) -> CoreConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return CoreConfig::default(),
    };

    match toml::from_str::<CoreConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse config {}: {e}; using defaults",
                path.display()
            );
            CoreConfig::default()
        }
    }
}

pub fn save_to_file(path: &Path, cfg: &CoreConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let text = toml::to_string_pretty(cfg).unwrap_or_else(|_| String::new());
    std::fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hblank_core::config::{BorderMode, InterruptWait};

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_from_file(&dir.path().join("absent.toml"));
        assert_eq!(cfg.max_loaded_banks, 128);
        assert!(cfg.autosave);
    }

    #[test]
    fn bad_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.toml");
        std::fs::write(&path, "autosave = \"sometimes\"").unwrap();
        assert!(load_from_file(&path).autosave);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("core.toml");
        let cfg = CoreConfig {
            max_loaded_banks: 16,
            interrupt_wait: InterruptWait::Always,
            border: BorderMode::Sgb,
            ..CoreConfig::default()
        };
        save_to_file(&path, &cfg).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("max-loaded-banks = 16"));
        assert!(text.contains("interrupt-wait = \"always\""));

        let loaded = load_from_file(&path);
        assert_eq!(loaded.max_loaded_banks, 16);
        assert_eq!(loaded.interrupt_wait, InterruptWait::Always);
        assert_eq!(loaded.border, BorderMode::Sgb);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.toml");
        std::fs::write(&path, "fast-forward = true\nmode = \"cgb\"\n").unwrap();
        let cfg = load_from_file(&path);
        assert!(cfg.fast_forward);
        assert_eq!(cfg.mode, hblank_core::config::EmulationMode::Cgb);
        assert_eq!(cfg.max_loaded_banks, 128);
    }
}
