//! Configuration file loading (§6): `~/.gocat.yml` or `~/.gocat.json`.
//!
//! The teacher has no config-file layer; this is grounded on the wider
//! pack's `serde`-driven config idioms (YAML/JSON manifests throughout the
//! pack) plus `directories::BaseDirs` for home-directory discovery, playing
//! the same role as the teacher's would-be `ProjectDirs` use if it had one.
//! Duration fields use `humantime_serde`, matching jetsocat's split between
//! `humantime::parse_duration` for CLI flags and a serde-integrated sibling
//! for config-file fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::GocatError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub defaults: Defaults,
    pub logging: Logging,
    pub network: Network,
    pub security: Security,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    #[serde(with = "humantime_serde::option", default)]
    pub timeout: Option<Duration>,
    pub retry: Option<u32>,
    pub keep_alive: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: None,
            keep_alive: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Network {
    pub ipv6: Option<bool>,
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Security {
    pub verify_cert: Option<bool>,
    pub ca_cert: Option<PathBuf>,
}

/// Locate `~/.gocat.yml` or `~/.gocat.json`, preferring YAML if both exist.
pub fn discover_path() -> Option<PathBuf> {
    let base_dirs = directories::BaseDirs::new()?;
    let home = base_dirs.home_dir();
    let yml = home.join(".gocat.yml");
    if yml.exists() {
        return Some(yml);
    }
    let json = home.join(".gocat.json");
    if json.exists() {
        return Some(json);
    }
    None
}

/// Load and parse the config file at `path`, selecting the format by
/// extension (`.yml`/`.yaml` -> YAML, anything else -> JSON).
pub fn load(path: &Path) -> Result<Config, GocatError> {
    let raw = std::fs::read_to_string(path).map_err(GocatError::Io)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    );
    if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| GocatError::Validation(format!("invalid config file {}: {e}", path.display())))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| GocatError::Validation(format!("invalid config file {}: {e}", path.display())))
    }
}

/// Load from the discovered default path, returning defaults if none exists.
pub fn load_default() -> Result<Config, GocatError> {
    resolve_default(discover_path())
}

/// The fallback decision behind [`load_default`], split out so the
/// no-file-found branch is testable without touching the real home
/// directory.
fn resolve_default(path: Option<PathBuf>) -> Result<Config, GocatError> {
    match path {
        Some(path) => load(&path),
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_config() {
        let yaml = r#"
defaults:
  timeout: 5s
  retry: 3
  keep_alive: true
logging:
  level: debug
network:
  buffer_size: 4096
security:
  verify_cert: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.defaults.timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.defaults.retry, Some(3));
        assert!(cfg.defaults.keep_alive);
        assert_eq!(cfg.logging.level.as_deref(), Some("debug"));
        assert_eq!(cfg.network.buffer_size, Some(4096));
        assert_eq!(cfg.security.verify_cert, Some(true));
    }

    #[test]
    fn parses_json_config() {
        let json = r#"{"defaults": {"retry": 5}, "network": {"ipv6": true}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.defaults.retry, Some(5));
        assert_eq!(cfg.network.ipv6, Some(true));
    }

    #[test]
    fn load_on_missing_path_errors() {
        let cfg = load(Path::new("/nonexistent/.gocat.yml"));
        assert!(cfg.is_err());
    }

    #[test]
    fn load_default_falls_back_to_config_defaults_when_no_file_found() {
        let cfg = resolve_default(None).unwrap();
        assert_eq!(cfg.defaults.timeout, None);
        assert_eq!(cfg.defaults.retry, None);
        assert!(!cfg.defaults.keep_alive);
        assert!(cfg.logging.level.is_none());
        assert!(cfg.network.ipv6.is_none());
        assert!(cfg.security.verify_cert.is_none());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.defaults.timeout.is_none());
        assert!(!cfg.defaults.keep_alive);
    }
}
