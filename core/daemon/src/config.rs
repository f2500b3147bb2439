//! Runtime configuration for shiftd.
//!
//! Loaded from `~/.shiftd/config.toml` (or `SHIFTD_CONFIG`). Every section and
//! key is optional; a missing file yields defaults.

use serde::Deserialize;
use shift_core::{clock, ShiftClock, ShiftError};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".shiftd/config.toml";
pub const CONFIG_PATH_ENV: &str = "SHIFTD_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    #[serde(default = "default_day_start")]
    pub day_start: String,
    #[serde(default = "default_night_start")]
    pub night_start: String,
    /// Plant offset from UTC in minutes, e.g. 120 for UTC+2.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            day_start: default_day_start(),
            night_start: default_night_start(),
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub interval_secs: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_tick_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delay after a shift boundary before the sweep runs.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Upper bound between sweeps, so clock jumps and downtime are caught up.
    #[serde(default = "default_recheck_interval_secs")]
    pub recheck_interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_secs: default_grace_secs(),
            recheck_interval_secs: default_recheck_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            max_write_retries: default_max_write_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub ticker: TickerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl DaemonConfig {
    pub fn shift_clock(&self) -> Result<ShiftClock, ShiftError> {
        ShiftClock::new(
            &self.clock.day_start,
            &self.clock.night_start,
            self.clock.utc_offset_minutes,
        )
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.ticker.interval_secs.max(1))
    }

    pub fn sweep_grace(&self) -> Duration {
        Duration::from_secs(self.sweeper.grace_secs)
    }

    pub fn sweep_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.recheck_interval_secs.max(1))
    }

    pub fn max_write_retries(&self) -> u32 {
        self.store.max_write_retries.max(1)
    }
}

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_runtime_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read shiftd config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse shiftd config {}: {}",
            config_path.display(),
            err
        )
    })?;

    config
        .shift_clock()
        .map_err(|err| format!("Invalid shiftd config {}: {}", config_path.display(), err))?;
    Ok(config)
}

fn default_day_start() -> String {
    clock::DEFAULT_DAY_START.to_string()
}

fn default_night_start() -> String {
    clock::DEFAULT_NIGHT_START.to_string()
}

fn default_true() -> bool {
    true
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_grace_secs() -> u64 {
    5
}

fn default_recheck_interval_secs() -> u64 {
    900
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_max_write_retries() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use shift_core::ShiftType;

    #[test]
    fn defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config =
            load_runtime_config(Some(temp_dir.path().join("missing.toml"))).expect("load config");
        assert_eq!(config.clock.day_start, "07:00");
        assert_eq!(config.clock.night_start, "19:00");
        assert_eq!(config.ticker.interval_secs, 30);
        assert!(config.ticker.enabled);
        assert_eq!(config.sweeper.recheck_interval_secs, 900);
        assert_eq!(config.store.max_write_retries, 5);
    }

    #[test]
    fn parses_partial_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[clock]
day_start = "06:00"
night_start = "18:00"
utc_offset_minutes = 120

[ticker]
interval_secs = 10
"#,
        )
        .expect("write config");

        let config = load_runtime_config(Some(path)).expect("load config");
        assert_eq!(config.clock.utc_offset_minutes, 120);
        assert_eq!(config.tick_interval(), Duration::from_secs(10));
        assert_eq!(config.sweeper.grace_secs, 5);

        let clock = config.shift_clock().expect("clock");
        assert_eq!(clock.shift_minutes(ShiftType::Day), 12 * 60);
    }

    #[test]
    fn rejects_inverted_boundaries() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            "[clock]\nday_start = \"20:00\"\nnight_start = \"08:00\"\n",
        )
        .expect("write config");

        let err = load_runtime_config(Some(path)).unwrap_err();
        assert!(err.contains("Invalid shiftd config"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[ticker\ninterval_secs = ").expect("write config");
        assert!(load_runtime_config(Some(path)).is_err());
    }
}
