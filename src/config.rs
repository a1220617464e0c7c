use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::dispatch::RetryPolicy;

/// How undo windows of the same kind share a surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UndoSlotPolicy {
    /// Every mutation gets its own window.
    #[default]
    Independent,
    /// One window per owner, scope and kind; a new one commits the old.
    SingleSlot,
}

impl std::str::FromStr for UndoSlotPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "independent" => Ok(UndoSlotPolicy::Independent),
            "single-slot" | "single" => Ok(UndoSlotPolicy::SingleSlot),
            other => Err(format!("unknown undo slot policy: {other}")),
        }
    }
}

/// Runtime config.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub undo_window_ms: u64,
    pub undo_slot: UndoSlotPolicy,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// 0 disables the periodic drain.
    pub tick_interval_ms: u64,
    /// Drain right after a commit instead of waiting for the next tick.
    pub auto_dispatch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            undo_window_ms: 5_000,
            undo_slot: UndoSlotPolicy::Independent,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
            tick_interval_ms: 15_000,
            auto_dispatch: true,
        }
    }
}

/// On-disk representation. Every field is optional; missing ones fall back
/// to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_window_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_slot: Option<UndoSlotPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_dispatch: Option<bool>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shelflife")
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shelflife")
        .join("config.json")
}

impl FileConfig {
    pub fn load() -> Result<Option<Self>, String> {
        let path = config_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).map_err(|e| format!("read config: {e}"))?;
        let cfg: FileConfig = serde_json::from_str(&data).map_err(|e| format!("parse config: {e}"))?;
        Ok(Some(cfg))
    }

    pub fn save(&self) -> Result<(), String> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| format!("serialize config: {e}"))?;
        fs::write(&path, data).map_err(|e| format!("write config: {e}"))
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring unparseable {}={:?}", var, raw);
            None
        }
    }
}

impl Config {
    /// Layer a file config over the defaults.
    pub fn from_file_config(fc: &FileConfig) -> Self {
        let d = Config::default();
        Config {
            data_dir: fc.data_dir.clone().unwrap_or(d.data_dir),
            undo_window_ms: fc.undo_window_ms.unwrap_or(d.undo_window_ms),
            undo_slot: fc.undo_slot.unwrap_or(d.undo_slot),
            retry_base_ms: fc.retry_base_ms.unwrap_or(d.retry_base_ms),
            retry_max_ms: fc.retry_max_ms.unwrap_or(d.retry_max_ms),
            tick_interval_ms: fc.tick_interval_ms.unwrap_or(d.tick_interval_ms),
            auto_dispatch: fc.auto_dispatch.unwrap_or(d.auto_dispatch),
        }
    }

    /// Apply whichever `SHELFLIFE_*` variables are set.
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("SHELFLIFE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_parse("SHELFLIFE_UNDO_WINDOW_MS") {
            self.undo_window_ms = ms;
        }
        if let Some(policy) = env_parse("SHELFLIFE_UNDO_SLOT") {
            self.undo_slot = policy;
        }
        if let Some(ms) = env_parse("SHELFLIFE_RETRY_BASE_MS") {
            self.retry_base_ms = ms;
        }
        if let Some(ms) = env_parse("SHELFLIFE_RETRY_MAX_MS") {
            self.retry_max_ms = ms;
        }
        if let Some(ms) = env_parse("SHELFLIFE_TICK_MS") {
            self.tick_interval_ms = ms;
        }
        if let Ok(v) = std::env::var("SHELFLIFE_AUTO_DISPATCH") {
            self.auto_dispatch = v == "true" || v == "1";
        }
        self
    }

    /// Resolution order: env vars → config file → defaults.
    pub fn resolve() -> Self {
        let base = match FileConfig::load() {
            Ok(Some(fc)) => {
                log::info!("Config loaded from file");
                Self::from_file_config(&fc)
            }
            Ok(None) => {
                log::debug!("No config file found, using defaults");
                Config::default()
            }
            Err(e) => {
                log::warn!("Config file error: {}", e);
                Config::default()
            }
        };
        base.apply_env()
    }

    pub fn undo_window(&self) -> Duration {
        Duration::from_millis(self.undo_window_ms)
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        (self.tick_interval_ms > 0).then(|| Duration::from_millis(self.tick_interval_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            max: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
        }
    }
}
