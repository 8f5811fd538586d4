use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const SUPPORTED_SCHEMA: u64 = 1;

pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_BACKUP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;
pub const DEFAULT_RECALCULATION_DEBOUNCE_MS: u64 = 300;
pub const MAX_RECOVERY_ELAPSED_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    pub sync_interval_ms: u64,
    pub backup_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub recalculation_debounce_ms: u64,
    pub max_recovery_elapsed_ms: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            backup_interval_ms: DEFAULT_BACKUP_INTERVAL_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            recalculation_debounce_ms: DEFAULT_RECALCULATION_DEBOUNCE_MS,
            max_recovery_elapsed_ms: MAX_RECOVERY_ELAPSED_MS,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.sync_interval_ms == 0 {
            return Err("syncIntervalMs must be > 0".to_string());
        }
        if self.backup_interval_ms == 0 {
            return Err("backupIntervalMs must be > 0".to_string());
        }
        if self.tick_interval_ms == 0 {
            return Err("tickIntervalMs must be > 0".to_string());
        }
        if self.max_recovery_elapsed_ms <= 0 {
            return Err("maxRecoveryElapsedMs must be > 0".to_string());
        }
        Ok(())
    }
}

fn default_app_config() -> serde_json::Value {
    let defaults = TrackerConfig::default();
    serde_json::json!({
        "schema": SUPPORTED_SCHEMA,
        "appName": "daytrack",
        "syncIntervalMs": defaults.sync_interval_ms,
        "backupIntervalMs": defaults.backup_interval_ms,
        "tickIntervalMs": defaults.tick_interval_ms,
        "recalculationDebounceMs": defaults.recalculation_debounce_ms,
        "maxRecoveryElapsedMs": defaults.max_recovery_elapsed_ms
    })
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&default_app_config())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_tracker_config(config_dir: &Path) -> Result<TrackerConfig, InfraError> {
    let path = config_dir.join(APP_JSON);
    let raw = read_config(&path)?;
    let config: TrackerConfig = serde_json::from_value(raw)?;
    config
        .validate()
        .map_err(|message| InfraError::InvalidConfig(format!("{message} in {}", path.display())))?;
    Ok(config)
}
