//! Configuration module for board calibration and daemon settings.
//!
//! This module handles loading, saving, and validating daemon configuration.
//! Hardware variants that older firmware selected with compile-time flags
//! (battery tables, divider networks, detection pins) are plain runtime
//! data here.

use crate::charger::PinSet;
use crate::error::ConfigError;
use crate::estimator::EstimatorTuning;
use crate::sampler::DividerConfig;
use crate::store::StoreFormat;
use crate::table::CapacityTable;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

fn default_true() -> bool {
    true
}

fn default_adc_path() -> String {
    "/sys/bus/iio/devices/iio:device0/in_voltage0_raw".to_string()
}

fn default_profile() -> String {
    "bt-b0bfn-3474107".to_string()
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_window() -> usize {
    15
}

fn default_usb_identify_ticks() -> u32 {
    5
}

fn default_resume_recompute_secs() -> u64 {
    3600
}

/// Board-specific calibration and wiring.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BoardConfig {
    /// IIO raw attribute of the battery channel.
    #[serde(default = "default_adc_path")]
    pub adc_path: String,
    #[serde(default)]
    pub divider: DividerConfig,
    #[serde(default)]
    pub pins: PinSet,
    /// Named factory calibration, ignored when `custom_table` is set.
    #[serde(default = "default_profile")]
    pub battery_profile: String,
    #[serde(default)]
    pub custom_table: Option<CapacityTable>,
    /// Power-off threshold in mV; 0 selects the table's zero voltage.
    #[serde(default)]
    pub low_voltage_protection_mv: i32,
    #[serde(default = "default_true")]
    pub save_capacity: bool,
    #[serde(default)]
    pub store_format: StoreFormat,
    /// Capacity record location; defaults next to the daemon's data dir.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            adc_path: default_adc_path(),
            divider: DividerConfig::default(),
            pins: PinSet::default(),
            battery_profile: default_profile(),
            custom_table: None,
            low_voltage_protection_mv: 0,
            save_capacity: true,
            store_format: StoreFormat::Flat,
            store_path: None,
        }
    }
}

/// Runtime behavior knobs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DaemonConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Moving-average window, samples.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_usb_identify_ticks")]
    pub usb_identify_ticks: u32,
    #[serde(default)]
    pub tuning: EstimatorTuning,
    /// Hold a wake lock while a supply is attached.
    #[serde(default)]
    pub wake_lock: bool,
    #[serde(default = "default_resume_recompute_secs")]
    pub resume_recompute_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            window: default_window(),
            usb_identify_ticks: default_usb_identify_ticks(),
            tuning: EstimatorTuning::default(),
            wake_lock: false,
            resume_recompute_secs: default_resume_recompute_secs(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Resolve the battery table from profile name or custom data.
    pub fn table(&self) -> Result<CapacityTable, ConfigError> {
        let table = match &self.board.custom_table {
            Some(table) => table.clone(),
            None => CapacityTable::preset(&self.board.battery_profile).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "unknown battery profile '{}'",
                    self.board.battery_profile
                ))
            })?,
        };
        table.validate()?;
        Ok(table)
    }

    /// Validate configuration values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.tick_ms < 100 {
            return Err(ConfigError::ValidationError(format!(
                "tick_ms ({}) must be at least 100",
                self.daemon.tick_ms
            )));
        }

        if self.daemon.window == 0 || self.daemon.window > 120 {
            return Err(ConfigError::ValidationError(format!(
                "window ({}) must be within 1-120 samples",
                self.daemon.window
            )));
        }

        if self.board.divider.vref_mv <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "vref_mv ({}) must be positive",
                self.board.divider.vref_mv
            )));
        }

        if self.board.divider.pull_down_ohm <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "pull_down_ohm ({}) must be positive",
                self.board.divider.pull_down_ohm
            )));
        }

        if self.board.divider.pull_up_ohm < 0 {
            return Err(ConfigError::ValidationError(format!(
                "pull_up_ohm ({}) must not be negative",
                self.board.divider.pull_up_ohm
            )));
        }

        let tuning = &self.daemon.tuning;
        if tuning.charge_min_ticks <= 10 || tuning.discharge_min_ticks <= 10 {
            return Err(ConfigError::ValidationError(
                "convergence base ticks must exceed the 10-tick ladder reduction".to_string(),
            ));
        }

        if tuning.full_debounce_ticks == 0 {
            return Err(ConfigError::ValidationError(
                "full_debounce_ticks must be at least 1".to_string(),
            ));
        }

        if tuning.charge_max_ticks <= tuning.charge_mid_ticks {
            return Err(ConfigError::ValidationError(format!(
                "charge_max_ticks ({}) must exceed charge_mid_ticks ({})",
                tuning.charge_max_ticks, tuning.charge_mid_ticks
            )));
        }

        if self.daemon.usb_identify_ticks == 0 {
            return Err(ConfigError::ValidationError(
                "usb_identify_ticks must be at least 1".to_string(),
            ));
        }

        // Resolves and validates the table as a side effect.
        self.table()?;

        Ok(())
    }

    /// Capacity record path, configured or defaulted under the data dir.
    pub fn store_path(&self) -> PathBuf {
        match &self.board.store_path {
            Some(path) => path.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("adc-batteryd")
                .join("capacity.dat"),
        }
    }
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<Config>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read config file: {}", e))
            })?;

            let config: Config = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            // Validate loaded config
            config.validate()?;
            config
        } else {
            Config::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self
            .config
            .read()
            .map_err(|_| ConfigError::ValidationError("Failed to acquire read lock".to_string()))?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&*config)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> Config {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Update configuration with validation.
    pub fn update(&self, config: Config) -> Result<(), ConfigError> {
        // Validate before updating
        config.validate()?;

        let mut current = self
            .config
            .write()
            .map_err(|_| ConfigError::ValidationError("Failed to acquire write lock".to_string()))?;

        *current = config;

        // Release lock before saving
        drop(current);

        // Persist to file
        self.save()
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default config path (~/.config/adc-batteryd/config.json).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("adc-batteryd")
            .join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.daemon.tick_ms, 1000);
        assert_eq!(config.daemon.window, 15);
        assert_eq!(config.daemon.usb_identify_ticks, 5);
        assert_eq!(config.daemon.tuning, EstimatorTuning::default());
        assert!(config.board.save_capacity);
    }

    #[test]
    fn test_config_manager_load_nonexistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.json");

        let manager = ConfigManager::load_or_default(&path).unwrap();
        let config = manager.get();

        // Should use defaults when file doesn't exist
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_manager_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let manager = ConfigManager::load_or_default(&path).unwrap();
        let mut config = manager.get();
        config.daemon.tick_ms = 2000;
        config.board.battery_profile = "bt-c0b2g".to_string();
        config.board.divider.vref_mv = 1800;
        manager.update(config.clone()).unwrap();

        let manager2 = ConfigManager::load_or_default(&path).unwrap();
        let loaded = manager2.get();

        assert_eq!(loaded.daemon.tick_ms, 2000);
        assert_eq!(loaded.board.battery_profile, "bt-c0b2g");
        assert_eq!(loaded.board.divider.vref_mv, 1800);
    }

    #[test]
    fn test_validation_rejects_unknown_profile() {
        let mut config = Config::default();
        config.board.battery_profile = "bt-nonexistent".to_string();

        let result = config.validate();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validation_rejects_short_tick() {
        let mut config = Config::default();
        config.daemon.tick_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_pull_down() {
        let mut config = Config::default();
        config.board.divider.pull_down_ohm = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_ladder_underflow() {
        let mut config = Config::default();
        config.daemon.tuning.charge_min_ticks = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unsorted_custom_table() {
        let mut config = Config::default();
        let mut table = CapacityTable::preset("bt-b0bfn-3474107").unwrap();
        table.discharge_mv[5] = table.discharge_mv[4];
        config.board.custom_table = Some(table);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_custom_table_overrides_profile() {
        let mut config = Config::default();
        let table = CapacityTable::preset("bt-c0b2g").unwrap();
        config.board.custom_table = Some(table.clone());
        config.board.battery_profile = "bt-nonexistent".to_string();

        // The bogus profile name is ignored in favor of the custom table.
        assert_eq!(config.table().unwrap(), table);
    }

    fn profile_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("bt-b0bfn-3474107".to_string()),
            Just("bt-b0bdn-3574108".to_string()),
            Just("bt-c0b2g".to_string()),
            Just("bt-d001-386789".to_string()),
        ]
    }

    fn valid_config_strategy() -> impl Strategy<Value = Config> {
        (
            100u64..=10_000,
            1usize..=120,
            prop_oneof![Just(1800i32), Just(2500i32), Just(3300i32)],
            1i32..=1000,
            profile_strategy(),
            11u32..=200,
            1u32..=30,
        )
            .prop_map(
                |(tick_ms, window, vref, pull_down, profile, base_ticks, debounce)| {
                    let mut config = Config::default();
                    config.daemon.tick_ms = tick_ms;
                    config.daemon.window = window;
                    config.board.divider.vref_mv = vref;
                    config.board.divider.pull_down_ohm = pull_down;
                    config.board.battery_profile = profile;
                    config.daemon.tuning.charge_min_ticks = base_ticks;
                    config.daemon.tuning.discharge_min_ticks = base_ticks;
                    config.daemon.tuning.full_debounce_ticks = debounce;
                    config
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_config_json_round_trip(config in valid_config_strategy()) {
            let json = serde_json::to_string(&config).unwrap();
            let parsed: Config = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(config, parsed);
        }

        #[test]
        fn prop_config_file_round_trip(config in valid_config_strategy()) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("config.json");

            let manager = ConfigManager::load_or_default(&path).unwrap();
            manager.update(config.clone()).unwrap();

            let manager2 = ConfigManager::load_or_default(&path).unwrap();
            prop_assert_eq!(config, manager2.get());
        }

        #[test]
        fn prop_valid_configs_pass_validation(config in valid_config_strategy()) {
            prop_assert!(config.validate().is_ok());
        }
    }
}
