/// Configuration loading and validation
use super::schemas::{
    Config, DetectorConfig, LoggingConfig, RetentionConfig, SchedulerConfig, StorageConfig,
    TriggerConfig,
};
use crate::errors::{DipwatchError, DipwatchResult};
use crate::logger::LogLevel;
use crate::storage::types::SignalParams;
use std::path::Path;

/// Parse and validate a config file.
///
/// A missing file yields the defaults; an unreadable or invalid one is a
/// `Config` error.
pub fn read_config_file(path: &Path) -> DipwatchResult<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|e| {
        DipwatchError::Config(format!("failed to read config file '{}': {}", path.display(), e))
    })?;
    let config = toml::from_str::<Config>(&contents).map_err(|e| {
        DipwatchError::Config(format!("failed to parse config file '{}': {}", path.display(), e))
    })?;

    validate_config(&config)?;
    Ok(config)
}

fn section_fields(section: &str) -> Option<&'static [&'static str]> {
    match section {
        "storage" => Some(StorageConfig::FIELDS),
        "trigger" => Some(TriggerConfig::FIELDS),
        "detector" => Some(DetectorConfig::FIELDS),
        "retention" => Some(RetentionConfig::FIELDS),
        "scheduler" => Some(SchedulerConfig::FIELDS),
        "logging" => Some(LoggingConfig::FIELDS),
        _ => None,
    }
}

/// Dotted names of keys in a config file that no section declares.
///
/// serde drops them silently; callers log them so a misspelled key does not
/// quietly fall back to its default. Missing or unparseable files yield
/// nothing (`read_config_file` reports those).
pub fn unknown_keys(path: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let Ok(root) = toml::from_str::<toml::Table>(&contents) else {
        return Vec::new();
    };

    let mut unknown = Vec::new();
    for (section, value) in &root {
        if !Config::FIELDS.contains(&section.as_str()) {
            unknown.push(section.clone());
            continue;
        }
        let (Some(fields), toml::Value::Table(table)) = (section_fields(section), value) else {
            continue;
        };
        for key in table.keys() {
            if !fields.contains(&key.as_str()) {
                unknown.push(format!("{}.{}", section, key));
            }
        }
    }
    unknown
}

fn positive_finite(name: &str, value: f64) -> DipwatchResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DipwatchError::Config(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

/// Reject values that would make the engine misbehave
pub fn validate_config(config: &Config) -> DipwatchResult<()> {
    let trigger = &config.trigger;
    positive_finite("trigger.tp1_pct", trigger.tp1_pct)?;
    positive_finite("trigger.sl_pct", trigger.sl_pct)?;
    if trigger.sl_pct >= 100.0 {
        return Err(DipwatchError::Config(
            "trigger.sl_pct must be below 100".to_string(),
        ));
    }
    if trigger.lookahead_secs == 0 {
        return Err(DipwatchError::Config(
            "trigger.lookahead_secs must be greater than 0".to_string(),
        ));
    }
    if trigger.batch_limit == 0 {
        return Err(DipwatchError::Config(
            "trigger.batch_limit must be greater than 0".to_string(),
        ));
    }

    let detector = &config.detector;
    positive_finite("detector.min_drop_pct", detector.min_drop_pct)?;
    positive_finite("detector.max_drop_pct", detector.max_drop_pct)?;
    if detector.min_drop_pct > detector.max_drop_pct || detector.max_drop_pct > 100.0 {
        return Err(DipwatchError::Config(format!(
            "detector drop range [{}, {}] is invalid",
            detector.min_drop_pct, detector.max_drop_pct
        )));
    }
    if !detector.min_volume_24h.is_finite() || detector.min_volume_24h < 0.0 {
        return Err(DipwatchError::Config(
            "detector.min_volume_24h must be >= 0".to_string(),
        ));
    }

    if let Err(e) = config.logging.level.parse::<LogLevel>() {
        return Err(DipwatchError::Config(format!("logging.level: {}", e)));
    }

    if config.scheduler.interval_secs == 0 {
        return Err(DipwatchError::Config(
            "scheduler.interval_secs must be greater than 0".to_string(),
        ));
    }
    if config.scheduler.lock_stale_after_secs == 0 {
        return Err(DipwatchError::Config(
            "scheduler.lock_stale_after_secs must be greater than 0".to_string(),
        ));
    }
    if config.scheduler.interval_secs >= config.scheduler.lock_stale_after_secs {
        return Err(DipwatchError::Config(format!(
            "scheduler.interval_secs ({}) must be below scheduler.lock_stale_after_secs ({})",
            config.scheduler.interval_secs, config.scheduler.lock_stale_after_secs
        )));
    }

    Ok(())
}

impl TriggerConfig {
    /// Parameters frozen into a new signal
    pub fn signal_params(&self) -> SignalParams {
        SignalParams {
            tp1_pct: self.tp1_pct,
            sl_pct: self.sl_pct,
            lookahead_ms: (self.lookahead_secs as i64).saturating_mul(1000),
            timeframe: self.timeframe,
        }
    }
}
