/// Configuration schemas - every section declared once with its defaults
use crate::config_struct;
use crate::storage::types::{TieBreak, Timeframe};

// ============================================================================
// STORAGE
// ============================================================================

config_struct! {
    pub struct StorageConfig {
        /// SQLite file. Empty means `<data dir>/dipwatch.db`.
        db_path: String = String::new(),
    }
}

// ============================================================================
// TRIGGER EVALUATION
// ============================================================================

config_struct! {
    /// Strategy parameters stamped onto new signals, and analyzer settings
    pub struct TriggerConfig {
        tp1_pct: f64 = 40.0,
        sl_pct: f64 = 50.0,
        lookahead_secs: u64 = 86_400,
        timeframe: Timeframe = Timeframe::Minute5,
        /// Resolution when one bar touches both TP1 and SL
        tie_break: TieBreak = TieBreak::SlFirst,
        /// Max PENDING rows examined per analyzer run
        batch_limit: usize = 100,
    }
}

// ============================================================================
// DIP DETECTOR
// ============================================================================

config_struct! {
    pub struct DetectorConfig {
        enabled: bool = true,
        min_drop_pct: f64 = 50.0,
        max_drop_pct: f64 = 60.0,
        max_pair_age_hours: u64 = 24,
        min_volume_24h: f64 = 500.0,
        /// Minimum gap between two signals on the same pair
        cooldown_secs: u64 = 3_600,
    }
}

// ============================================================================
// RETENTION
// ============================================================================

config_struct! {
    pub struct RetentionConfig {
        price_bar_max_age_hours: u64 = 24,
        /// Terminal signals older than this are deleted with their evaluation
        archive_horizon_hours: u64 = 168,
        /// Prune at the end of every `run` cycle
        auto_prune: bool = true,
        vacuum: bool = false,
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

config_struct! {
    pub struct SchedulerConfig {
        interval_secs: u64 = 60,
        /// A lock whose heartbeat is older than this is reclaimable
        lock_stale_after_secs: u64 = 600,
    }
}

// ============================================================================
// LOGGING
// ============================================================================

config_struct! {
    pub struct LoggingConfig {
        /// Console threshold when neither --verbose nor --quiet is given
        level: String = "info".to_string(),
        file_enabled: bool = true,
        /// Empty means `<base dir>/logs`
        logs_dir: String = String::new(),
    }
}

// ============================================================================
// ROOT
// ============================================================================

config_struct! {
    pub struct Config {
        storage: StorageConfig = StorageConfig::default(),
        trigger: TriggerConfig = TriggerConfig::default(),
        detector: DetectorConfig = DetectorConfig::default(),
        retention: RetentionConfig = RetentionConfig::default(),
        scheduler: SchedulerConfig = SchedulerConfig::default(),
        logging: LoggingConfig = LoggingConfig::default(),
    }
}
