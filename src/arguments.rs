/// Command-line interface for dipwatch
///
/// Global flags (storage target, config file, logging) apply to every
/// subcommand. Every subcommand except `init` refuses to create a missing
/// database.
use crate::config::Config;
use crate::export::ExportFormat;
use crate::logger::{LogLevel, LoggerConfig};
use crate::storage::types::{EvaluationStatus, Outcome, TieBreak, Timeframe};
use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dipwatch")]
#[command(version, about = "Dip signal recorder and trigger evaluation engine for DEX pairs", long_about = None)]
pub struct Cli {
    /// SQLite database (default: <data dir>/dipwatch.db, or storage.db_path)
    #[arg(long, global = true, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Config file (default: <data dir>/config.toml; missing file = defaults)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug output for a log tag (repeatable), e.g. --debug analyzer
    #[arg(long, global = true, value_name = "TAG")]
    pub debug: Vec<String>,

    /// Enable all debug and verbose output
    #[arg(long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print warnings and errors
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Disable the daily log file
    #[arg(long, global = true)]
    pub no_file_log: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database and schema
    Init,

    /// Evaluate pending signals once (no lock)
    Evaluate {
        /// Max pending evaluations to examine (default: all of them)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run detect -> evaluate -> prune cycles until interrupted
    Run {
        /// Seconds between cycles (default: scheduler.interval_secs)
        #[arg(long)]
        interval: Option<u64>,

        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Screen young pairs for dips once and record signals
    Detect,

    /// Record a signal for a pair by hand
    Signal(SignalArgs),

    /// Delete aged rows under the retention policy
    Prune {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// VACUUM the database after deleting
        #[arg(long)]
        vacuum: bool,
    },

    /// Summary report: counts, rates, post-TP1 stats and app status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List evaluations, newest signal first
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<EvaluationStatus>,

        #[arg(long, value_parser = parse_outcome)]
        outcome: Option<Outcome>,

        #[arg(long, default_value = "50")]
        limit: usize,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show pairs and evaluations for one base token
    Show {
        #[arg(long, value_name = "ADDRESS")]
        token: String,
    },

    /// Export evaluation records
    Export {
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,

        /// Output file (default: <exports dir>/evaluations_<timestamp>.<ext>)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,

        #[arg(long, value_parser = parse_status)]
        status: Option<EvaluationStatus>,
    },

    /// Check schema and invariants
    Doctor {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct SignalArgs {
    /// Pair address
    #[arg(long)]
    pub pair: String,

    /// Entry price
    #[arg(long)]
    pub price: f64,

    /// Entry time, Unix milliseconds (default: now)
    #[arg(long)]
    pub ts: Option<i64>,

    /// Override trigger.tp1_pct
    #[arg(long)]
    pub tp1: Option<f64>,

    /// Override trigger.sl_pct
    #[arg(long)]
    pub sl: Option<f64>,

    /// Override trigger.lookahead_secs
    #[arg(long)]
    pub lookahead_secs: Option<u64>,

    /// Override trigger.timeframe (1m, 5m, 15m, 1h, 4h, 1d)
    #[arg(long, value_parser = parse_timeframe)]
    pub timeframe: Option<Timeframe>,
}

fn parse_status(s: &str) -> Result<EvaluationStatus, String> {
    EvaluationStatus::from_str(s)
        .ok_or_else(|| format!("unknown status '{}' (PENDING, DONE, NO_DATA)", s))
}

fn parse_outcome(s: &str) -> Result<Outcome, String> {
    Outcome::from_str(s)
        .ok_or_else(|| format!("unknown outcome '{}' (TP1_FIRST, SL_FIRST, NEITHER)", s))
}

fn parse_timeframe(s: &str) -> Result<Timeframe, String> {
    Timeframe::from_str(s).ok_or_else(|| format!("unknown timeframe '{}'", s))
}

impl Cli {
    /// Config file path: `--config`, else the default location
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::paths::get_config_path)
    }

    /// Storage target: `--db`, else `storage.db_path`, else the default
    pub fn db_path(&self, config: &Config) -> PathBuf {
        if let Some(db) = &self.db {
            return db.clone();
        }
        if !config.storage.db_path.trim().is_empty() {
            return PathBuf::from(&config.storage.db_path);
        }
        crate::paths::get_default_db_path()
    }

    pub fn logger_config(&self, config: &Config) -> LoggerConfig {
        let min_level = if self.verbose {
            LogLevel::Verbose
        } else if self.quiet {
            LogLevel::Warning
        } else {
            config.logging.level.parse().unwrap_or(LogLevel::Info)
        };

        let debug_tags: HashSet<String> = self.debug.iter().map(|t| t.to_lowercase()).collect();

        let file_dir = if self.no_file_log || !config.logging.file_enabled {
            None
        } else if config.logging.logs_dir.trim().is_empty() {
            Some(crate::paths::get_logs_directory())
        } else {
            Some(PathBuf::from(&config.logging.logs_dir))
        };

        LoggerConfig {
            min_level,
            debug_tags,
            file_dir,
        }
    }
}

/// Tie-break names accepted in config and printed in reports
pub fn tie_break_name(tie_break: TieBreak) -> &'static str {
    match tie_break {
        TieBreak::SlFirst => "sl_first",
        TieBreak::Tp1First => "tp1_first",
    }
}
