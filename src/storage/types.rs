// Core record types shared by storage, signals and triggers

use crate::errors::{DipwatchError, DipwatchResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported bar timeframes. Each timeframe is an independent series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::Minute1,
        Timeframe::Minute5,
        Timeframe::Minute15,
        Timeframe::Hour1,
        Timeframe::Hour4,
        Timeframe::Day1,
    ];

    /// Stored name and bar length in seconds
    fn info(&self) -> (&'static str, i64) {
        match self {
            Timeframe::Minute1 => ("1m", 60),
            Timeframe::Minute5 => ("5m", 5 * 60),
            Timeframe::Minute15 => ("15m", 15 * 60),
            Timeframe::Hour1 => ("1h", 60 * 60),
            Timeframe::Hour4 => ("4h", 4 * 60 * 60),
            Timeframe::Day1 => ("1d", 24 * 60 * 60),
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.info().0
    }

    /// Bar length in milliseconds
    pub fn to_millis(&self) -> i64 {
        self.info().1 * 1000
    }

    /// Case-insensitive (`5M` and `1H` are accepted on the command line)
    pub fn from_str(s: &str) -> Option<Timeframe> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Parse a value read back from storage
    pub fn from_db(s: &str) -> DipwatchResult<Timeframe> {
        Timeframe::from_str(s)
            .ok_or_else(|| DipwatchError::SchemaIntegrity(format!("unknown timeframe '{}'", s)))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evaluation lifecycle. Transitions only PENDING -> DONE | NO_DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvaluationStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "NO_DATA")]
    NoData,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "PENDING",
            EvaluationStatus::Done => "DONE",
            EvaluationStatus::NoData => "NO_DATA",
        }
    }

    /// Case-insensitive parse for CLI filters
    pub fn from_str(s: &str) -> Option<EvaluationStatus> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(EvaluationStatus::Pending),
            "DONE" => Some(EvaluationStatus::Done),
            "NO_DATA" => Some(EvaluationStatus::NoData),
            _ => None,
        }
    }

    pub fn from_db(s: &str) -> DipwatchResult<EvaluationStatus> {
        match s {
            "PENDING" => Ok(EvaluationStatus::Pending),
            "DONE" => Ok(EvaluationStatus::Done),
            "NO_DATA" => Ok(EvaluationStatus::NoData),
            other => Err(DipwatchError::SchemaIntegrity(format!(
                "unknown evaluation status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EvaluationStatus::Pending)
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which threshold the price reached first. Set only when status is DONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "TP1_FIRST")]
    Tp1First,
    #[serde(rename = "SL_FIRST")]
    SlFirst,
    #[serde(rename = "NEITHER")]
    Neither,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Tp1First => "TP1_FIRST",
            Outcome::SlFirst => "SL_FIRST",
            Outcome::Neither => "NEITHER",
        }
    }

    pub fn from_str(s: &str) -> Option<Outcome> {
        match s.to_uppercase().as_str() {
            "TP1_FIRST" => Some(Outcome::Tp1First),
            "SL_FIRST" => Some(Outcome::SlFirst),
            "NEITHER" => Some(Outcome::Neither),
            _ => None,
        }
    }

    pub fn from_db(s: &str) -> DipwatchResult<Outcome> {
        match s {
            "TP1_FIRST" => Ok(Outcome::Tp1First),
            "SL_FIRST" => Ok(Outcome::SlFirst),
            "NEITHER" => Ok(Outcome::Neither),
            other => Err(DipwatchError::SchemaIntegrity(format!(
                "unknown evaluation outcome '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolution for a single bar that touches both TP1 and SL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Assume the stop was hit first (conservative)
    SlFirst,
    Tp1First,
}

impl TieBreak {
    pub fn resolve(&self) -> Outcome {
        match self {
            TieBreak::SlFirst => Outcome::SlFirst,
            TieBreak::Tp1First => Outcome::Tp1First,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub chain_id: String,
    pub address: String,
    pub symbol: String,
    pub name: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub pair_address: String,
    pub chain_id: String,
    pub dex_id: String,
    pub base_address: String,
    pub quote_address: String,
    pub url: Option<String>,
    pub created_at_ms: i64,
}

/// One OHLCV sample. `ts` is the bar open time in Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub pair_address: String,
    pub timeframe: Timeframe,
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// Finite prices, open/close inside [low, high], non-negative volume
    pub fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if !prices.iter().chain([&self.volume]).all(|v| v.is_finite()) {
            return false;
        }
        let range = self.low..=self.high;
        range.contains(&self.open) && range.contains(&self.close) && self.volume >= 0.0
    }
}

/// Strategy parameters frozen into every signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalParams {
    /// Take-profit distance in percent (40.0 = +40%)
    pub tp1_pct: f64,
    /// Stop-loss distance in percent (50.0 = -50%)
    pub sl_pct: f64,
    pub lookahead_ms: i64,
    pub timeframe: Timeframe,
}

/// A signal about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub pair_address: String,
    pub entry_ts: i64,
    pub entry_price: f64,
    pub params: SignalParams,
    pub ath_price: Option<f64>,
    pub drop_from_ath: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: i64,
    pub pair_address: String,
    pub entry_ts: i64,
    pub entry_price: f64,
    pub params: SignalParams,
    pub ath_price: Option<f64>,
    pub drop_from_ath: Option<f64>,
    pub created_at_ms: i64,
}

impl SignalEvent {
    /// Inclusive end of the lookahead window
    pub fn window_end(&self) -> i64 {
        self.entry_ts.saturating_add(self.params.lookahead_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvaluation {
    pub id: i64,
    pub signal_id: i64,
    pub status: EvaluationStatus,
    pub outcome: Option<Outcome>,
    pub evaluated_at: Option<i64>,
    pub tp1_hit_ts: Option<i64>,
    pub sl_hit_ts: Option<i64>,
    pub tp1_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub mfe_pct: Option<f64>,
    pub mae_pct: Option<f64>,
    /// Highest high from the TP1 bar on, as of `evaluated_at`
    pub post_tp1_max_pct: Option<f64>,
    pub max_price: Option<f64>,
    pub min_price: Option<f64>,
    pub bars_scanned: i64,
    /// Price returned to entry on a bar strictly after the TP1 bar (the TP1
    /// bar itself is not counted). Only set for TP1_FIRST.
    pub breakeven_after_tp1: Option<bool>,
    pub no_data_reason: Option<String>,
}

/// Signal joined with its evaluation, flat for listing and export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub signal_id: i64,
    pub pair_address: String,
    pub base_symbol: Option<String>,
    pub entry_ts: i64,
    pub entry_price: f64,
    pub tp1_pct: f64,
    pub sl_pct: f64,
    pub lookahead_ms: i64,
    pub timeframe: Timeframe,
    pub drop_from_ath: Option<f64>,
    pub status: EvaluationStatus,
    pub outcome: Option<Outcome>,
    pub evaluated_at: Option<i64>,
    pub tp1_hit_ts: Option<i64>,
    pub sl_hit_ts: Option<i64>,
    pub tp1_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub mfe_pct: Option<f64>,
    pub mae_pct: Option<f64>,
    /// Highest high from the TP1 bar on, as of `evaluated_at`
    pub post_tp1_max_pct: Option<f64>,
    pub max_price: Option<f64>,
    pub min_price: Option<f64>,
    pub bars_scanned: i64,
    /// Price returned to entry on a bar strictly after the TP1 bar (the TP1
    /// bar itself is not counted). Only set for TP1_FIRST.
    pub breakeven_after_tp1: Option<bool>,
    pub no_data_reason: Option<String>,
}
