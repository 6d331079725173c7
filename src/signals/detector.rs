/// Dip detector
///
/// Screens young pairs for a drawdown from their all-time high and records a
/// signal when the drop lands inside the configured band. Works entirely from
/// stored bars of the analysis timeframe.
use super::recorder::{last_signal_entry_ts, record_signal};
use crate::config::{DetectorConfig, TriggerConfig};
use crate::errors::{DipwatchError, DipwatchResult};
use crate::logger::{self, LogTag};
use crate::storage::types::{NewSignal, Pair, SignalParams};
use crate::storage::Database;
use serde::Serialize;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Latest bar older than this many bar lengths is considered stale
const STALE_BAR_FACTOR: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub min_drop_pct: f64,
    pub max_drop_pct: f64,
    pub max_pair_age_ms: i64,
    pub min_volume_24h: f64,
    pub cooldown_ms: i64,
    pub params: SignalParams,
}

impl DetectorSettings {
    pub fn from_config(detector: &DetectorConfig, trigger: &TriggerConfig) -> Self {
        Self {
            min_drop_pct: detector.min_drop_pct,
            max_drop_pct: detector.max_drop_pct,
            max_pair_age_ms: (detector.max_pair_age_hours as i64).saturating_mul(3_600_000),
            min_volume_24h: detector.min_volume_24h,
            cooldown_ms: (detector.cooldown_secs as i64).saturating_mul(1000),
            params: trigger.signal_params(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DipCandidate {
    pub pair_address: String,
    pub entry_ts: i64,
    pub price: f64,
    pub ath: f64,
    pub drop_pct: f64,
    pub volume_24h: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoBars,
    StaleBars,
    DropOutOfRange,
    LowVolume,
    Cooldown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Screen {
    Candidate(DipCandidate),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    pub pairs_scanned: usize,
    pub signals_recorded: usize,
    pub skipped: usize,
    pub already_active: usize,
    pub failed: usize,
}

/// `(ath - price) / ath * 100`, or None when the ATH is unusable
pub fn drop_from_ath_pct(price: f64, ath: f64) -> Option<f64> {
    if !ath.is_finite() || ath <= 0.0 || !price.is_finite() {
        return None;
    }
    Some((ath - price) / ath * 100.0)
}

/// Screen one pair without writing anything
pub fn screen_pair(
    db: &Database,
    pair: &Pair,
    now_ms: i64,
    settings: &DetectorSettings,
) -> DipwatchResult<Screen> {
    let timeframe = settings.params.timeframe;

    let Some(latest) = db.latest_bar(&pair.pair_address, timeframe)? else {
        return Ok(Screen::Skip(SkipReason::NoBars));
    };
    if now_ms - latest.ts > timeframe.to_millis() * STALE_BAR_FACTOR {
        return Ok(Screen::Skip(SkipReason::StaleBars));
    }

    // The bar containing the creation time counts toward the ATH
    let since = pair.created_at_ms - timeframe.to_millis();
    let Some(ath) = db.max_high_since(&pair.pair_address, timeframe, since)? else {
        return Ok(Screen::Skip(SkipReason::NoBars));
    };
    let Some(drop_pct) = drop_from_ath_pct(latest.close, ath) else {
        return Ok(Screen::Skip(SkipReason::NoBars));
    };
    if drop_pct < settings.min_drop_pct || drop_pct > settings.max_drop_pct {
        return Ok(Screen::Skip(SkipReason::DropOutOfRange));
    }

    let volume_24h = db.volume_since(&pair.pair_address, timeframe, now_ms - DAY_MS)?;
    if volume_24h < settings.min_volume_24h {
        return Ok(Screen::Skip(SkipReason::LowVolume));
    }

    if let Some(last) = last_signal_entry_ts(db, &pair.pair_address)? {
        if latest.ts - last < settings.cooldown_ms {
            return Ok(Screen::Skip(SkipReason::Cooldown));
        }
    }

    Ok(Screen::Candidate(DipCandidate {
        pair_address: pair.pair_address.clone(),
        entry_ts: latest.ts,
        price: latest.close,
        ath,
        drop_pct,
        volume_24h,
    }))
}

/// Screen every pair younger than the age limit and record the dips found
pub fn run_detection(
    db: &Database,
    now_ms: i64,
    settings: &DetectorSettings,
) -> DipwatchResult<DetectionStats> {
    let pairs = db.pairs_created_since(now_ms - settings.max_pair_age_ms)?;
    let mut stats = DetectionStats::default();

    for pair in &pairs {
        stats.pairs_scanned += 1;

        let candidate = match screen_pair(db, pair, now_ms, settings) {
            Ok(Screen::Candidate(c)) => c,
            Ok(Screen::Skip(reason)) => {
                logger::verbose(
                    LogTag::Detector,
                    &format!("Skip {}: {:?}", pair.pair_address, reason),
                );
                stats.skipped += 1;
                continue;
            }
            Err(e) => {
                logger::warning(
                    LogTag::Detector,
                    &format!("Failed to screen {}: {}", pair.pair_address, e),
                );
                stats.failed += 1;
                continue;
            }
        };

        let signal = NewSignal {
            pair_address: candidate.pair_address.clone(),
            entry_ts: candidate.entry_ts,
            entry_price: candidate.price,
            params: settings.params,
            ath_price: Some(candidate.ath),
            drop_from_ath: Some(candidate.drop_pct),
        };

        match record_signal(db, &signal, now_ms) {
            Ok(signal_id) => {
                stats.signals_recorded += 1;
                logger::info(
                    LogTag::Detector,
                    &format!(
                        "Dip on {}: {:.1}% below ATH {} (price {}, vol24h {:.0}) -> signal #{}",
                        candidate.pair_address,
                        candidate.drop_pct,
                        candidate.ath,
                        candidate.price,
                        candidate.volume_24h,
                        signal_id
                    ),
                );
            }
            Err(DipwatchError::DuplicateActiveSignal { signal_id, .. }) => {
                logger::debug(
                    LogTag::Detector,
                    &format!(
                        "{} already has pending signal #{}",
                        candidate.pair_address, signal_id
                    ),
                );
                stats.already_active += 1;
            }
            Err(e) if e.is_invariant_violation() || e.is_critical() => return Err(e),
            Err(e) => {
                logger::warning(
                    LogTag::Detector,
                    &format!("Failed to record signal for {}: {}", candidate.pair_address, e),
                );
                stats.failed += 1;
            }
        }
    }

    logger::debug(
        LogTag::Detector,
        &format!(
            "Screened {} pairs: {} signals, {} skipped, {} active, {} failed",
            stats.pairs_scanned,
            stats.signals_recorded,
            stats.skipped,
            stats.already_active,
            stats.failed
        ),
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{PriceBar, Timeframe};

    const MIN5: i64 = 300_000;

    fn settings() -> DetectorSettings {
        DetectorSettings {
            min_drop_pct: 50.0,
            max_drop_pct: 60.0,
            max_pair_age_ms: DAY_MS,
            min_volume_24h: 500.0,
            cooldown_ms: 3_600_000,
            params: SignalParams {
                tp1_pct: 40.0,
                sl_pct: 50.0,
                lookahead_ms: DAY_MS,
                timeframe: Timeframe::Minute5,
            },
        }
    }

    fn pair(address: &str, created_at_ms: i64) -> Pair {
        Pair {
            pair_address: address.to_string(),
            chain_id: "solana".to_string(),
            dex_id: "raydium".to_string(),
            base_address: format!("{}-base", address),
            quote_address: "So11".to_string(),
            url: None,
            created_at_ms,
        }
    }

    fn bar(pair: &str, ts: i64, high: f64, close: f64, volume: f64) -> PriceBar {
        PriceBar {
            pair_address: pair.to_string(),
            timeframe: Timeframe::Minute5,
            ts,
            open: close,
            high: high.max(close),
            low: close.min(high),
            close,
            volume,
        }
    }

    /// Pair that peaked at 2.0 and now trades at `close`
    fn seed_dip(db: &Database, address: &str, close: f64, volume: f64) {
        db.insert_pair(&pair(address, 0)).unwrap();
        db.insert_price_bars(&[
            bar(address, 0, 2.0, 1.8, volume),
            bar(address, MIN5, 1.5, 1.2, volume),
            bar(address, 2 * MIN5, close, close, volume),
        ])
        .unwrap();
    }

    #[test]
    fn test_drop_from_ath() {
        assert_eq!(drop_from_ath_pct(0.5, 2.0), Some(75.0));
        assert_eq!(drop_from_ath_pct(1.0, 0.0), None);
    }

    #[test]
    fn test_records_dip_in_band() {
        let db = Database::open_in_memory().unwrap();
        seed_dip(&db, "DIP", 0.9, 400.0);
        let now = 2 * MIN5 + 60_000;

        let stats = run_detection(&db, now, &settings()).unwrap();
        assert_eq!(stats.pairs_scanned, 1);
        assert_eq!(stats.signals_recorded, 1);

        // Second pass: pending evaluation blocks a duplicate
        let stats = run_detection(&db, now, &settings()).unwrap();
        assert_eq!(stats.signals_recorded, 0);
        assert_eq!(stats.skipped + stats.already_active, 1);
    }

    #[test]
    fn test_out_of_band_and_low_volume_skipped() {
        let db = Database::open_in_memory().unwrap();
        seed_dip(&db, "SHALLOW", 1.5, 400.0);
        seed_dip(&db, "THIN", 0.9, 10.0);
        let now = 2 * MIN5 + 60_000;

        let s = settings();
        assert_eq!(
            screen_pair(&db, &db.get_pair("SHALLOW").unwrap().unwrap(), now, &s).unwrap(),
            Screen::Skip(SkipReason::DropOutOfRange)
        );
        assert_eq!(
            screen_pair(&db, &db.get_pair("THIN").unwrap().unwrap(), now, &s).unwrap(),
            Screen::Skip(SkipReason::LowVolume)
        );
        assert_eq!(run_detection(&db, now, &s).unwrap().signals_recorded, 0);
    }

    #[test]
    fn test_old_pairs_and_stale_bars_ignored() {
        let db = Database::open_in_memory().unwrap();
        seed_dip(&db, "DIP", 0.9, 400.0);

        // Pair older than the age limit is not screened at all
        let stats = run_detection(&db, 2 * DAY_MS, &settings()).unwrap();
        assert_eq!(stats.pairs_scanned, 0);

        let mut s = settings();
        s.max_pair_age_ms = 10 * DAY_MS;
        assert_eq!(
            screen_pair(&db, &db.get_pair("DIP").unwrap().unwrap(), 2 * DAY_MS, &s).unwrap(),
            Screen::Skip(SkipReason::StaleBars)
        );
    }
}
