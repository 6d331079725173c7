/// Trigger Analyzer
///
/// Advances PENDING evaluations to DONE or NO_DATA by scanning the price bars
/// inside each signal's lookahead window `(entry_ts, entry_ts + W]`.
///
/// `scan_bars` is pure; `evaluate_signal` wraps it in one write transaction
/// guarded by `status = 'PENDING'`, which makes re-runs no-ops.
use crate::errors::{DipwatchError, DipwatchResult};
use crate::logger::{self, LogTag};
use crate::signals::recorder::{finish_signal, row_to_signal, SIGNAL_COLUMNS};
use crate::storage::market::load_bars_in_window;
use crate::storage::types::{EvaluationStatus, Outcome, PriceBar, SignalEvent, TieBreak};
use crate::storage::Database;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

pub const REASON_NO_PRICE_BARS: &str = "no_price_bars";
pub const REASON_INVALID_ENTRY_PRICE: &str = "invalid_entry_price";

/// Metrics written when an evaluation resolves to DONE
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerMetrics {
    pub outcome: Outcome,
    pub tp1_hit_ts: Option<i64>,
    pub sl_hit_ts: Option<i64>,
    pub tp1_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub mfe_pct: f64,
    pub mae_pct: f64,
    /// As of evaluation time
    pub post_tp1_max_pct: Option<f64>,
    pub max_price: f64,
    pub min_price: f64,
    pub bars_scanned: i64,
    /// Bars strictly after the TP1 bar only
    pub breakeven_after_tp1: Option<bool>,
}

/// Result of scanning one signal's window at a point in time
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Nothing touched yet and the window is still open
    StillPending { bars_scanned: i64 },
    Done(TriggerMetrics),
    NoData { reason: &'static str },
}

/// What `evaluate_signal` did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStep {
    AlreadyTerminal,
    StillPending,
    Resolved(EvaluationStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisRunStats {
    pub examined: usize,
    pub done: usize,
    pub no_data: usize,
    pub still_pending: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerSettings {
    pub tie_break: TieBreak,
    /// PENDING rows loaded per page
    pub batch_limit: usize,
    /// Stop after examining this many rows (None = the whole PENDING set)
    pub max_examined: Option<usize>,
}

impl AnalyzerSettings {
    pub fn from_config(trigger: &crate::config::TriggerConfig) -> Self {
        Self {
            tie_break: trigger.tie_break,
            batch_limit: trigger.batch_limit,
            max_examined: None,
        }
    }
}

fn pct_from_entry(price: f64, entry: f64) -> f64 {
    (price - entry) / entry * 100.0
}

/// Decide a signal's fate from the bars observed so far.
///
/// Bars outside `(entry_ts, window_end]` are ignored; the rest must be in
/// ascending time order. The window counts as elapsed once `now_ms` reaches
/// its inclusive end.
///
/// A first touch resolves the signal even while the window is open, so MFE,
/// MAE and the post-TP1 figures cover the bars stored at evaluation time,
/// not the rest of the window. Break-even after TP1 only looks at bars
/// strictly after the TP1 bar.
pub fn scan_bars(
    signal: &SignalEvent,
    bars: &[PriceBar],
    now_ms: i64,
    tie_break: TieBreak,
) -> Verdict {
    let entry = signal.entry_price;
    if !entry.is_finite() || entry <= 0.0 {
        return Verdict::NoData {
            reason: REASON_INVALID_ENTRY_PRICE,
        };
    }

    let tp1_level = entry * (1.0 + signal.params.tp1_pct / 100.0);
    let sl_level = entry * (1.0 - signal.params.sl_pct / 100.0);
    let window_end = signal.window_end();

    let mut outcome: Option<Outcome> = None;
    let mut tp1_hit_ts: Option<i64> = None;
    let mut sl_hit_ts: Option<i64> = None;
    let mut max_price = f64::MIN;
    let mut min_price = f64::MAX;
    let mut post_tp1_max: Option<f64> = None;
    let mut breakeven_after_tp1 = false;
    let mut bars_scanned: i64 = 0;

    for bar in bars
        .iter()
        .filter(|b| b.ts > signal.entry_ts && b.ts <= window_end)
    {
        bars_scanned += 1;
        max_price = max_price.max(bar.high);
        min_price = min_price.min(bar.low);

        let touches_tp1 = bar.high >= tp1_level;
        let touches_sl = bar.low <= sl_level;

        // A TP1 bar seen earlier: this bar is strictly after it
        if outcome == Some(Outcome::Tp1First) && bar.low <= entry {
            breakeven_after_tp1 = true;
        }

        if touches_tp1 && tp1_hit_ts.is_none() {
            tp1_hit_ts = Some(bar.ts);
        }
        if touches_sl && sl_hit_ts.is_none() {
            sl_hit_ts = Some(bar.ts);
        }

        if outcome.is_none() {
            outcome = match (touches_tp1, touches_sl) {
                (true, true) => Some(tie_break.resolve()),
                (true, false) => Some(Outcome::Tp1First),
                (false, true) => Some(Outcome::SlFirst),
                (false, false) => None,
            };
        }

        if outcome == Some(Outcome::Tp1First) {
            post_tp1_max = Some(post_tp1_max.map_or(bar.high, |m: f64| m.max(bar.high)));
        }
    }

    let window_elapsed = now_ms >= window_end;
    let outcome = match outcome {
        Some(outcome) => outcome,
        None if !window_elapsed => return Verdict::StillPending { bars_scanned },
        None if bars_scanned == 0 => {
            return Verdict::NoData {
                reason: REASON_NO_PRICE_BARS,
            }
        }
        None => Outcome::Neither,
    };

    let tp1_first = outcome == Outcome::Tp1First;
    Verdict::Done(TriggerMetrics {
        outcome,
        tp1_hit_ts,
        sl_hit_ts,
        tp1_price: tp1_hit_ts.map(|_| tp1_level),
        sl_price: sl_hit_ts.map(|_| sl_level),
        mfe_pct: pct_from_entry(max_price, entry),
        mae_pct: pct_from_entry(min_price, entry),
        post_tp1_max_pct: post_tp1_max.map(|p| pct_from_entry(p, entry)),
        max_price,
        min_price,
        bars_scanned,
        breakeven_after_tp1: tp1_first.then_some(breakeven_after_tp1),
    })
}

fn load_signal(conn: &Connection, signal_id: i64) -> DipwatchResult<Option<SignalEvent>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM signal_events WHERE id = ?1", SIGNAL_COLUMNS),
            params![signal_id],
            row_to_signal,
        )
        .optional()?;
    raw.map(finish_signal).transpose()
}

/// Write a terminal verdict. Returns false when the row was no longer PENDING.
fn persist_verdict(
    conn: &Connection,
    signal_id: i64,
    verdict: &Verdict,
    now_ms: i64,
) -> DipwatchResult<bool> {
    let updated = match verdict {
        Verdict::StillPending { .. } => return Ok(false),
        Verdict::NoData { reason } => conn.execute(
            "UPDATE trigger_evaluations
             SET status = 'NO_DATA', evaluated_at = ?2, no_data_reason = ?3, bars_scanned = 0
             WHERE signal_id = ?1 AND status = 'PENDING'",
            params![signal_id, now_ms, reason],
        )?,
        Verdict::Done(m) => conn.execute(
            "UPDATE trigger_evaluations
             SET status = 'DONE', outcome = ?2, evaluated_at = ?3,
                 tp1_hit_ts = ?4, sl_hit_ts = ?5, tp1_price = ?6, sl_price = ?7,
                 mfe_pct = ?8, mae_pct = ?9, post_tp1_max_pct = ?10,
                 max_price = ?11, min_price = ?12, bars_scanned = ?13,
                 breakeven_after_tp1 = ?14, no_data_reason = NULL
             WHERE signal_id = ?1 AND status = 'PENDING'",
            params![
                signal_id,
                m.outcome.as_str(),
                now_ms,
                m.tp1_hit_ts,
                m.sl_hit_ts,
                m.tp1_price,
                m.sl_price,
                m.mfe_pct,
                m.mae_pct,
                m.post_tp1_max_pct,
                m.max_price,
                m.min_price,
                m.bars_scanned,
                m.breakeven_after_tp1
            ],
        )?,
    };
    Ok(updated == 1)
}

/// Evaluate one signal in a single write transaction.
///
/// Terminal rows are left untouched. An error rolls the transaction back and
/// the row stays PENDING.
pub fn evaluate_signal(
    db: &Database,
    signal_id: i64,
    now_ms: i64,
    tie_break: TieBreak,
) -> DipwatchResult<EvaluationStep> {
    db.with_conn(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM trigger_evaluations WHERE signal_id = ?1",
                params![signal_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(DipwatchError::UnknownSignal { signal_id });
        };
        if EvaluationStatus::from_db(&status)?.is_terminal() {
            return Ok(EvaluationStep::AlreadyTerminal);
        }

        let signal =
            load_signal(&tx, signal_id)?.ok_or(DipwatchError::UnknownSignal { signal_id })?;
        let bars = load_bars_in_window(
            &tx,
            &signal.pair_address,
            signal.params.timeframe,
            signal.entry_ts,
            signal.window_end(),
        )?;

        let verdict = scan_bars(&signal, &bars, now_ms, tie_break);
        let step = match &verdict {
            Verdict::StillPending { bars_scanned } => {
                logger::verbose(
                    LogTag::Analyzer,
                    &format!(
                        "Signal #{} still pending ({} bars so far)",
                        signal_id, bars_scanned
                    ),
                );
                EvaluationStep::StillPending
            }
            Verdict::Done(m) => {
                logger::debug(
                    LogTag::Analyzer,
                    &format!(
                        "Signal #{} {} -> {} (bars {}, mfe {:.2}%, mae {:.2}%)",
                        signal_id, signal.pair_address, m.outcome, m.bars_scanned, m.mfe_pct,
                        m.mae_pct
                    ),
                );
                EvaluationStep::Resolved(EvaluationStatus::Done)
            }
            Verdict::NoData { reason } => {
                logger::debug(
                    LogTag::Analyzer,
                    &format!("Signal #{} -> NO_DATA ({})", signal_id, reason),
                );
                EvaluationStep::Resolved(EvaluationStatus::NoData)
            }
        };

        if matches!(step, EvaluationStep::Resolved(_))
            && !persist_verdict(&tx, signal_id, &verdict, now_ms)?
        {
            return Ok(EvaluationStep::AlreadyTerminal);
        }

        tx.commit()?;
        Ok(step)
    })
}

/// Keyset position in the PENDING walk: `(window_end, signal_id)`
pub type PendingCursor = (i64, i64);

/// One page of PENDING evaluations strictly after `after`, earliest window
/// end first (ties by signal id). Returns `(window_end, signal_id)` pairs.
pub fn pending_page(
    db: &Database,
    after: Option<PendingCursor>,
    limit: usize,
) -> DipwatchResult<Vec<PendingCursor>> {
    let (after_end, after_id) = after.unwrap_or((i64::MIN, i64::MIN));
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT s.entry_ts + s.lookahead_ms AS window_end, e.signal_id
             FROM trigger_evaluations e
             JOIN signal_events s ON s.id = e.signal_id
             WHERE e.status = 'PENDING'
               AND (s.entry_ts + s.lookahead_ms > ?1
                    OR (s.entry_ts + s.lookahead_ms = ?1 AND e.signal_id > ?2))
             ORDER BY window_end ASC, e.signal_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![after_end, after_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<PendingCursor>, _>>()?;
        Ok(rows)
    })
}

/// Walk the PENDING set page by page, earliest window end first.
///
/// Rows that stay PENDING (open window, or a failure) fall behind the cursor,
/// so they never keep later rows from being reached. A failure on one
/// evaluation is logged and counted; the walk continues. Only failing to load
/// a page is returned as an error.
pub fn run_analysis(
    db: &Database,
    now_ms: i64,
    settings: &AnalyzerSettings,
) -> DipwatchResult<AnalysisRunStats> {
    let page_size = settings.batch_limit.max(1);
    let mut stats = AnalysisRunStats::default();
    let mut cursor: Option<PendingCursor> = None;

    'pages: loop {
        let page = pending_page(db, cursor, page_size)?;
        let Some(&last) = page.last() else {
            break;
        };
        cursor = Some(last);
        let full_page = page.len() == page_size;

        for (_, signal_id) in page {
            if settings.max_examined.is_some_and(|max| stats.examined >= max) {
                break 'pages;
            }
            stats.examined += 1;
            match evaluate_signal(db, signal_id, now_ms, settings.tie_break) {
                Ok(EvaluationStep::Resolved(EvaluationStatus::Done)) => stats.done += 1,
                Ok(EvaluationStep::Resolved(_)) => stats.no_data += 1,
                Ok(EvaluationStep::StillPending) => stats.still_pending += 1,
                Ok(EvaluationStep::AlreadyTerminal) => {}
                Err(e) => {
                    stats.failed += 1;
                    logger::error(
                        LogTag::Analyzer,
                        &format!("Failed to evaluate signal #{}: {}", signal_id, e),
                    );
                }
            }
        }

        if !full_page {
            break;
        }
    }

    if stats.examined > 0 {
        logger::info(
            LogTag::Analyzer,
            &format!(
                "Examined {} pending: {} done, {} no data, {} still pending, {} failed",
                stats.examined, stats.done, stats.no_data, stats.still_pending, stats.failed
            ),
        );
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::recorder::record_signal;
    use crate::storage::types::{NewSignal, SignalParams, Timeframe, TriggerEvaluation};
    use crate::triggers::report::get_evaluation;

    const MIN: i64 = 60_000;

    fn params() -> SignalParams {
        SignalParams {
            tp1_pct: 10.0,
            sl_pct: 5.0,
            lookahead_ms: 60 * MIN,
            timeframe: Timeframe::Minute1,
        }
    }

    fn signal(entry_price: f64) -> SignalEvent {
        SignalEvent {
            id: 1,
            pair_address: "P1".to_string(),
            entry_ts: 0,
            entry_price,
            params: params(),
            ath_price: None,
            drop_from_ath: None,
            created_at_ms: 0,
        }
    }

    fn bar(ts: i64, high: f64, low: f64) -> PriceBar {
        PriceBar {
            pair_address: "P1".to_string(),
            timeframe: Timeframe::Minute1,
            ts,
            open: low,
            high,
            low,
            close: low,
            volume: 1.0,
        }
    }

    fn done(verdict: Verdict) -> TriggerMetrics {
        match verdict {
            Verdict::Done(m) => m,
            other => panic!("expected DONE, got {other:?}"),
        }
    }

    #[test]
    fn test_tp1_first_scenario() {
        let bars = [bar(MIN, 1.02, 0.99), bar(2 * MIN, 1.11, 1.05)];
        let m = done(scan_bars(&signal(1.0), &bars, 3 * MIN, TieBreak::SlFirst));

        assert_eq!(m.outcome, Outcome::Tp1First);
        assert_eq!(m.tp1_hit_ts, Some(2 * MIN));
        assert_eq!(m.sl_hit_ts, None);
        assert!(m.mfe_pct >= 11.0 - 1e-9);
        assert!(m.mae_pct <= -1.0 + 1e-9);
        assert_eq!(m.bars_scanned, 2);
        assert_eq!(m.breakeven_after_tp1, Some(false));
        assert!((m.tp1_price.unwrap() - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_same_bar_tie_uses_policy() {
        let bars = [bar(MIN, 1.11, 0.94)];
        let sl = done(scan_bars(&signal(1.0), &bars, 2 * MIN, TieBreak::SlFirst));
        assert_eq!(sl.outcome, Outcome::SlFirst);
        assert_eq!(sl.tp1_hit_ts, Some(MIN));
        assert_eq!(sl.sl_hit_ts, Some(MIN));
        assert_eq!(sl.post_tp1_max_pct, None);
        assert_eq!(sl.breakeven_after_tp1, None);

        let tp = done(scan_bars(&signal(1.0), &bars, 2 * MIN, TieBreak::Tp1First));
        assert_eq!(tp.outcome, Outcome::Tp1First);
    }

    #[test]
    fn test_neither_after_window() {
        let bars = [bar(MIN, 1.05, 0.97), bar(30 * MIN, 1.08, 0.96)];
        let m = done(scan_bars(&signal(1.0), &bars, 61 * MIN, TieBreak::SlFirst));
        assert_eq!(m.outcome, Outcome::Neither);
        assert_eq!(m.tp1_hit_ts, None);
        assert_eq!(m.sl_hit_ts, None);
        assert_eq!(m.bars_scanned, 2);
    }

    #[test]
    fn test_no_bars_after_window_is_no_data() {
        let verdict = scan_bars(&signal(1.0), &[], 61 * MIN, TieBreak::SlFirst);
        assert_eq!(
            verdict,
            Verdict::NoData {
                reason: REASON_NO_PRICE_BARS
            }
        );
    }

    #[test]
    fn test_open_window_stays_pending() {
        let bars = [bar(MIN, 1.05, 0.97)];
        let verdict = scan_bars(&signal(1.0), &bars, 10 * MIN, TieBreak::SlFirst);
        assert_eq!(verdict, Verdict::StillPending { bars_scanned: 1 });
        assert_eq!(
            scan_bars(&signal(1.0), &[], 10 * MIN, TieBreak::SlFirst),
            Verdict::StillPending { bars_scanned: 0 }
        );
    }

    #[test]
    fn test_invalid_entry_price() {
        let verdict = scan_bars(&signal(0.0), &[bar(MIN, 1.0, 0.5)], 0, TieBreak::SlFirst);
        assert_eq!(
            verdict,
            Verdict::NoData {
                reason: REASON_INVALID_ENTRY_PRICE
            }
        );
    }

    #[test]
    fn test_window_bounds_entry_exclusive_end_inclusive() {
        // Bar at entry time would hit TP1 but is outside the window
        let bars = [bar(0, 2.0, 1.0), bar(60 * MIN, 0.99, 0.90), bar(61 * MIN, 2.0, 1.0)];
        let m = done(scan_bars(&signal(1.0), &bars, 90 * MIN, TieBreak::SlFirst));
        assert_eq!(m.outcome, Outcome::SlFirst);
        assert_eq!(m.sl_hit_ts, Some(60 * MIN));
        assert_eq!(m.bars_scanned, 1);
    }

    #[test]
    fn test_post_tp1_tracking_and_breakeven() {
        let bars = [
            bar(MIN, 1.12, 0.99),
            bar(2 * MIN, 1.30, 1.10),
            bar(3 * MIN, 1.20, 0.98),
            bar(4 * MIN, 1.00, 0.90),
        ];
        let m = done(scan_bars(&signal(1.0), &bars, 90 * MIN, TieBreak::SlFirst));
        assert_eq!(m.outcome, Outcome::Tp1First);
        assert_eq!(m.tp1_hit_ts, Some(MIN));
        // SL touched later is still recorded for auditing
        assert_eq!(m.sl_hit_ts, Some(4 * MIN));
        assert!((m.post_tp1_max_pct.unwrap() - 30.0).abs() < 1e-9);
        assert_eq!(m.breakeven_after_tp1, Some(true));
        assert!((m.max_price - 1.30).abs() < 1e-12);
        assert!((m.min_price - 0.90).abs() < 1e-12);
    }

    #[test]
    fn test_tp1_bar_dip_is_not_breakeven() {
        // The TP1 bar itself trades below entry; later bars stay above it
        let bars = [bar(MIN, 1.12, 0.97), bar(2 * MIN, 1.20, 1.05)];
        let m = done(scan_bars(&signal(1.0), &bars, 90 * MIN, TieBreak::SlFirst));
        assert_eq!(m.outcome, Outcome::Tp1First);
        assert_eq!(m.breakeven_after_tp1, Some(false));
    }

    #[test]
    fn test_post_tp1_figures_frozen_at_evaluation() {
        let db = Database::open_in_memory().unwrap();
        let id = record(&db, "P1");
        db.insert_price_bars(&[bar(MIN, 1.15, 1.0)]).unwrap();
        assert_eq!(
            evaluate_signal(&db, id, 5 * MIN, TieBreak::SlFirst).unwrap(),
            EvaluationStep::Resolved(EvaluationStatus::Done)
        );
        let first = stored(&db, id);

        // A later, higher bar inside the window does not reopen the row
        db.insert_price_bars(&[bar(10 * MIN, 1.50, 1.10)]).unwrap();
        assert_eq!(
            evaluate_signal(&db, id, 120 * MIN, TieBreak::SlFirst).unwrap(),
            EvaluationStep::AlreadyTerminal
        );
        let after = stored(&db, id);
        assert_eq!(after, first);
        assert!((after.post_tp1_max_pct.unwrap() - 15.0).abs() < 1e-9);
    }

    fn stored(db: &Database, signal_id: i64) -> TriggerEvaluation {
        get_evaluation(db, signal_id).unwrap().unwrap()
    }

    fn record(db: &Database, pair: &str) -> i64 {
        record_signal(
            db,
            &NewSignal {
                pair_address: pair.to_string(),
                entry_ts: 0,
                entry_price: 1.0,
                params: params(),
                ath_price: None,
                drop_from_ath: None,
            },
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_run_resolves_and_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let tp_id = record(&db, "P1");
        let nodata_id = record(&db, "P2");
        let pending_id = record(&db, "P3");
        db.insert_price_bars(&[bar(MIN, 1.02, 0.99), bar(2 * MIN, 1.11, 1.05)])
            .unwrap();

        let settings = AnalyzerSettings {
            tie_break: TieBreak::SlFirst,
            batch_limit: 100,
            max_examined: None,
        };

        // Window open: P1 resolves on its touch, P2/P3 wait
        let stats = run_analysis(&db, 10 * MIN, &settings).unwrap();
        assert_eq!(
            stats,
            AnalysisRunStats {
                examined: 3,
                done: 1,
                no_data: 0,
                still_pending: 2,
                failed: 0
            }
        );
        let first = stored(&db, tp_id);
        assert_eq!(first.status, EvaluationStatus::Done);
        assert_eq!(first.outcome, Some(Outcome::Tp1First));
        assert_eq!(first.evaluated_at, Some(10 * MIN));
        assert_eq!(stored(&db, pending_id).status, EvaluationStatus::Pending);
        assert_eq!(stored(&db, pending_id).evaluated_at, None);

        // Window elapsed: the rest become NO_DATA, P1 untouched
        let stats = run_analysis(&db, 120 * MIN, &settings).unwrap();
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.no_data, 2);
        assert_eq!(stored(&db, tp_id), first);
        let nodata = stored(&db, nodata_id);
        assert_eq!(nodata.status, EvaluationStatus::NoData);
        assert_eq!(nodata.outcome, None);
        assert_eq!(nodata.no_data_reason.as_deref(), Some(REASON_NO_PRICE_BARS));
        assert_eq!(nodata.mfe_pct, None);

        // Re-running on terminal rows is a no-op
        assert_eq!(
            evaluate_signal(&db, tp_id, 500 * MIN, TieBreak::Tp1First).unwrap(),
            EvaluationStep::AlreadyTerminal
        );
        assert_eq!(stored(&db, tp_id), first);
        assert_eq!(run_analysis(&db, 500 * MIN, &settings).unwrap(), AnalysisRunStats::default());
    }

    fn record_with_lookahead(db: &Database, pair: &str, lookahead_ms: i64) -> i64 {
        record_signal(
            db,
            &NewSignal {
                pair_address: pair.to_string(),
                entry_ts: 0,
                entry_price: 1.0,
                params: SignalParams {
                    lookahead_ms,
                    ..params()
                },
                ath_price: None,
                drop_from_ath: None,
            },
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_pending_page_orders_by_window_end() {
        let db = Database::open_in_memory().unwrap();
        let long = record_with_lookahead(&db, "A", 90 * MIN);
        let short = record_with_lookahead(&db, "B", 30 * MIN);
        let tied = record_with_lookahead(&db, "C", 30 * MIN);

        let first = pending_page(&db, None, 2).unwrap();
        assert_eq!(first, vec![(30 * MIN, short), (30 * MIN, tied)]);
        let rest = pending_page(&db, first.last().copied(), 2).unwrap();
        assert_eq!(rest, vec![(90 * MIN, long)]);
        assert!(pending_page(&db, rest.last().copied(), 2).unwrap().is_empty());
    }

    #[test]
    fn test_open_window_does_not_starve_elapsed_one() {
        let db = Database::open_in_memory().unwrap();
        let long = record_with_lookahead(&db, "LONG", 1_000_000_000);
        let short = record_with_lookahead(&db, "SHORT", MIN);
        let settings = AnalyzerSettings {
            tie_break: TieBreak::SlFirst,
            batch_limit: 1,
            max_examined: None,
        };

        let stats = run_analysis(&db, 10_000_000, &settings).unwrap();
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.no_data, 1);
        assert_eq!(stats.still_pending, 1);
        assert_eq!(stored(&db, short).status, EvaluationStatus::NoData);
        assert_eq!(stored(&db, long).status, EvaluationStatus::Pending);

        // A capped run still reaches the elapsed window first
        let db = Database::open_in_memory().unwrap();
        record_with_lookahead(&db, "LONG", 1_000_000_000);
        let short = record_with_lookahead(&db, "SHORT", MIN);
        let capped = AnalyzerSettings {
            max_examined: Some(1),
            ..settings
        };
        for _ in 0..3 {
            run_analysis(&db, 10_000_000, &capped).unwrap();
        }
        assert_eq!(stored(&db, short).status, EvaluationStatus::NoData);
    }

    #[test]
    fn test_failure_is_isolated() {
        let db = Database::open_in_memory().unwrap();
        let bad = record(&db, "BAD");
        let good = record(&db, "GOOD");
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE signal_events SET timeframe = '7m' WHERE id = ?1",
                params![bad],
            )?;
            Ok(())
        })
        .unwrap();

        let settings = AnalyzerSettings {
            tie_break: TieBreak::SlFirst,
            batch_limit: 1,
            max_examined: None,
        };
        let stats = run_analysis(&db, 120 * MIN, &settings).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.no_data, 1);
        assert_eq!(stored(&db, bad).status, EvaluationStatus::Pending);
        assert_eq!(stored(&db, good).status, EvaluationStatus::NoData);
    }

    #[test]
    fn test_unknown_signal() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            evaluate_signal(&db, 42, 0, TieBreak::SlFirst),
            Err(DipwatchError::UnknownSignal { signal_id: 42 })
        ));
    }
}
