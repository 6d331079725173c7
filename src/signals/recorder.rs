/// Signal Event Recorder and Trigger Evaluation Queue
///
/// A signal and its PENDING evaluation are always written together in one
/// `BEGIN IMMEDIATE` transaction, so readers never see one without the other.
use crate::errors::{DipwatchError, DipwatchResult};
use crate::logger::{self, LogTag};
use crate::storage::types::{NewSignal, SignalEvent, SignalParams, Timeframe};
use crate::storage::Database;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

fn validate(signal: &NewSignal) -> DipwatchResult<()> {
    if signal.pair_address.trim().is_empty() {
        return Err(DipwatchError::InvalidSignal(
            "pair address is empty".to_string(),
        ));
    }
    if !signal.entry_price.is_finite() || signal.entry_price <= 0.0 {
        return Err(DipwatchError::InvalidSignal(format!(
            "entry price must be finite and > 0, got {}",
            signal.entry_price
        )));
    }
    let params = &signal.params;
    if !params.tp1_pct.is_finite() || params.tp1_pct <= 0.0 {
        return Err(DipwatchError::InvalidSignal(format!(
            "tp1_pct must be finite and > 0, got {}",
            params.tp1_pct
        )));
    }
    // sl_pct >= 100 would put the stop at or below zero
    if !params.sl_pct.is_finite() || params.sl_pct <= 0.0 || params.sl_pct >= 100.0 {
        return Err(DipwatchError::InvalidSignal(format!(
            "sl_pct must be in (0, 100), got {}",
            params.sl_pct
        )));
    }
    if params.lookahead_ms <= 0 {
        return Err(DipwatchError::InvalidSignal(format!(
            "lookahead must be > 0, got {} ms",
            params.lookahead_ms
        )));
    }
    Ok(())
}

/// Signal id of the pair's unresolved evaluation, if any
fn active_signal_for_pair(conn: &Connection, pair_address: &str) -> DipwatchResult<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT s.id FROM signal_events s
             JOIN trigger_evaluations e ON e.signal_id = s.id
             WHERE s.pair_address = ?1 AND e.status = 'PENDING'
             ORDER BY s.id ASC LIMIT 1",
            params![pair_address],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Persist a signal and queue its evaluation. Returns the new signal id.
pub fn record_signal(db: &Database, signal: &NewSignal, now_ms: i64) -> DipwatchResult<i64> {
    validate(signal)?;

    let signal_id = db.with_conn(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = active_signal_for_pair(&tx, &signal.pair_address)? {
            return Err(DipwatchError::DuplicateActiveSignal {
                pair_address: signal.pair_address.clone(),
                signal_id: existing,
            });
        }

        tx.execute(
            "INSERT INTO signal_events
                (pair_address, entry_ts, entry_price, tp1_pct, sl_pct, lookahead_ms,
                 timeframe, ath_price, drop_from_ath, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                signal.pair_address,
                signal.entry_ts,
                signal.entry_price,
                signal.params.tp1_pct,
                signal.params.sl_pct,
                signal.params.lookahead_ms,
                signal.params.timeframe.as_str(),
                signal.ath_price,
                signal.drop_from_ath,
                now_ms
            ],
        )?;
        let signal_id = tx.last_insert_rowid();

        enqueue_pending_evaluation(&tx, signal_id)?;
        tx.commit()?;
        Ok(signal_id)
    })?;

    logger::info(
        LogTag::Recorder,
        &format!(
            "Recorded signal #{} for {} at {} (tp1 {}%, sl {}%, {})",
            signal_id,
            signal.pair_address,
            signal.entry_price,
            signal.params.tp1_pct,
            signal.params.sl_pct,
            signal.params.timeframe
        ),
    );

    Ok(signal_id)
}

/// Create the PENDING evaluation for `signal_id`.
///
/// Must run inside the transaction that created the signal. Violations are
/// programming errors and are returned, never swallowed.
pub fn enqueue_pending_evaluation(conn: &Connection, signal_id: i64) -> DipwatchResult<()> {
    let signal_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM signal_events WHERE id = ?1)",
        params![signal_id],
        |row| row.get(0),
    )?;
    if !signal_exists {
        return Err(DipwatchError::UnknownSignal { signal_id });
    }

    let evaluation_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM trigger_evaluations WHERE signal_id = ?1)",
        params![signal_id],
        |row| row.get(0),
    )?;
    if evaluation_exists {
        return Err(DipwatchError::DuplicateEvaluation { signal_id });
    }

    conn.execute(
        "INSERT INTO trigger_evaluations (signal_id, status) VALUES (?1, 'PENDING')",
        params![signal_id],
    )?;
    logger::debug(
        LogTag::Recorder,
        &format!("Queued PENDING evaluation for signal #{}", signal_id),
    );
    Ok(())
}

pub(crate) const SIGNAL_COLUMNS: &str = "id, pair_address, entry_ts, entry_price, tp1_pct, sl_pct, \
     lookahead_ms, timeframe, ath_price, drop_from_ath, created_at_ms";

pub(crate) fn row_to_signal(row: &Row<'_>) -> rusqlite::Result<(SignalEvent, String)> {
    let timeframe: String = row.get(7)?;
    Ok((
        SignalEvent {
            id: row.get(0)?,
            pair_address: row.get(1)?,
            entry_ts: row.get(2)?,
            entry_price: row.get(3)?,
            params: SignalParams {
                tp1_pct: row.get(4)?,
                sl_pct: row.get(5)?,
                lookahead_ms: row.get(6)?,
                // replaced by the caller after validating the stored name
                timeframe: Timeframe::Minute1,
            },
            ath_price: row.get(8)?,
            drop_from_ath: row.get(9)?,
            created_at_ms: row.get(10)?,
        },
        timeframe,
    ))
}

pub(crate) fn finish_signal(raw: (SignalEvent, String)) -> DipwatchResult<SignalEvent> {
    let (mut signal, timeframe) = raw;
    signal.params.timeframe = Timeframe::from_db(&timeframe)?;
    Ok(signal)
}

pub fn get_signal(db: &Database, signal_id: i64) -> DipwatchResult<Option<SignalEvent>> {
    db.with_conn(|conn| {
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM signal_events WHERE id = ?1", SIGNAL_COLUMNS),
                params![signal_id],
                row_to_signal,
            )
            .optional()?;
        raw.map(finish_signal).transpose()
    })
}

/// Entry time of the most recent signal on a pair (detector cooldown)
pub fn last_signal_entry_ts(db: &Database, pair_address: &str) -> DipwatchResult<Option<i64>> {
    db.with_conn(|conn| {
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(entry_ts) FROM signal_events WHERE pair_address = ?1",
            params![pair_address],
            |row| row.get(0),
        )?;
        Ok(ts)
    })
}
