//! Retention / prune manager
//!
//! Deletes aged rows without touching data an in-flight evaluation still
//! needs. Selection and deletion share the same SQL predicates, and both run
//! inside one `BEGIN IMMEDIATE` transaction, so a dry run reports exactly what
//! a real run would delete. Every DELETE re-checks its predicate.
//!
//! Deletable rows:
//! - price bar: older than the bar horizon and outside the lookahead window
//!   of every PENDING evaluation on the same pair
//! - signal (+ evaluation): terminal and evaluated before the archive horizon
//! - pair: older than the bar horizon, no retained bar or signal
//! - token: not refreshed within the bar horizon, no retained pair

use crate::config::RetentionConfig;
use crate::errors::DipwatchResult;
use crate::logger::{self, LogTag};
use crate::storage::{schema, Database};
use rusqlite::{Connection, ToSql, TransactionBehavior};
use serde::Serialize;

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub price_bar_max_age_ms: i64,
    pub archive_horizon_ms: i64,
}

impl RetentionPolicy {
    pub fn from_config(retention: &RetentionConfig) -> Self {
        Self {
            price_bar_max_age_ms: (retention.price_bar_max_age_hours as i64).saturating_mul(HOUR_MS),
            archive_horizon_ms: (retention.archive_horizon_hours as i64).saturating_mul(HOUR_MS),
        }
    }

    fn cutoffs(&self, now_ms: i64) -> Cutoffs {
        Cutoffs {
            bar: now_ms.saturating_sub(self.price_bar_max_age_ms),
            archive: now_ms.saturating_sub(self.archive_horizon_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Cutoffs {
    bar: i64,
    archive: i64,
}

// ==================== Predicates ====================

fn bar_deletable(b: &str) -> String {
    format!(
        "({b}.ts < :bar_cutoff AND NOT EXISTS (
            SELECT 1 FROM signal_events ws
            JOIN trigger_evaluations we ON we.signal_id = ws.id
            WHERE we.status = 'PENDING'
              AND ws.pair_address = {b}.pair_address
              AND {b}.ts > ws.entry_ts
              AND {b}.ts <= ws.entry_ts + ws.lookahead_ms))"
    )
}

fn signal_deletable(s: &str) -> String {
    format!(
        "(EXISTS (
            SELECT 1 FROM trigger_evaluations ae
            WHERE ae.signal_id = {s}.id
              AND ae.status <> 'PENDING'
              AND ae.evaluated_at < :archive_cutoff))"
    )
}

fn pair_deletable(p: &str) -> String {
    format!(
        "({p}.created_at_ms < :bar_cutoff
          AND NOT EXISTS (
            SELECT 1 FROM price_bars rb
            WHERE rb.pair_address = {p}.pair_address AND NOT {bar})
          AND NOT EXISTS (
            SELECT 1 FROM signal_events rs
            WHERE rs.pair_address = {p}.pair_address AND NOT {signal}))",
        bar = bar_deletable("rb"),
        signal = signal_deletable("rs"),
    )
}

fn token_deletable(t: &str) -> String {
    format!(
        "({t}.updated_at_ms < :bar_cutoff
          AND NOT EXISTS (
            SELECT 1 FROM pairs rp
            WHERE rp.chain_id = {t}.chain_id
              AND (rp.base_address = {t}.address OR rp.quote_address = {t}.address)
              AND NOT {pair}))",
        pair = pair_deletable("rp"),
    )
}

// rusqlite rejects named parameters a statement does not use, so each query
// gets only the cutoffs it references.
fn bar_params(c: &Cutoffs) -> Vec<(&'static str, i64)> {
    vec![(":bar_cutoff", c.bar)]
}

fn archive_params(c: &Cutoffs) -> Vec<(&'static str, i64)> {
    vec![(":archive_cutoff", c.archive)]
}

fn both_params(c: &Cutoffs) -> Vec<(&'static str, i64)> {
    vec![(":bar_cutoff", c.bar), (":archive_cutoff", c.archive)]
}

fn named<'a>(
    cutoffs: &'a [(&'static str, i64)],
    extra: &'a [(&'static str, &'a dyn ToSql)],
) -> Vec<(&'a str, &'a dyn ToSql)> {
    let mut args: Vec<(&'a str, &'a dyn ToSql)> = Vec::with_capacity(cutoffs.len() + extra.len());
    for (name, value) in cutoffs {
        args.push((*name, value));
    }
    args.extend_from_slice(extra);
    args
}

// ==================== Plan ====================

/// Rows selected for deletion, by table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrunePlan {
    /// Signal ids whose evaluation goes (deleted before the signal row)
    pub evaluations: Vec<i64>,
    pub signals: Vec<i64>,
    pub price_bars: Vec<i64>,
    pub pairs: Vec<String>,
    pub tokens: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneCounts {
    pub evaluations: usize,
    pub signals: usize,
    pub price_bars: usize,
    pub pairs: usize,
    pub tokens: usize,
}

impl PruneCounts {
    pub fn total(&self) -> usize {
        self.evaluations + self.signals + self.price_bars + self.pairs + self.tokens
    }
}

impl PrunePlan {
    pub fn counts(&self) -> PruneCounts {
        PruneCounts {
            evaluations: self.evaluations.len(),
            signals: self.signals.len(),
            price_bars: self.price_bars.len(),
            pairs: self.pairs.len(),
            tokens: self.tokens.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub dry_run: bool,
    pub planned: PruneCounts,
    pub deleted: PruneCounts,
    pub vacuumed: bool,
}

fn select_ids(conn: &Connection, sql: &str, params: &[(&'static str, i64)]) -> DipwatchResult<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let args = named(params, &[]);
    let ids = stmt
        .query_map(args.as_slice(), |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn select_plan(conn: &Connection, c: &Cutoffs) -> DipwatchResult<PrunePlan> {
    let signals = select_ids(
        conn,
        &format!(
            "SELECT s.id FROM signal_events s WHERE {} ORDER BY s.id",
            signal_deletable("s")
        ),
        &archive_params(c),
    )?;

    let price_bars = select_ids(
        conn,
        &format!(
            "SELECT b.id FROM price_bars b WHERE {} ORDER BY b.id",
            bar_deletable("b")
        ),
        &bar_params(c),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT p.pair_address FROM pairs p WHERE {} ORDER BY p.pair_address",
        pair_deletable("p")
    ))?;
    let pair_args = both_params(c);
    let pairs = stmt
        .query_map(named(&pair_args, &[]).as_slice(), |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT t.chain_id, t.address FROM tokens t WHERE {} ORDER BY t.chain_id, t.address",
        token_deletable("t")
    ))?;
    let tokens = stmt
        .query_map(named(&pair_args, &[]).as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PrunePlan {
        evaluations: signals.clone(),
        signals,
        price_bars,
        pairs,
        tokens,
    })
}

fn apply_plan(conn: &Connection, plan: &PrunePlan, c: &Cutoffs) -> DipwatchResult<PruneCounts> {
    let mut deleted = PruneCounts::default();

    // Evaluations first: signal_events is referenced by trigger_evaluations
    {
        let mut stmt = conn.prepare(
            "DELETE FROM trigger_evaluations
             WHERE signal_id = :id AND status <> 'PENDING' AND evaluated_at < :archive_cutoff",
        )?;
        let cutoffs = archive_params(c);
        for id in &plan.evaluations {
            let extra: [(&str, &dyn ToSql); 1] = [(":id", id)];
            deleted.evaluations += stmt.execute(named(&cutoffs, &extra).as_slice())?;
        }
    }

    // A planned signal goes only once its evaluation is gone
    {
        let mut stmt = conn.prepare(
            "DELETE FROM signal_events
             WHERE id = :id
               AND NOT EXISTS (SELECT 1 FROM trigger_evaluations e WHERE e.signal_id = signal_events.id)",
        )?;
        for id in &plan.signals {
            let extra: [(&str, &dyn ToSql); 1] = [(":id", id)];
            deleted.signals += stmt.execute(named(&[], &extra).as_slice())?;
        }
    }

    {
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM price_bars WHERE id = :id AND {}",
            bar_deletable("price_bars")
        ))?;
        let cutoffs = bar_params(c);
        for id in &plan.price_bars {
            let extra: [(&str, &dyn ToSql); 1] = [(":id", id)];
            deleted.price_bars += stmt.execute(named(&cutoffs, &extra).as_slice())?;
        }
    }

    {
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM pairs WHERE pair_address = :pair AND {}",
            pair_deletable("pairs")
        ))?;
        let cutoffs = both_params(c);
        for pair in &plan.pairs {
            let extra: [(&str, &dyn ToSql); 1] = [(":pair", pair)];
            deleted.pairs += stmt.execute(named(&cutoffs, &extra).as_slice())?;
        }
    }

    {
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM tokens WHERE chain_id = :chain AND address = :address AND {}",
            token_deletable("tokens")
        ))?;
        let cutoffs = both_params(c);
        for (chain, address) in &plan.tokens {
            let extra: [(&str, &dyn ToSql); 2] = [(":chain", chain), (":address", address)];
            deleted.tokens += stmt.execute(named(&cutoffs, &extra).as_slice())?;
        }
    }

    Ok(deleted)
}

// ==================== Public API ====================

/// Compute what a prune at `now_ms` would delete. Writes nothing.
pub fn plan(db: &Database, policy: &RetentionPolicy, now_ms: i64) -> DipwatchResult<PrunePlan> {
    let cutoffs = policy.cutoffs(now_ms);
    db.with_conn(|conn| {
        let tx = conn.transaction()?;
        let plan = select_plan(&tx, &cutoffs)?;
        tx.rollback()?;
        Ok(plan)
    })
}

/// Delete the rows of `plan` that still satisfy their predicate at `now_ms`
pub fn apply(
    db: &Database,
    plan: &PrunePlan,
    policy: &RetentionPolicy,
    now_ms: i64,
) -> DipwatchResult<PruneCounts> {
    let cutoffs = policy.cutoffs(now_ms);
    db.with_conn(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = apply_plan(&tx, plan, &cutoffs)?;
        schema::verify_schema(&tx)?;
        tx.commit()?;
        Ok(deleted)
    })
}

/// Select and (unless `dry_run`) delete inside one write transaction
pub fn prune(
    db: &Database,
    policy: &RetentionPolicy,
    now_ms: i64,
    dry_run: bool,
    vacuum: bool,
) -> DipwatchResult<PruneReport> {
    let cutoffs = policy.cutoffs(now_ms);

    let (planned, deleted) = db.with_conn(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let plan = select_plan(&tx, &cutoffs)?;
        let planned = plan.counts();

        if dry_run {
            tx.rollback()?;
            return Ok((planned, PruneCounts::default()));
        }

        let deleted = apply_plan(&tx, &plan, &cutoffs)?;
        schema::verify_schema(&tx)?;
        tx.commit()?;
        Ok((planned, deleted))
    })?;

    let vacuumed = !dry_run && vacuum && deleted.total() > 0;
    if vacuumed {
        db.vacuum()?;
    }

    let report = PruneReport {
        dry_run,
        planned,
        deleted,
        vacuumed,
    };

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    let counts = if dry_run { planned } else { deleted };
    logger::info(
        LogTag::Prune,
        &format!(
            "{} {} evaluations, {} signals, {} bars, {} pairs, {} tokens{}",
            verb,
            counts.evaluations,
            counts.signals,
            counts.price_bars,
            counts.pairs,
            counts.tokens,
            if vacuumed { " (vacuumed)" } else { "" }
        ),
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::recorder::record_signal;
    use crate::storage::types::{NewSignal, Pair, PriceBar, SignalParams, Timeframe, Token};

    const H: i64 = HOUR_MS;
    const NOW: i64 = 1_000 * H;

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            price_bar_max_age_ms: 24 * H,
            archive_horizon_ms: 168 * H,
        }
    }

    fn add_pair(db: &Database, address: &str, created_at_ms: i64) {
        db.upsert_token(&Token {
            chain_id: "solana".to_string(),
            address: format!("{}-base", address),
            symbol: address.to_string(),
            name: None,
            updated_at_ms: created_at_ms,
        })
        .unwrap();
        db.insert_pair(&Pair {
            pair_address: address.to_string(),
            chain_id: "solana".to_string(),
            dex_id: "raydium".to_string(),
            base_address: format!("{}-base", address),
            quote_address: "So11".to_string(),
            url: None,
            created_at_ms,
        })
        .unwrap();
    }

    fn add_bar(db: &Database, pair: &str, ts: i64) {
        db.insert_price_bar(&PriceBar {
            pair_address: pair.to_string(),
            timeframe: Timeframe::Hour1,
            ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        })
        .unwrap();
    }

    fn add_signal(db: &Database, pair: &str, entry_ts: i64, lookahead_ms: i64) -> i64 {
        record_signal(
            db,
            &NewSignal {
                pair_address: pair.to_string(),
                entry_ts,
                entry_price: 1.0,
                params: SignalParams {
                    tp1_pct: 40.0,
                    sl_pct: 50.0,
                    lookahead_ms,
                    timeframe: Timeframe::Hour1,
                },
                ath_price: None,
                drop_from_ath: None,
            },
            entry_ts,
        )
        .unwrap()
    }

    fn finish(db: &Database, signal_id: i64, evaluated_at: i64) {
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE trigger_evaluations SET status = 'DONE', outcome = 'NEITHER', evaluated_at = ?2
                 WHERE signal_id = ?1",
                rusqlite::params![signal_id, evaluated_at],
            )?;
            Ok(())
        })
        .unwrap();
    }

    fn counts(db: &Database) -> Vec<i64> {
        ["tokens", "pairs", "price_bars", "signal_events", "trigger_evaluations"]
            .iter()
            .map(|t| db.count_rows(t).unwrap())
            .collect()
    }

    fn bar_exists(db: &Database, pair: &str, ts: i64) -> bool {
        db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM price_bars WHERE pair_address = ?1 AND ts = ?2)",
                rusqlite::params![pair, ts],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .unwrap()
    }

    /// OLD: archived terminal signal, old bars, old pair -> fully prunable
    /// LIVE: PENDING signal whose window covers old bars
    /// RECENT: terminal signal inside the archive horizon
    fn seed(db: &Database) -> (i64, i64, i64) {
        add_pair(db, "OLD", 100 * H);
        add_bar(db, "OLD", 101 * H);
        add_bar(db, "OLD", 102 * H);
        let old = add_signal(db, "OLD", 100 * H, 24 * H);
        finish(db, old, 200 * H);

        add_pair(db, "LIVE", 900 * H);
        let live = add_signal(db, "LIVE", 900 * H, 200 * H);
        add_bar(db, "LIVE", 900 * H); // at entry: outside the window
        add_bar(db, "LIVE", 901 * H);
        add_bar(db, "LIVE", 950 * H);
        add_bar(db, "LIVE", 999 * H); // recent

        add_pair(db, "RECENT", 500 * H);
        let recent = add_signal(db, "RECENT", 500 * H, 24 * H);
        finish(db, recent, 950 * H);

        (old, live, recent)
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let before = counts(&db);

        let report = prune(&db, &policy(), NOW, true, false).unwrap();
        assert!(report.dry_run);
        assert!(report.planned.total() > 0);
        assert_eq!(report.deleted, PruneCounts::default());
        assert_eq!(counts(&db), before);

        // The dry run reports exactly what the real run deletes
        let real = prune(&db, &policy(), NOW, false, false).unwrap();
        assert_eq!(real.planned, report.planned);
        assert_eq!(real.deleted, report.planned);
    }

    #[test]
    fn test_pending_window_bars_survive() {
        let db = Database::open_in_memory().unwrap();
        let (old, live, recent) = seed(&db);

        let report = prune(&db, &policy(), NOW, false, false).unwrap();
        assert_eq!(report.deleted.signals, 1);
        assert_eq!(report.deleted.evaluations, 1);

        // Inside LIVE's pending window, though older than the bar horizon
        assert!(bar_exists(&db, "LIVE", 901 * H));
        assert!(bar_exists(&db, "LIVE", 950 * H));
        assert!(bar_exists(&db, "LIVE", 999 * H));
        // At entry time, so outside (entry, entry + W]
        assert!(!bar_exists(&db, "LIVE", 900 * H));
        assert!(!bar_exists(&db, "OLD", 101 * H));

        use crate::signals::recorder::get_signal;
        assert!(get_signal(&db, old).unwrap().is_none());
        assert!(get_signal(&db, live).unwrap().is_some());
        assert!(get_signal(&db, recent).unwrap().is_some());

        // OLD pair and its token go; RECENT pair still has a retained signal
        assert!(db.get_pair("OLD").unwrap().is_none());
        assert!(db.get_token("solana", "OLD-base").unwrap().is_none());
        assert!(db.get_pair("RECENT").unwrap().is_some());
        assert!(db.get_token("solana", "RECENT-base").unwrap().is_some());

        // Schema untouched
        db.verify_schema().unwrap();
    }

    #[test]
    fn test_plan_then_apply_rechecks() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);
        let planned = plan(&db, &policy(), NOW).unwrap();
        assert!(planned.price_bars.len() >= 3);

        // A new PENDING signal on OLD now covers bar 101h; apply must skip it
        let protector = add_signal(&db, "OLD", 100 * H, 10 * H);
        assert!(protector > 0);
        let deleted = apply(&db, &planned, &policy(), NOW).unwrap();
        assert_eq!(deleted.price_bars, planned.price_bars.len() - 2);
        assert!(bar_exists(&db, "OLD", 101 * H));
        assert!(bar_exists(&db, "OLD", 102 * H));
        // Pair is still referenced, so it stays
        assert_eq!(deleted.pairs, 0);
    }

    #[test]
    fn test_empty_database() {
        let db = Database::open_in_memory().unwrap();
        let report = prune(&db, &policy(), NOW, false, true).unwrap();
        assert_eq!(report.deleted.total(), 0);
        assert!(!report.vacuumed);
        assert!(plan(&db, &policy(), NOW).unwrap().is_empty());
    }
}
