/// Read side: evaluation lookups, filtered listings, per-token detail and the
/// trigger summary shown by `status`.
use crate::errors::DipwatchResult;
use crate::storage::types::{
    EvaluationRecord, EvaluationStatus, Outcome, Pair, Timeframe, Token, TriggerEvaluation,
};
use crate::storage::Database;
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

const TOP_N: usize = 10;

pub fn get_evaluation(db: &Database, signal_id: i64) -> DipwatchResult<Option<TriggerEvaluation>> {
    db.with_conn(|conn| {
        let raw = conn
            .query_row(
                "SELECT id, signal_id, status, outcome, evaluated_at, tp1_hit_ts, sl_hit_ts,
                        tp1_price, sl_price, mfe_pct, mae_pct, post_tp1_max_pct,
                        max_price, min_price, bars_scanned, breakeven_after_tp1, no_data_reason
                 FROM trigger_evaluations WHERE signal_id = ?1",
                params![signal_id],
                |row| {
                    Ok((
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        TriggerEvaluation {
                            id: row.get(0)?,
                            signal_id: row.get(1)?,
                            status: EvaluationStatus::Pending,
                            outcome: None,
                            evaluated_at: row.get(4)?,
                            tp1_hit_ts: row.get(5)?,
                            sl_hit_ts: row.get(6)?,
                            tp1_price: row.get(7)?,
                            sl_price: row.get(8)?,
                            mfe_pct: row.get(9)?,
                            mae_pct: row.get(10)?,
                            post_tp1_max_pct: row.get(11)?,
                            max_price: row.get(12)?,
                            min_price: row.get(13)?,
                            bars_scanned: row.get(14)?,
                            breakeven_after_tp1: row.get(15)?,
                            no_data_reason: row.get(16)?,
                        },
                    ))
                },
            )
            .optional()?;

        let Some((status, outcome, mut evaluation)) = raw else {
            return Ok(None);
        };
        evaluation.status = EvaluationStatus::from_db(&status)?;
        evaluation.outcome = outcome.as_deref().map(Outcome::from_db).transpose()?;
        Ok(Some(evaluation))
    })
}

/// Filters for `list` and `export`. Empty filter means everything.
#[derive(Debug, Clone, Default)]
pub struct EvaluationFilter {
    pub status: Option<EvaluationStatus>,
    pub outcome: Option<Outcome>,
    pub pair_address: Option<String>,
    /// Only pairs whose base token has this address
    pub base_token: Option<String>,
    pub limit: Option<usize>,
}

struct RawRecord {
    record: EvaluationRecord,
    timeframe: String,
    status: String,
    outcome: Option<String>,
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        timeframe: row.get(8)?,
        status: row.get(10)?,
        outcome: row.get(11)?,
        record: EvaluationRecord {
            signal_id: row.get(0)?,
            pair_address: row.get(1)?,
            base_symbol: row.get(2)?,
            entry_ts: row.get(3)?,
            entry_price: row.get(4)?,
            tp1_pct: row.get(5)?,
            sl_pct: row.get(6)?,
            lookahead_ms: row.get(7)?,
            timeframe: Timeframe::Minute1,
            drop_from_ath: row.get(9)?,
            status: EvaluationStatus::Pending,
            outcome: None,
            evaluated_at: row.get(12)?,
            tp1_hit_ts: row.get(13)?,
            sl_hit_ts: row.get(14)?,
            tp1_price: row.get(15)?,
            sl_price: row.get(16)?,
            mfe_pct: row.get(17)?,
            mae_pct: row.get(18)?,
            post_tp1_max_pct: row.get(19)?,
            max_price: row.get(20)?,
            min_price: row.get(21)?,
            bars_scanned: row.get(22)?,
            breakeven_after_tp1: row.get(23)?,
            no_data_reason: row.get(24)?,
        },
    })
}

impl RawRecord {
    fn finish(self) -> DipwatchResult<EvaluationRecord> {
        let mut record = self.record;
        record.timeframe = Timeframe::from_db(&self.timeframe)?;
        record.status = EvaluationStatus::from_db(&self.status)?;
        record.outcome = self.outcome.as_deref().map(Outcome::from_db).transpose()?;
        Ok(record)
    }
}

/// Signals joined with their evaluations, newest signal first
pub fn list_evaluations(
    db: &Database,
    filter: &EvaluationFilter,
) -> DipwatchResult<Vec<EvaluationRecord>> {
    let mut sql = String::from(
        "SELECT s.id, s.pair_address, t.symbol, s.entry_ts, s.entry_price, s.tp1_pct, s.sl_pct,
                s.lookahead_ms, s.timeframe, s.drop_from_ath,
                e.status, e.outcome, e.evaluated_at, e.tp1_hit_ts, e.sl_hit_ts,
                e.tp1_price, e.sl_price, e.mfe_pct, e.mae_pct, e.post_tp1_max_pct,
                e.max_price, e.min_price, e.bars_scanned,
                e.breakeven_after_tp1, e.no_data_reason
         FROM signal_events s
         JOIN trigger_evaluations e ON e.signal_id = s.id
         LEFT JOIN pairs p ON p.pair_address = s.pair_address
         LEFT JOIN tokens t ON t.chain_id = p.chain_id AND t.address = p.base_address
         WHERE 1 = 1",
    );
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        sql.push_str(" AND e.status = ?");
        args.push(Box::new(status.as_str()));
    }
    if let Some(outcome) = filter.outcome {
        sql.push_str(" AND e.outcome = ?");
        args.push(Box::new(outcome.as_str()));
    }
    if let Some(pair) = &filter.pair_address {
        sql.push_str(" AND s.pair_address = ?");
        args.push(Box::new(pair.clone()));
    }
    if let Some(base) = &filter.base_token {
        sql.push_str(" AND p.base_address = ?");
        args.push(Box::new(base.clone()));
    }
    sql.push_str(" ORDER BY s.id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        args.push(Box::new(limit as i64));
    }

    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let raw = stmt
            .query_map(arg_refs.as_slice(), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRecord::finish).collect()
    })
}

/// Everything known about one token's pairs and their signals
#[derive(Debug, Clone, Serialize)]
pub struct TokenTriggerDetail {
    pub address: String,
    pub tokens: Vec<Token>,
    pub pairs: Vec<Pair>,
    pub evaluations: Vec<EvaluationRecord>,
}

pub fn token_detail(db: &Database, address: &str) -> DipwatchResult<TokenTriggerDetail> {
    let pairs = db.pairs_for_base_token(address)?;

    let mut tokens = Vec::new();
    let mut chains: Vec<&str> = pairs.iter().map(|p| p.chain_id.as_str()).collect();
    chains.sort_unstable();
    chains.dedup();
    for chain in chains {
        if let Some(token) = db.get_token(chain, address)? {
            tokens.push(token);
        }
    }

    let evaluations = list_evaluations(
        db,
        &EvaluationFilter {
            base_token: Some(address.to_string()),
            ..Default::default()
        },
    )?;

    Ok(TokenTriggerDetail {
        address: address.to_string(),
        tokens,
        pairs,
        evaluations,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopPostTp1 {
    pub signal_id: i64,
    pub pair_address: String,
    pub entry_price: f64,
    pub post_tp1_max_pct: f64,
    pub url: Option<String>,
}

/// Aggregate outcome statistics over all evaluations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerSummary {
    pub total_signals: i64,
    pub pending: i64,
    pub done: i64,
    pub no_data: i64,
    pub tp1_first: i64,
    pub sl_first: i64,
    pub neither: i64,
    /// TP1_FIRST / DONE
    pub tp1_hit_rate: f64,
    /// SL_FIRST / DONE
    pub sl_first_rate: f64,
    /// Price back at entry after TP1, over TP1_FIRST rows
    pub breakeven_after_tp1_rate: f64,
    pub post_tp1_max_pct_avg: Option<f64>,
    pub post_tp1_max_pct_median: Option<f64>,
    pub top_post_tp1: Vec<TopPostTp1>,
}

fn ratio(part: i64, whole: i64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

fn median(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn build_summary(db: &Database) -> DipwatchResult<TriggerSummary> {
    db.with_conn(|conn| {
        let mut summary = TriggerSummary {
            total_signals: conn.query_row("SELECT COUNT(*) FROM signal_events", [], |r| r.get(0))?,
            ..Default::default()
        };

        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM trigger_evaluations GROUP BY status")?;
        let by_status = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in by_status {
            match EvaluationStatus::from_db(&status)? {
                EvaluationStatus::Pending => summary.pending = count,
                EvaluationStatus::Done => summary.done = count,
                EvaluationStatus::NoData => summary.no_data = count,
            }
        }

        let mut stmt = conn.prepare(
            "SELECT outcome, COUNT(*) FROM trigger_evaluations
             WHERE status = 'DONE' GROUP BY outcome",
        )?;
        let by_outcome = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (outcome, count) in by_outcome {
            match Outcome::from_db(&outcome)? {
                Outcome::Tp1First => summary.tp1_first = count,
                Outcome::SlFirst => summary.sl_first = count,
                Outcome::Neither => summary.neither = count,
            }
        }

        summary.tp1_hit_rate = ratio(summary.tp1_first, summary.done);
        summary.sl_first_rate = ratio(summary.sl_first, summary.done);

        let breakeven_hits: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trigger_evaluations
             WHERE status = 'DONE' AND outcome = 'TP1_FIRST' AND breakeven_after_tp1 = 1",
            [],
            |r| r.get(0),
        )?;
        summary.breakeven_after_tp1_rate = ratio(breakeven_hits, summary.tp1_first);

        let mut stmt = conn.prepare(
            "SELECT post_tp1_max_pct FROM trigger_evaluations
             WHERE status = 'DONE' AND outcome = 'TP1_FIRST' AND post_tp1_max_pct IS NOT NULL
             ORDER BY post_tp1_max_pct ASC",
        )?;
        let post_tp1: Vec<f64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if !post_tp1.is_empty() {
            summary.post_tp1_max_pct_avg =
                Some(post_tp1.iter().sum::<f64>() / post_tp1.len() as f64);
            summary.post_tp1_max_pct_median = median(&post_tp1);
        }

        let mut stmt = conn.prepare(
            "SELECT s.id, s.pair_address, s.entry_price, e.post_tp1_max_pct, p.url
             FROM trigger_evaluations e
             JOIN signal_events s ON s.id = e.signal_id
             LEFT JOIN pairs p ON p.pair_address = s.pair_address
             WHERE e.status = 'DONE' AND e.outcome = 'TP1_FIRST' AND e.post_tp1_max_pct IS NOT NULL
             ORDER BY e.post_tp1_max_pct DESC, s.id ASC
             LIMIT ?1",
        )?;
        summary.top_post_tp1 = stmt
            .query_map(params![TOP_N as i64], |row| {
                Ok(TopPostTp1 {
                    signal_id: row.get(0)?,
                    pair_address: row.get(1)?,
                    entry_price: row.get(2)?,
                    post_tp1_max_pct: row.get(3)?,
                    url: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summary)
    })
}
