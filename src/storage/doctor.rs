/// Schema and invariant diagnostics for `dipwatch doctor`
use super::{schema, Database};
use crate::errors::DipwatchResult;
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DoctorReport {
    pub schema_problems: Vec<String>,
    pub row_counts: Vec<(String, i64)>,
    pub signals_without_evaluation: i64,
    pub evaluations_without_signal: i64,
    pub status_outcome_mismatches: i64,
    pub orphan_bars: i64,
    /// PENDING evaluations whose window already elapsed (informational)
    pub overdue_pending: i64,
}

impl DoctorReport {
    /// True when no invariant is violated. Overdue rows only need `evaluate`.
    pub fn is_healthy(&self) -> bool {
        self.schema_problems.is_empty()
            && self.signals_without_evaluation == 0
            && self.evaluations_without_signal == 0
            && self.status_outcome_mismatches == 0
    }
}

fn count(conn: &Connection, sql: &str, now_ms: Option<i64>) -> DipwatchResult<i64> {
    let value = match now_ms {
        Some(now) => conn.query_row(sql, [now], |row| row.get(0))?,
        None => conn.query_row(sql, [], |row| row.get(0))?,
    };
    Ok(value)
}

impl Database {
    pub fn run_doctor(&self, now_ms: i64) -> DipwatchResult<DoctorReport> {
        self.with_conn(|conn| {
            let mut report = DoctorReport {
                schema_problems: schema::schema_problems(conn)?,
                ..Default::default()
            };

            for (table, _) in schema::REQUIRED_TABLES {
                if schema::table_columns(conn, table)?.is_empty() {
                    continue;
                }
                let rows = count(conn, &format!("SELECT COUNT(*) FROM {}", table), None)?;
                report.row_counts.push((table.to_string(), rows));
            }

            if !report.schema_problems.is_empty() {
                return Ok(report);
            }

            report.signals_without_evaluation = count(
                conn,
                "SELECT COUNT(*) FROM signal_events s
                 WHERE NOT EXISTS (SELECT 1 FROM trigger_evaluations e WHERE e.signal_id = s.id)",
                None,
            )?;
            report.evaluations_without_signal = count(
                conn,
                "SELECT COUNT(*) FROM trigger_evaluations e
                 WHERE NOT EXISTS (SELECT 1 FROM signal_events s WHERE s.id = e.signal_id)",
                None,
            )?;
            report.status_outcome_mismatches = count(
                conn,
                "SELECT COUNT(*) FROM trigger_evaluations
                 WHERE (status = 'DONE' AND outcome IS NULL)
                    OR (status <> 'DONE' AND outcome IS NOT NULL)
                    OR (status = 'PENDING' AND evaluated_at IS NOT NULL)
                    OR (status <> 'PENDING' AND evaluated_at IS NULL)",
                None,
            )?;
            report.orphan_bars = count(
                conn,
                "SELECT COUNT(*) FROM price_bars b
                 WHERE NOT EXISTS (SELECT 1 FROM pairs p WHERE p.pair_address = b.pair_address)",
                None,
            )?;
            report.overdue_pending = count(
                conn,
                "SELECT COUNT(*) FROM trigger_evaluations e
                 JOIN signal_events s ON s.id = e.signal_id
                 WHERE e.status = 'PENDING' AND s.entry_ts + s.lookahead_ms <= ?1",
                Some(now_ms),
            )?;

            Ok(report)
        })
    }
}
