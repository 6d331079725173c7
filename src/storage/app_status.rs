/// Singleton heartbeat row written by the long-running loop and read by `status`
use super::Database;
use crate::errors::DipwatchResult;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Running totals kept by the scheduler since process start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleCounters {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub signals_recorded: u64,
    pub evaluations_done: u64,
    pub evaluations_no_data: u64,
    pub evaluations_failed: u64,
    pub rows_pruned: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStatus {
    pub updated_at_ms: i64,
    pub last_cycle_started_at_ms: Option<i64>,
    pub last_cycle_finished_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at_ms: Option<i64>,
    pub counters: CycleCounters,
}

impl Database {
    pub fn mark_cycle_started(&self, now_ms: i64) -> DipwatchResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO app_status (id, updated_at_ms, last_cycle_started_at_ms)
                 VALUES (1, ?1, ?1)
                 ON CONFLICT(id) DO UPDATE SET
                    updated_at_ms = excluded.updated_at_ms,
                    last_cycle_started_at_ms = excluded.last_cycle_started_at_ms",
                params![now_ms],
            )?;
            Ok(())
        })
    }

    pub fn mark_cycle_finished(&self, now_ms: i64, counters: &CycleCounters) -> DipwatchResult<()> {
        let counters_json = serde_json::to_string(counters)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO app_status (id, updated_at_ms, last_cycle_finished_at_ms, counters_json)
                 VALUES (1, ?1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    updated_at_ms = excluded.updated_at_ms,
                    last_cycle_finished_at_ms = excluded.last_cycle_finished_at_ms,
                    counters_json = excluded.counters_json",
                params![now_ms, counters_json],
            )?;
            Ok(())
        })
    }

    pub fn record_app_error(&self, now_ms: i64, message: &str) -> DipwatchResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO app_status (id, updated_at_ms, last_error, last_error_at_ms)
                 VALUES (1, ?1, ?2, ?1)
                 ON CONFLICT(id) DO UPDATE SET
                    updated_at_ms = excluded.updated_at_ms,
                    last_error = excluded.last_error,
                    last_error_at_ms = excluded.last_error_at_ms",
                params![now_ms, message],
            )?;
            Ok(())
        })
    }

    pub fn get_app_status(&self) -> DipwatchResult<Option<AppStatus>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT updated_at_ms, last_cycle_started_at_ms, last_cycle_finished_at_ms,
                            last_error, last_error_at_ms, counters_json
                     FROM app_status WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<i64>>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<i64>>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row)
        })?;

        let Some((updated, started, finished, last_error, error_at, counters_json)) = row else {
            return Ok(None);
        };

        Ok(Some(AppStatus {
            updated_at_ms: updated,
            last_cycle_started_at_ms: started,
            last_cycle_finished_at_ms: finished,
            last_error,
            last_error_at_ms: error_at,
            counters: serde_json::from_str(&counters_json)?,
        }))
    }
}
