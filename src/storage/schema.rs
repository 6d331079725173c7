/// Database schema for dipwatch
///
/// Five data tables plus the `app_status` singleton. The schema is only ever
/// created by `init`; every other entry point verifies it and fails with
/// `SchemaIntegrity` instead of repairing it.
use crate::errors::{DipwatchError, DipwatchResult};
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_SQL: &str = r#"
-- Token identity and cached metadata
CREATE TABLE IF NOT EXISTS tokens (
    chain_id TEXT NOT NULL,
    address TEXT NOT NULL,
    symbol TEXT NOT NULL DEFAULT '',
    name TEXT,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY (chain_id, address)
);

-- Tradable pairs (immutable once recorded)
CREATE TABLE IF NOT EXISTS pairs (
    pair_address TEXT PRIMARY KEY,
    chain_id TEXT NOT NULL,
    dex_id TEXT NOT NULL,
    base_address TEXT NOT NULL,
    quote_address TEXT NOT NULL,
    url TEXT,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pairs_base ON pairs(chain_id, base_address);
CREATE INDEX IF NOT EXISTS idx_pairs_quote ON pairs(chain_id, quote_address);
CREATE INDEX IF NOT EXISTS idx_pairs_created ON pairs(created_at_ms);

-- Append-only OHLCV history, one series per (pair, timeframe)
CREATE TABLE IF NOT EXISTS price_bars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_address TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL DEFAULT 0,
    UNIQUE(pair_address, timeframe, ts)
);
CREATE INDEX IF NOT EXISTS idx_bars_ts ON price_bars(ts);

-- Detected entry conditions
CREATE TABLE IF NOT EXISTS signal_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_address TEXT NOT NULL,
    entry_ts INTEGER NOT NULL,
    entry_price REAL NOT NULL,
    tp1_pct REAL NOT NULL,
    sl_pct REAL NOT NULL,
    lookahead_ms INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    ath_price REAL,
    drop_from_ath REAL,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_pair ON signal_events(pair_address, entry_ts);

-- Exactly one evaluation per signal
CREATE TABLE IF NOT EXISTS trigger_evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_id INTEGER NOT NULL UNIQUE REFERENCES signal_events(id),
    status TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (status IN ('PENDING', 'DONE', 'NO_DATA')),
    outcome TEXT CHECK (outcome IS NULL OR outcome IN ('TP1_FIRST', 'SL_FIRST', 'NEITHER')),
    evaluated_at INTEGER,
    tp1_hit_ts INTEGER,
    sl_hit_ts INTEGER,
    tp1_price REAL,
    sl_price REAL,
    mfe_pct REAL,
    mae_pct REAL,
    post_tp1_max_pct REAL,
    max_price REAL,
    min_price REAL,
    bars_scanned INTEGER NOT NULL DEFAULT 0,
    breakeven_after_tp1 INTEGER,
    no_data_reason TEXT,
    CHECK ((status = 'DONE') = (outcome IS NOT NULL))
);
CREATE INDEX IF NOT EXISTS idx_evals_status ON trigger_evaluations(status, signal_id);

-- Long-running loop heartbeat (single row, id = 1)
CREATE TABLE IF NOT EXISTS app_status (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    updated_at_ms INTEGER NOT NULL,
    last_cycle_started_at_ms INTEGER,
    last_cycle_finished_at_ms INTEGER,
    last_error TEXT,
    last_error_at_ms INTEGER,
    counters_json TEXT NOT NULL DEFAULT '{}'
);
"#;

/// Tables and the columns the code depends on
pub const REQUIRED_TABLES: &[(&str, &[&str])] = &[
    (
        "tokens",
        &["chain_id", "address", "symbol", "name", "updated_at_ms"],
    ),
    (
        "pairs",
        &[
            "pair_address",
            "chain_id",
            "dex_id",
            "base_address",
            "quote_address",
            "url",
            "created_at_ms",
        ],
    ),
    (
        "price_bars",
        &[
            "id",
            "pair_address",
            "timeframe",
            "ts",
            "open",
            "high",
            "low",
            "close",
            "volume",
        ],
    ),
    (
        "signal_events",
        &[
            "id",
            "pair_address",
            "entry_ts",
            "entry_price",
            "tp1_pct",
            "sl_pct",
            "lookahead_ms",
            "timeframe",
            "ath_price",
            "drop_from_ath",
            "created_at_ms",
        ],
    ),
    (
        "trigger_evaluations",
        &[
            "id",
            "signal_id",
            "status",
            "outcome",
            "evaluated_at",
            "tp1_hit_ts",
            "sl_hit_ts",
            "tp1_price",
            "sl_price",
            "mfe_pct",
            "mae_pct",
            "post_tp1_max_pct",
            "max_price",
            "min_price",
            "bars_scanned",
            "breakeven_after_tp1",
            "no_data_reason",
        ],
    ),
    (
        "app_status",
        &[
            "id",
            "updated_at_ms",
            "last_cycle_started_at_ms",
            "last_cycle_finished_at_ms",
            "last_error",
            "last_error_at_ms",
            "counters_json",
        ],
    ),
];

pub fn create_schema(conn: &Connection) -> DipwatchResult<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Column names of `table`, empty when the table does not exist
pub fn table_columns(conn: &Connection, table: &str) -> DipwatchResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// List schema problems without failing (used by `doctor`)
pub fn schema_problems(conn: &Connection) -> DipwatchResult<Vec<String>> {
    let mut problems = Vec::new();
    for (table, required) in REQUIRED_TABLES {
        let columns = table_columns(conn, table)?;
        if columns.is_empty() {
            problems.push(format!("missing table '{}'", table));
            continue;
        }
        for column in required.iter() {
            if !columns.iter().any(|c| c == column) {
                problems.push(format!("table '{}' is missing column '{}'", table, column));
            }
        }
    }
    Ok(problems)
}

/// Fail with `SchemaIntegrity` when any required table or column is absent
pub fn verify_schema(conn: &Connection) -> DipwatchResult<()> {
    let problems = schema_problems(conn)?;
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DipwatchError::SchemaIntegrity(format!(
            "{} (run `dipwatch init` on a new database)",
            problems.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_verify() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(verify_schema(&conn).is_err());
        create_schema(&conn).unwrap();
        verify_schema(&conn).unwrap();
        // idempotent
        create_schema(&conn).unwrap();
    }

    #[test]
    fn test_missing_table_reported() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn.execute_batch("DROP TABLE app_status").unwrap();
        let problems = schema_problems(&conn).unwrap();
        assert_eq!(problems, vec!["missing table 'app_status'".to_string()]);
        assert!(matches!(
            verify_schema(&conn),
            Err(DipwatchError::SchemaIntegrity(_))
        ));
    }

    #[test]
    fn test_outcome_status_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO signal_events (pair_address, entry_ts, entry_price, tp1_pct, sl_pct,
             lookahead_ms, timeframe, created_at_ms) VALUES ('p', 0, 1.0, 10, 5, 1000, '5m', 0)",
            [],
        )
        .unwrap();
        let pending_with_outcome = conn.execute(
            "INSERT INTO trigger_evaluations (signal_id, status, outcome) VALUES (1, 'PENDING', 'NEITHER')",
            [],
        );
        assert!(pending_with_outcome.is_err());
        let done_without_outcome = conn.execute(
            "INSERT INTO trigger_evaluations (signal_id, status) VALUES (1, 'DONE')",
            [],
        );
        assert!(done_without_outcome.is_err());
    }
}
