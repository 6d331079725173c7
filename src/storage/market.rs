/// Collector-facing writes and analyzer-facing reads for tokens, pairs and bars
use super::types::{Pair, PriceBar, Timeframe, Token};
use super::Database;
use crate::errors::{DipwatchError, DipwatchResult};
use rusqlite::{params, OptionalExtension, Row};

fn row_to_pair(row: &Row<'_>) -> rusqlite::Result<Pair> {
    Ok(Pair {
        pair_address: row.get(0)?,
        chain_id: row.get(1)?,
        dex_id: row.get(2)?,
        base_address: row.get(3)?,
        quote_address: row.get(4)?,
        url: row.get(5)?,
        created_at_ms: row.get(6)?,
    })
}

const PAIR_COLUMNS: &str =
    "pair_address, chain_id, dex_id, base_address, quote_address, url, created_at_ms";

impl Database {
    // ==================== Tokens ====================

    /// Insert a token or refresh its metadata. Identity never changes.
    pub fn upsert_token(&self, token: &Token) -> DipwatchResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tokens (chain_id, address, symbol, name, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chain_id, address) DO UPDATE SET
                    symbol = excluded.symbol,
                    name = COALESCE(excluded.name, tokens.name),
                    updated_at_ms = excluded.updated_at_ms",
                params![
                    token.chain_id,
                    token.address,
                    token.symbol,
                    token.name,
                    token.updated_at_ms
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_token(&self, chain_id: &str, address: &str) -> DipwatchResult<Option<Token>> {
        self.with_conn(|conn| {
            let token = conn
                .query_row(
                    "SELECT chain_id, address, symbol, name, updated_at_ms
                     FROM tokens WHERE chain_id = ?1 AND address = ?2",
                    params![chain_id, address],
                    |row| {
                        Ok(Token {
                            chain_id: row.get(0)?,
                            address: row.get(1)?,
                            symbol: row.get(2)?,
                            name: row.get(3)?,
                            updated_at_ms: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(token)
        })
    }

    // ==================== Pairs ====================

    /// Record a pair. Pairs are immutable: returns false if it already existed.
    pub fn insert_pair(&self, pair: &Pair) -> DipwatchResult<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO pairs
                    (pair_address, chain_id, dex_id, base_address, quote_address, url, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    pair.pair_address,
                    pair.chain_id,
                    pair.dex_id,
                    pair.base_address,
                    pair.quote_address,
                    pair.url,
                    pair.created_at_ms
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn get_pair(&self, pair_address: &str) -> DipwatchResult<Option<Pair>> {
        self.with_conn(|conn| {
            let pair = conn
                .query_row(
                    &format!("SELECT {} FROM pairs WHERE pair_address = ?1", PAIR_COLUMNS),
                    params![pair_address],
                    row_to_pair,
                )
                .optional()?;
            Ok(pair)
        })
    }

    /// Pairs created at or after `created_after_ms`, newest first
    pub fn pairs_created_since(&self, created_after_ms: i64) -> DipwatchResult<Vec<Pair>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pairs WHERE created_at_ms >= ?1 ORDER BY created_at_ms DESC",
                PAIR_COLUMNS
            ))?;
            let pairs = stmt
                .query_map(params![created_after_ms], row_to_pair)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(pairs)
        })
    }

    /// Pairs whose base token is `base_address` (any chain)
    pub fn pairs_for_base_token(&self, base_address: &str) -> DipwatchResult<Vec<Pair>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pairs WHERE base_address = ?1 ORDER BY created_at_ms ASC",
                PAIR_COLUMNS
            ))?;
            let pairs = stmt
                .query_map(params![base_address], row_to_pair)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(pairs)
        })
    }

    // ==================== Price bars ====================

    /// Append one bar. Duplicate (pair, timeframe, ts) keys are ignored so
    /// the collector can re-send overlapping pages. Returns true if inserted.
    pub fn insert_price_bar(&self, bar: &PriceBar) -> DipwatchResult<bool> {
        Ok(self.insert_price_bars(std::slice::from_ref(bar))? > 0)
    }

    /// Append a batch of bars in one transaction; returns rows inserted
    pub fn insert_price_bars(&self, bars: &[PriceBar]) -> DipwatchResult<usize> {
        if let Some(bad) = bars.iter().find(|b| !b.is_valid()) {
            return Err(DipwatchError::InvalidPriceBar(format!(
                "inconsistent OHLCV bar for {} at {}",
                bad.pair_address, bad.ts
            )));
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO price_bars
                        (pair_address, timeframe, ts, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for bar in bars {
                    inserted += stmt.execute(params![
                        bar.pair_address,
                        bar.timeframe.as_str(),
                        bar.ts,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    /// Bars with `after_ts < ts <= until_ts`, ascending
    pub fn bars_in_window(
        &self,
        pair_address: &str,
        timeframe: Timeframe,
        after_ts: i64,
        until_ts: i64,
    ) -> DipwatchResult<Vec<PriceBar>> {
        self.with_conn(|conn| load_bars_in_window(conn, pair_address, timeframe, after_ts, until_ts))
    }

    /// Most recent bar of a series
    pub fn latest_bar(
        &self,
        pair_address: &str,
        timeframe: Timeframe,
    ) -> DipwatchResult<Option<PriceBar>> {
        self.with_conn(|conn| {
            let bar = conn
                .query_row(
                    "SELECT pair_address, timeframe, ts, open, high, low, close, volume
                     FROM price_bars WHERE pair_address = ?1 AND timeframe = ?2
                     ORDER BY ts DESC LIMIT 1",
                    params![pair_address, timeframe.as_str()],
                    row_to_bar_raw,
                )
                .optional()?;
            bar.map(into_price_bar).transpose()
        })
    }

    /// Highest high at or after `since_ts`
    pub fn max_high_since(
        &self,
        pair_address: &str,
        timeframe: Timeframe,
        since_ts: i64,
    ) -> DipwatchResult<Option<f64>> {
        self.with_conn(|conn| {
            let max: Option<f64> = conn.query_row(
                "SELECT MAX(high) FROM price_bars
                 WHERE pair_address = ?1 AND timeframe = ?2 AND ts >= ?3",
                params![pair_address, timeframe.as_str(), since_ts],
                |row| row.get(0),
            )?;
            Ok(max)
        })
    }

    /// Summed bar volume at or after `since_ts`
    pub fn volume_since(
        &self,
        pair_address: &str,
        timeframe: Timeframe,
        since_ts: i64,
    ) -> DipwatchResult<f64> {
        self.with_conn(|conn| {
            let volume: f64 = conn.query_row(
                "SELECT COALESCE(SUM(volume), 0.0) FROM price_bars
                 WHERE pair_address = ?1 AND timeframe = ?2 AND ts >= ?3",
                params![pair_address, timeframe.as_str(), since_ts],
                |row| row.get(0),
            )?;
            Ok(volume)
        })
    }
}

type RawBar = (String, String, i64, f64, f64, f64, f64, f64);

fn row_to_bar_raw(row: &Row<'_>) -> rusqlite::Result<RawBar> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_price_bar(raw: RawBar) -> DipwatchResult<PriceBar> {
    let (pair_address, timeframe, ts, open, high, low, close, volume) = raw;
    Ok(PriceBar {
        pair_address,
        timeframe: Timeframe::from_db(&timeframe)?,
        ts,
        open,
        high,
        low,
        close,
        volume,
    })
}

/// Shared with the analyzer, which reads bars inside its own transaction
pub(crate) fn load_bars_in_window(
    conn: &rusqlite::Connection,
    pair_address: &str,
    timeframe: Timeframe,
    after_ts: i64,
    until_ts: i64,
) -> DipwatchResult<Vec<PriceBar>> {
    let mut stmt = conn.prepare_cached(
        "SELECT pair_address, timeframe, ts, open, high, low, close, volume
         FROM price_bars
         WHERE pair_address = ?1 AND timeframe = ?2 AND ts > ?3 AND ts <= ?4
         ORDER BY ts ASC",
    )?;
    let raw = stmt
        .query_map(
            params![pair_address, timeframe.as_str(), after_ts, until_ts],
            row_to_bar_raw,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(into_price_bar).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(pair: &str, ts: i64, high: f64, low: f64) -> PriceBar {
        PriceBar {
            pair_address: pair.to_string(),
            timeframe: Timeframe::Minute5,
            ts,
            open: low,
            high,
            low,
            close: high,
            volume: 100.0,
        }
    }

    #[test]
    fn test_token_upsert_refreshes_metadata() {
        let db = Database::open_in_memory().unwrap();
        let mut token = Token {
            chain_id: "solana".to_string(),
            address: "MintA".to_string(),
            symbol: "AAA".to_string(),
            name: Some("Alpha".to_string()),
            updated_at_ms: 1,
        };
        db.upsert_token(&token).unwrap();
        token.symbol = "AAA2".to_string();
        token.name = None;
        token.updated_at_ms = 2;
        db.upsert_token(&token).unwrap();

        let stored = db.get_token("solana", "MintA").unwrap().unwrap();
        assert_eq!(stored.symbol, "AAA2");
        assert_eq!(stored.name.as_deref(), Some("Alpha"));
        assert_eq!(stored.updated_at_ms, 2);
    }

    #[test]
    fn test_pair_is_insert_or_ignore() {
        let db = Database::open_in_memory().unwrap();
        let pair = Pair {
            pair_address: "P1".to_string(),
            chain_id: "solana".to_string(),
            dex_id: "raydium".to_string(),
            base_address: "MintA".to_string(),
            quote_address: "So11".to_string(),
            url: None,
            created_at_ms: 1_000,
        };
        assert!(db.insert_pair(&pair).unwrap());
        let mut changed = pair.clone();
        changed.dex_id = "orca".to_string();
        assert!(!db.insert_pair(&changed).unwrap());
        assert_eq!(db.get_pair("P1").unwrap().unwrap().dex_id, "raydium");
    }

    #[test]
    fn test_bar_window_bounds() {
        let db = Database::open_in_memory().unwrap();
        let bars: Vec<PriceBar> = (0..5).map(|i| bar("P1", i * 300_000, 1.1, 0.9)).collect();
        assert_eq!(db.insert_price_bars(&bars).unwrap(), 5);
        // duplicates ignored
        assert!(!db.insert_price_bar(&bars[0]).unwrap());

        let window = db
            .bars_in_window("P1", Timeframe::Minute5, 0, 900_000)
            .unwrap();
        let ts: Vec<i64> = window.iter().map(|b| b.ts).collect();
        assert_eq!(ts, vec![300_000, 600_000, 900_000]);

        let other_tf = db
            .bars_in_window("P1", Timeframe::Minute1, 0, 900_000)
            .unwrap();
        assert!(other_tf.is_empty());
    }

    #[test]
    fn test_series_aggregates() {
        let db = Database::open_in_memory().unwrap();
        db.insert_price_bars(&[bar("P1", 0, 2.0, 1.0), bar("P1", 300_000, 1.5, 0.5)])
            .unwrap();
        assert_eq!(
            db.max_high_since("P1", Timeframe::Minute5, 0).unwrap(),
            Some(2.0)
        );
        assert_eq!(
            db.max_high_since("P2", Timeframe::Minute5, 0).unwrap(),
            None
        );
        assert_eq!(db.volume_since("P1", Timeframe::Minute5, 1).unwrap(), 100.0);
        assert_eq!(
            db.latest_bar("P1", Timeframe::Minute5).unwrap().unwrap().ts,
            300_000
        );
    }

    #[test]
    fn test_invalid_bar_rejected() {
        let db = Database::open_in_memory().unwrap();
        let mut broken = bar("P1", 0, 1.0, 2.0);
        broken.open = 1.5;
        assert!(db.insert_price_bar(&broken).is_err());
    }
}
