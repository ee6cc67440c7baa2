//! Market snapshot persistence.
//!
//! Order rows are keyed by `order_id` and carry the wall-clock instant the
//! snapshot that produced them was fetched. A whole-region refresh commits
//! in one transaction, so readers in WAL mode observe either the previous
//! snapshot or the new one, never a blend. The sweeper deletes in bounded
//! batches for the same reason.

use crate::error::Result;
use crate::models::{MarketOrder, RegionStaleness, VolumeDay};
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const UPSERT_CHUNK: usize = 1000;
const SWEEP_BATCH: usize = 5000;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS market_orders (
    order_id INTEGER PRIMARY KEY,
    type_id INTEGER NOT NULL,
    region_id INTEGER NOT NULL,
    location_id INTEGER NOT NULL,
    is_buy_order INTEGER NOT NULL,
    price REAL NOT NULL,
    volume_remain INTEGER NOT NULL,
    volume_total INTEGER NOT NULL,
    min_volume INTEGER,
    duration INTEGER NOT NULL,
    issued TEXT NOT NULL,
    fetched_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_region_type
    ON market_orders(region_id, type_id);

CREATE INDEX IF NOT EXISTS idx_orders_fetched
    ON market_orders(fetched_at);

CREATE TABLE IF NOT EXISTS volume_history (
    region_id INTEGER NOT NULL,
    type_id INTEGER NOT NULL,
    day TEXT NOT NULL,
    volume INTEGER NOT NULL,
    average_price REAL NOT NULL,
    PRIMARY KEY (region_id, type_id, day)
) WITHOUT ROWID;
"#;

pub struct MarketOrderStore {
    conn: Mutex<Connection>,
}

impl MarketOrderStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("opening market database at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initializing market schema")?;
        info!(path = %path.display(), "Market snapshot store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory market database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initializing market schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Idempotent batch upsert. Every row in the batch gets the same
    /// `fetched_at`, and the whole batch commits as one transaction so a
    /// concurrent reader never sees a half-applied snapshot.
    pub fn upsert(&self, orders: &[MarketOrder]) -> Result<usize> {
        self.upsert_at(orders, Utc::now())
    }

    fn upsert_at(&self, orders: &[MarketOrder], fetched_at: DateTime<Utc>) -> Result<usize> {
        if orders.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let fetched_millis = fetched_at.timestamp_millis();
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO market_orders (
                    order_id, type_id, region_id, location_id, is_buy_order,
                    price, volume_remain, volume_total, min_volume, duration,
                    issued, fetched_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(order_id) DO UPDATE SET
                    type_id = excluded.type_id,
                    region_id = excluded.region_id,
                    location_id = excluded.location_id,
                    is_buy_order = excluded.is_buy_order,
                    price = excluded.price,
                    volume_remain = excluded.volume_remain,
                    volume_total = excluded.volume_total,
                    min_volume = excluded.min_volume,
                    duration = excluded.duration,
                    issued = excluded.issued,
                    fetched_at = excluded.fetched_at
                "#,
            )?;

            for chunk in orders.chunks(UPSERT_CHUNK) {
                for order in chunk {
                    stmt.execute(params![
                        order.order_id,
                        order.type_id,
                        order.region_id,
                        order.location_id,
                        order.is_buy_order as i64,
                        order.price,
                        order.volume_remain,
                        order.volume_total,
                        order.min_volume,
                        order.duration,
                        order.issued.to_rfc3339(),
                        fetched_millis,
                    ])?;
                    written += 1;
                }
            }
        }
        tx.commit()?;
        debug!(orders = written, "Upserted market snapshot");
        Ok(written)
    }

    pub fn get_orders(&self, region_id: i32, type_id: i32) -> Result<Vec<MarketOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, type_id, region_id, location_id, is_buy_order,
                    price, volume_remain, volume_total, min_volume, duration,
                    issued, fetched_at
             FROM market_orders WHERE region_id = ?1 AND type_id = ?2",
        )?;
        let rows = stmt.query_map(params![region_id, type_id], row_to_order)?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row?);
        }
        Ok(orders)
    }

    pub fn get_all_orders(&self, region_id: i32) -> Result<Vec<MarketOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, type_id, region_id, location_id, is_buy_order,
                    price, volume_remain, volume_total, min_volume, duration,
                    issued, fetched_at
             FROM market_orders WHERE region_id = ?1",
        )?;
        let rows = stmt.query_map(params![region_id], row_to_order)?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row?);
        }
        Ok(orders)
    }

    pub fn staleness(&self, region_id: i32) -> Result<RegionStaleness> {
        let conn = self.conn.lock();
        let (total, latest_millis): (u64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(fetched_at) FROM market_orders WHERE region_id = ?1",
            params![region_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let latest_fetch = latest_millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let age_minutes = latest_fetch.map(|t| (Utc::now() - t).num_milliseconds() as f64 / 60_000.0);

        Ok(RegionStaleness {
            region_id,
            total_orders: total,
            latest_fetch,
            age_minutes,
        })
    }

    /// Deletes orders whose snapshot is older than the horizon. Works in
    /// bounded batches so readers are never starved of the write lock.
    pub fn sweep(&self, older_than: Duration) -> Result<usize> {
        let cutoff = (Utc::now()
            - ChronoDuration::milliseconds(older_than.as_millis() as i64))
        .timestamp_millis();

        let mut removed = 0usize;
        loop {
            let batch = {
                let conn = self.conn.lock();
                conn.execute(
                    "DELETE FROM market_orders WHERE order_id IN (
                         SELECT order_id FROM market_orders
                         WHERE fetched_at < ?1 LIMIT ?2
                     )",
                    params![cutoff, SWEEP_BATCH as i64],
                )?
            };
            removed += batch;
            if batch < SWEEP_BATCH {
                break;
            }
        }

        if removed > 0 {
            info!(removed, "Swept stale market orders");
        }
        Ok(removed)
    }

    pub fn upsert_volume_history(
        &self,
        region_id: i32,
        type_id: i32,
        days: &[VolumeDay],
    ) -> Result<usize> {
        if days.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO volume_history (region_id, type_id, day, volume, average_price)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(region_id, type_id, day) DO UPDATE SET
                     volume = excluded.volume,
                     average_price = excluded.average_price",
            )?;
            for day in days {
                stmt.execute(params![
                    region_id,
                    type_id,
                    day.date.to_string(),
                    day.volume,
                    day.average_price,
                ])?;
            }
        }
        tx.commit()?;
        Ok(days.len())
    }

    /// Most recent daily aggregates, newest first, at most `window` rows.
    pub fn volume_window(
        &self,
        region_id: i32,
        type_id: i32,
        window: u32,
    ) -> Result<Vec<VolumeDay>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT day, volume, average_price FROM volume_history
             WHERE region_id = ?1 AND type_id = ?2
             ORDER BY day DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![region_id, type_id, window], |row| {
            let day: String = row.get(0)?;
            Ok((day, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?))
        })?;

        let mut days = Vec::new();
        for row in rows {
            let (day, volume, average_price) = row?;
            let date = day
                .parse::<NaiveDate>()
                .map_err(|e| crate::error::Error::internal("parsing volume history day", e))?;
            days.push(VolumeDay {
                date,
                volume,
                average_price,
            });
        }
        Ok(days)
    }

    #[cfg(test)]
    pub(crate) fn backdate_all(&self, by: Duration) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE market_orders SET fetched_at = fetched_at - ?1",
            params![by.as_millis() as i64],
        )
        .unwrap();
    }
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketOrder> {
    let issued: String = row.get(10)?;
    let fetched_millis: i64 = row.get(11)?;
    Ok(MarketOrder {
        order_id: row.get(0)?,
        type_id: row.get(1)?,
        region_id: row.get(2)?,
        location_id: row.get(3)?,
        is_buy_order: row.get::<_, i64>(4)? != 0,
        price: row.get(5)?,
        volume_remain: row.get(6)?,
        volume_total: row.get(7)?,
        min_volume: row.get(8)?,
        duration: row.get(9)?,
        issued: DateTime::parse_from_rfc3339(&issued)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        fetched_at: Utc
            .timestamp_millis_opt(fetched_millis)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{order, REGION_FORGE, STATION_JITA, TYPE_PYERITE, TYPE_TRITANIUM};
    use std::collections::HashSet;

    fn store() -> MarketOrderStore {
        MarketOrderStore::open_in_memory().unwrap()
    }

    #[test]
    fn upsert_then_get_returns_matching_subset() {
        let store = store();
        let orders = vec![
            order(1, TYPE_TRITANIUM, STATION_JITA, true, 5.0, 100),
            order(2, TYPE_TRITANIUM, STATION_JITA, false, 5.5, 200),
            order(3, TYPE_PYERITE, STATION_JITA, true, 9.0, 50),
        ];
        store.upsert(&orders).unwrap();

        let trit = store.get_orders(REGION_FORGE, TYPE_TRITANIUM).unwrap();
        let ids: HashSet<i64> = trit.iter().map(|o| o.order_id).collect();
        assert_eq!(ids, HashSet::from([1, 2]));

        let all = store.get_all_orders(REGION_FORGE).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = store();
        let orders = vec![
            order(1, TYPE_TRITANIUM, STATION_JITA, true, 5.0, 100),
            order(2, TYPE_TRITANIUM, STATION_JITA, false, 5.5, 200),
        ];
        store.upsert(&orders).unwrap();
        store.upsert(&orders).unwrap();

        let all = store.get_all_orders(REGION_FORGE).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn upsert_mutates_existing_rows() {
        let store = store();
        store
            .upsert(&[order(1, TYPE_TRITANIUM, STATION_JITA, true, 5.0, 100)])
            .unwrap();

        let mut updated = order(1, TYPE_TRITANIUM, STATION_JITA, true, 6.0, 80);
        updated.volume_remain = 80;
        store.upsert(&[updated]).unwrap();

        let rows = store.get_orders(REGION_FORGE, TYPE_TRITANIUM).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, 6.0);
        assert_eq!(rows[0].volume_remain, 80);
    }

    #[test]
    fn snapshot_rows_share_one_fetch_instant() {
        let store = store();
        let orders = vec![
            order(1, TYPE_TRITANIUM, STATION_JITA, true, 5.0, 100),
            order(2, TYPE_PYERITE, STATION_JITA, false, 9.0, 50),
        ];
        store.upsert(&orders).unwrap();

        let all = store.get_all_orders(REGION_FORGE).unwrap();
        assert_eq!(all[0].fetched_at, all[1].fetched_at);
    }

    #[test]
    fn staleness_reports_age_of_latest_fetch() {
        let store = store();
        let empty = store.staleness(REGION_FORGE).unwrap();
        assert_eq!(empty.total_orders, 0);
        assert!(empty.latest_fetch.is_none());
        assert!(empty.age_minutes.is_none());

        store
            .upsert(&[order(1, TYPE_TRITANIUM, STATION_JITA, true, 5.0, 100)])
            .unwrap();
        store.backdate_all(Duration::from_secs(600));

        let staleness = store.staleness(REGION_FORGE).unwrap();
        assert_eq!(staleness.total_orders, 1);
        let age = staleness.age_minutes.unwrap();
        assert!((age - 10.0).abs() < 1.0 / 60.0, "age {age}");
    }

    #[test]
    fn sweep_removes_only_stale_rows() {
        let store = store();
        store
            .upsert(&[order(1, TYPE_TRITANIUM, STATION_JITA, true, 5.0, 100)])
            .unwrap();
        store.backdate_all(Duration::from_secs(25 * 3600));
        store
            .upsert(&[order(2, TYPE_PYERITE, STATION_JITA, true, 9.0, 50)])
            .unwrap();

        let removed = store.sweep(Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(removed, 1);

        let all = store.get_all_orders(REGION_FORGE).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].order_id, 2);
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.db");

        let store = MarketOrderStore::open(&path).unwrap();
        store
            .upsert(&[order(1, TYPE_TRITANIUM, STATION_JITA, true, 5.0, 100)])
            .unwrap();
        drop(store);

        let reopened = MarketOrderStore::open(&path).unwrap();
        assert_eq!(reopened.get_all_orders(REGION_FORGE).unwrap().len(), 1);
    }

    #[test]
    fn volume_history_round_trips() {
        let store = store();
        let days = vec![
            VolumeDay {
                date: "2025-07-01".parse().unwrap(),
                volume: 1000,
                average_price: 5.0,
            },
            VolumeDay {
                date: "2025-07-02".parse().unwrap(),
                volume: 1500,
                average_price: 5.2,
            },
        ];
        store
            .upsert_volume_history(REGION_FORGE, TYPE_TRITANIUM, &days)
            .unwrap();
        store
            .upsert_volume_history(REGION_FORGE, TYPE_TRITANIUM, &days)
            .unwrap();

        let window = store
            .volume_window(REGION_FORGE, TYPE_TRITANIUM, 30)
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].date.to_string(), "2025-07-02");
        assert_eq!(window[0].volume, 1500);
    }
}
