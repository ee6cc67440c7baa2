//! Daily volume aggregates and liquidity scoring.

use crate::cache::CacheFabric;
use crate::error::Result;
use crate::esi::UpstreamApi;
use crate::market::store::MarketOrderStore;
use crate::models::{Deadline, VolumeDay, VolumeMetrics};
use std::sync::Arc;
use std::time::Duration;

/// Days of history considered when averaging volume.
const HISTORY_WINDOW_DAYS: usize = 30;
/// Achievable share of daily traded volume for one seller.
const MARKET_SHARE: f64 = 0.1;
/// Daily aggregates move once a day; an hour of cache is plenty.
const HISTORY_TTL: Duration = Duration::from_secs(3600);
/// Fewer days than this and the average is noise.
const MIN_DATA_DAYS: u32 = 2;

pub struct VolumeService {
    esi: Arc<dyn UpstreamApi>,
    store: Arc<MarketOrderStore>,
    cache: Arc<CacheFabric>,
}

impl VolumeService {
    pub fn new(
        esi: Arc<dyn UpstreamApi>,
        store: Arc<MarketOrderStore>,
        cache: Arc<CacheFabric>,
    ) -> Self {
        Self { esi, store, cache }
    }

    /// Liquidity metrics for selling `quantity` units of a type, or `None`
    /// when the history is too thin to say anything.
    pub async fn metrics(
        &self,
        region_id: i32,
        type_id: i32,
        quantity: i64,
        deadline: Deadline,
    ) -> Result<Option<VolumeMetrics>> {
        let days = self.window(region_id, type_id, deadline).await?;
        Ok(compute_metrics(&days, quantity))
    }

    /// The recent daily aggregates, fetched from the upstream at most once
    /// per TTL and persisted for offline queries.
    async fn window(
        &self,
        region_id: i32,
        type_id: i32,
        deadline: Deadline,
    ) -> Result<Vec<VolumeDay>> {
        let key = format!("market:history:{region_id}:{type_id}");
        self.cache
            .get_or_compute(&key, HISTORY_TTL, deadline, || async {
                let wire = self.esi.market_history(region_id, type_id, deadline).await?;
                let mut days: Vec<VolumeDay> = wire
                    .into_iter()
                    .map(|d| VolumeDay {
                        date: d.date,
                        volume: d.volume,
                        average_price: d.average,
                    })
                    .collect();
                days.sort_by_key(|d| d.date);
                if days.len() > HISTORY_WINDOW_DAYS {
                    days.drain(..days.len() - HISTORY_WINDOW_DAYS);
                }
                self.store.upsert_volume_history(region_id, type_id, &days)?;
                Ok(days)
            })
            .await
    }
}

fn compute_metrics(days: &[VolumeDay], quantity: i64) -> Option<VolumeMetrics> {
    let data_days = days.len() as u32;
    if data_days < MIN_DATA_DAYS {
        return None;
    }

    let daily_volume_avg =
        days.iter().map(|d| d.volume as f64).sum::<f64>() / data_days as f64;
    if daily_volume_avg <= 0.0 {
        return None;
    }
    let daily_isk_turnover = days
        .iter()
        .map(|d| d.volume as f64 * d.average_price)
        .sum::<f64>()
        / data_days as f64;

    let liquidation_days = quantity as f64 / (daily_volume_avg * MARKET_SHARE);

    Some(VolumeMetrics {
        daily_volume_avg,
        daily_isk_turnover,
        data_days,
        liquidity_score: liquidity_score(daily_isk_turnover, data_days),
        liquidation_days,
    })
}

/// Bucketed 0..=100 score: up to 70 points for turnover on a log scale
/// between 1M and 10B ISK/day, up to 30 points for history depth.
fn liquidity_score(daily_isk_turnover: f64, data_days: u32) -> u8 {
    let turnover_points = if daily_isk_turnover <= 0.0 {
        0.0
    } else {
        let log = daily_isk_turnover.log10();
        70.0 * ((log - 6.0) / 4.0).clamp(0.0, 1.0)
    };
    let depth_points = 30.0 * (data_days as f64 / HISTORY_WINDOW_DAYS as f64).min(1.0);
    (turnover_points + depth_points).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esi::models::EsiMarketHistoryDay;
    use crate::testutil::{StubUpstream, REGION_FORGE, TYPE_TRITANIUM};
    use chrono::NaiveDate;
    use std::sync::atomic::Ordering;

    fn day(date: &str, volume: i64, average: f64) -> VolumeDay {
        VolumeDay {
            date: date.parse().unwrap(),
            volume,
            average_price: average,
        }
    }

    #[test]
    fn metrics_require_enough_days() {
        assert!(compute_metrics(&[day("2025-07-01", 1000, 5.0)], 100).is_none());
        assert!(compute_metrics(&[], 100).is_none());
    }

    #[test]
    fn metrics_average_over_window() {
        let days = vec![
            day("2025-07-01", 1000, 5.0),
            day("2025-07-02", 3000, 5.0),
        ];
        let metrics = compute_metrics(&days, 1000).unwrap();
        assert_eq!(metrics.daily_volume_avg, 2000.0);
        assert_eq!(metrics.daily_isk_turnover, 10000.0);
        assert_eq!(metrics.data_days, 2);
        // 1000 units at 10% of 2000/day = 5 days to liquidate.
        assert!((metrics.liquidation_days - 5.0).abs() < 1e-9);
    }

    #[test]
    fn score_buckets_are_monotonic() {
        assert_eq!(liquidity_score(0.0, 0), 0);
        let thin = liquidity_score(1.0e6, 5);
        let deep = liquidity_score(1.0e9, 30);
        assert!(deep > thin);
        assert!(deep <= 100);
        assert_eq!(liquidity_score(1.0e12, 30), 100);
    }

    #[tokio::test]
    async fn window_fetches_once_then_serves_cache() {
        let stub = Arc::new(StubUpstream::default());
        stub.history.lock().insert(
            (REGION_FORGE, TYPE_TRITANIUM),
            vec![
                EsiMarketHistoryDay {
                    date: NaiveDate::parse_from_str("2025-07-01", "%Y-%m-%d").unwrap(),
                    volume: 1000,
                    average: 5.0,
                    highest: 5.5,
                    lowest: 4.5,
                    order_count: 12,
                },
                EsiMarketHistoryDay {
                    date: NaiveDate::parse_from_str("2025-07-02", "%Y-%m-%d").unwrap(),
                    volume: 2000,
                    average: 5.1,
                    highest: 5.6,
                    lowest: 4.8,
                    order_count: 20,
                },
            ],
        );

        let store = Arc::new(MarketOrderStore::open_in_memory().unwrap());
        let cache = Arc::new(CacheFabric::new(None));
        let service = VolumeService::new(stub.clone(), store.clone(), cache);

        let first = service
            .metrics(REGION_FORGE, TYPE_TRITANIUM, 300, crate::testutil::deadline())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.data_days, 2);

        let second = service
            .metrics(REGION_FORGE, TYPE_TRITANIUM, 300, crate::testutil::deadline())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.daily_volume_avg, first.daily_volume_avg);
        assert_eq!(stub.history_calls.load(Ordering::SeqCst), 1);

        // The aggregates were persisted alongside the cache write.
        let persisted = store
            .volume_window(REGION_FORGE, TYPE_TRITANIUM, 30)
            .unwrap();
        assert_eq!(persisted.len(), 2);
    }
}
