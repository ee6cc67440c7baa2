//! Core domain types shared across services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// A single live order from a regional market snapshot.
///
/// `order_id` is the primary key; repeated upserts of the same order mutate
/// the row in place. `fetched_at` drives the staleness horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOrder {
    pub order_id: i64,
    pub type_id: i32,
    pub region_id: i32,
    pub location_id: i64,
    pub is_buy_order: bool,
    pub price: f64,
    pub volume_remain: i64,
    pub volume_total: i64,
    pub min_volume: Option<i64>,
    pub duration: i32,
    pub issued: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

/// Live orders for one (region, type), split by side.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    /// Buy orders, price descending.
    pub bids: Vec<MarketOrder>,
    /// Sell orders, price ascending.
    pub asks: Vec<MarketOrder>,
}

impl OrderBook {
    pub fn from_orders(mut orders: Vec<MarketOrder>) -> Self {
        let mut bids: Vec<MarketOrder> = Vec::new();
        let mut asks: Vec<MarketOrder> = Vec::new();
        for order in orders.drain(..) {
            if order.is_buy_order {
                bids.push(order);
            } else {
                asks.push(order);
            }
        }
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        Self { bids, asks }
    }

    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }
}

/// Trading and navigation skill levels, all in 0..=5.
///
/// `degraded` marks a snapshot synthesized after a failed upstream fetch;
/// downstream consumers fall back to conservative defaults instead of
/// propagating the failure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CharacterSkills {
    pub accounting: u8,
    pub broker_relations: u8,
    pub advanced_broker_relations: u8,
    pub navigation: u8,
    pub evasive_maneuvering: u8,
    pub warp_drive_operation: u8,
    pub racial_industrial: u8,
    pub freighter: u8,
    pub degraded: bool,
}

impl CharacterSkills {
    pub fn degraded_default() -> Self {
        Self {
            degraded: true,
            ..Self::default()
        }
    }
}

/// Where a character currently is, enriched with catalog names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterLocation {
    pub solar_system_id: i32,
    pub solar_system_name: String,
    pub region_id: i32,
    pub region_name: String,
    pub station_id: Option<i64>,
    pub structure_id: Option<i64>,
    /// Display name of the station or structure when docked.
    pub location_name: Option<String>,
}

impl CharacterLocation {
    pub fn is_docked(&self) -> bool {
        self.station_id.is_some() || self.structure_id.is_some()
    }

    /// The docked location id, station first.
    pub fn docked_location_id(&self) -> Option<i64> {
        self.station_id.or(self.structure_id)
    }
}

/// The ship a character is currently flying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterShip {
    pub ship_type_id: i32,
    pub ship_name: String,
    pub type_name: String,
    pub cargo_capacity: f64,
}

/// Aggregate bonuses derived from a saved fitting.
///
/// Multipliers are the raw per-module values; stacking penalties are applied
/// at evaluation time so the formula layer controls ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FittingBonuses {
    pub cargo_multipliers: Vec<f64>,
    pub cargo_flat_m3: f64,
    pub warp_speed_multipliers: Vec<f64>,
    pub inertia_modifiers: Vec<f64>,
}

/// Effective transaction cost fractions for a character.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaxRate {
    pub sales_tax: f64,
    pub broker_fee: f64,
    /// True when derived from fallback values rather than live skills.
    pub degraded: bool,
}

impl TaxRate {
    pub const MIN_EFFECTIVE: f64 = 0.01;
    pub const MAX_EFFECTIVE: f64 = 0.10;

    /// Combined revenue fraction, clamped to the supported range.
    pub fn effective(&self) -> f64 {
        (self.sales_tax + self.broker_fee).clamp(Self::MIN_EFFECTIVE, Self::MAX_EFFECTIVE)
    }

    /// Used when the skill fetch fails. The 5.5% total is the historical
    /// default, split into its usual sales and broker proportions.
    pub fn fallback() -> Self {
        Self {
            sales_tax: 0.034,
            broker_fee: 0.021,
            degraded: true,
        }
    }
}

/// A computed jump route between two systems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePath {
    /// System ids from origin to destination inclusive.
    pub systems: Vec<i32>,
    pub jumps: u32,
    pub min_security: f64,
}

impl RoutePath {
    pub fn same_system(system_id: i32, security: f64) -> Self {
        Self {
            systems: vec![system_id],
            jumps: 0,
            min_security: security,
        }
    }
}

/// Liquidity figures for one traded type, derived from daily aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMetrics {
    pub daily_volume_avg: f64,
    pub daily_isk_turnover: f64,
    pub data_days: u32,
    /// Bucketed 0..=100.
    pub liquidity_score: u8,
    /// Days to liquidate the quantity at a 10% market share.
    pub liquidation_days: f64,
}

/// One ranked buy/haul/sell proposal emitted by the route engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingRoute {
    pub rank: u32,
    pub type_id: i32,
    pub type_name: String,
    pub buy_station_id: i64,
    pub buy_station_name: String,
    pub sell_station_id: i64,
    pub sell_station_name: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub quantity: i64,
    pub gross_profit: f64,
    pub sales_tax: f64,
    pub broker_fees: f64,
    pub estimated_relist_fee: f64,
    pub net_profit: f64,
    pub net_profit_percent: f64,
    pub spread_percent: f64,
    pub travel_seconds: f64,
    pub jumps: u32,
    pub cargo_used_m3: f64,
    pub cargo_capacity_m3: f64,
    pub cargo_utilization_percent: f64,
    pub isk_per_hour: f64,
    pub number_of_tours: u32,
    pub min_route_security: f64,
    pub route_system_ids: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_metrics: Option<VolumeMetrics>,
}

/// Snapshot freshness for one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionStaleness {
    pub region_id: i32,
    pub total_orders: u64,
    pub latest_fetch: Option<DateTime<Utc>>,
    pub age_minutes: Option<f64>,
}

/// One day of aggregated trade volume for a (region, type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDay {
    pub date: chrono::NaiveDate,
    pub volume: i64,
    pub average_price: f64,
}

/// Absolute point in time after which a request gives up.
///
/// Every suspension point takes one of these; waiting primitives use
/// `tokio::time::timeout_at` against it so cancellation is cooperative.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(pub Instant);

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(id: i64, is_buy: bool, price: f64) -> MarketOrder {
        MarketOrder {
            order_id: id,
            type_id: 34,
            region_id: 10000002,
            location_id: 60003760,
            is_buy_order: is_buy,
            price,
            volume_remain: 100,
            volume_total: 100,
            min_volume: None,
            duration: 90,
            issued: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn order_book_sorts_sides() {
        let book = OrderBook::from_orders(vec![
            order(1, true, 5.0),
            order(2, true, 7.0),
            order(3, false, 6.0),
            order(4, false, 4.5),
        ]);
        assert_eq!(book.bids[0].price, 7.0);
        assert_eq!(book.bids[1].price, 5.0);
        assert_eq!(book.asks[0].price, 4.5);
        assert_eq!(book.asks[1].price, 6.0);
        assert!(book.is_two_sided());
    }

    #[test]
    fn tax_rate_effective_is_clamped() {
        let high = TaxRate {
            sales_tax: 0.08,
            broker_fee: 0.03,
            degraded: false,
        };
        assert_eq!(high.effective(), TaxRate::MAX_EFFECTIVE);

        let low = TaxRate {
            sales_tax: 0.001,
            broker_fee: 0.001,
            degraded: false,
        };
        assert_eq!(low.effective(), TaxRate::MIN_EFFECTIVE);
    }

    #[test]
    fn tax_rate_fallback_totals_five_and_a_half_percent() {
        let fallback = TaxRate::fallback();
        assert!((fallback.effective() - 0.055).abs() < 1e-12);
        assert!(fallback.degraded);
    }

    #[test]
    fn deadline_expiry() {
        let live = Deadline::after(Duration::from_secs(60));
        assert!(!live.is_expired());
        assert!(live.remaining() > Duration::from_secs(59));

        let dead = Deadline(Instant::now() - Duration::from_millis(1));
        assert!(dead.is_expired());
        assert_eq!(dead.remaining(), Duration::ZERO);
    }
}
