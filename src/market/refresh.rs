//! Orchestrated region refresh from the upstream.
//!
//! Refreshes for a region are serialized behind a single-flight barrier: a
//! second caller arriving while a refresh is in progress joins it instead
//! of issuing another upstream sweep.

use crate::cache::FlightGroup;
use crate::error::Result;
use crate::esi::models::EsiMarketOrder;
use crate::esi::UpstreamApi;
use crate::market::store::MarketOrderStore;
use crate::models::{Deadline, MarketOrder};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct MarketRefresher {
    esi: Arc<dyn UpstreamApi>,
    store: Arc<MarketOrderStore>,
    flights: FlightGroup<usize>,
}

impl MarketRefresher {
    pub fn new(esi: Arc<dyn UpstreamApi>, store: Arc<MarketOrderStore>) -> Self {
        Self {
            esi,
            store,
            flights: FlightGroup::new(),
        }
    }

    /// Pulls the full region order book and commits it as one snapshot.
    /// Returns the number of rows written.
    pub async fn refresh_region(&self, region_id: i32, deadline: Deadline) -> Result<usize> {
        let key = format!("market:refresh:{region_id}");
        self.flights
            .run(&key, deadline, || async move {
                let wire = self.esi.market_orders(region_id, deadline).await?;
                let orders = sanitize(region_id, wire);
                let written = self.store.upsert(&orders)?;
                info!(region_id, orders = written, "Region snapshot refreshed");
                Ok(written)
            })
            .await
    }
}

/// Converts wire orders to rows, dropping anything that violates the basic
/// order invariants instead of poisoning the snapshot.
fn sanitize(region_id: i32, wire: Vec<EsiMarketOrder>) -> Vec<MarketOrder> {
    let now = Utc::now();
    let total = wire.len();
    let orders: Vec<MarketOrder> = wire
        .into_iter()
        .filter(|o| {
            o.price > 0.0 && o.volume_remain >= 0 && o.volume_remain <= o.volume_total
        })
        .map(|o| MarketOrder {
            order_id: o.order_id,
            type_id: o.type_id,
            region_id,
            location_id: o.location_id,
            is_buy_order: o.is_buy_order,
            price: o.price,
            volume_remain: o.volume_remain,
            volume_total: o.volume_total,
            min_volume: o.min_volume,
            duration: o.duration,
            issued: o.issued,
            fetched_at: now,
        })
        .collect();

    if orders.len() < total {
        warn!(
            region_id,
            dropped = total - orders.len(),
            "Dropped malformed upstream orders"
        );
    }
    orders
}
