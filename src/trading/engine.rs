//! Region-wide route calculation.
//!
//! One snapshot read feeds the whole pass: orders are partitioned per type,
//! asks are matched against bids under post-tax profitability, and every
//! surviving candidate is priced, routed, and ranked. Per-type failures
//! skip the type; the soft deadline turns the remainder of the region into
//! a partial result instead of an error.

use crate::character::{formulas, CharacterService};
use crate::error::{Error, Result};
use crate::market::{MarketOrderStore, VolumeService};
use crate::models::{CharacterSkills, Deadline, FittingBonuses, MarketOrder, OrderBook, TaxRate, TradingRoute};
use crate::navigation::Navigation;
use crate::sde::SdeCatalog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;
/// Mean warp leg between two gates; the catalog carries no per-gate
/// distances, so travel time uses this fixed length per hop.
const WARP_LEG_AU: f64 = 30.0;
const GATE_CYCLE_SECS: f64 = 12.0;
/// Docking, loading, and undocking overhead added to every trip.
const FIXED_OVERHEAD_SECS: f64 = 120.0;
const DEFAULT_WARP_SPEED_AU_S: f64 = 3.0;
const DEFAULT_ALIGN_SECS: f64 = 10.0;
/// Fraction of sell revenue assumed lost to order relisting.
const RELIST_REVENUE_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteCalculationRequest {
    pub region_id: i32,
    pub ship_type_id: i32,
    pub cargo_capacity: Option<f64>,
    pub warp_speed: Option<f64>,
    pub align_time: Option<f64>,
    pub min_daily_volume: Option<f64>,
    pub max_liquidation_days: Option<f64>,
    #[serde(default)]
    pub include_volume_metrics: bool,
    pub max_travel_seconds: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteCalculation {
    pub routes: Vec<TradingRoute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub calculation_time_ms: u64,
    pub processed_types: usize,
    pub candidate_types: usize,
}

/// Matched flow between the two sides of one type's book.
#[derive(Debug, Default)]
pub(crate) struct MatchResult {
    pub quantity: i64,
    pub cost: f64,
    pub revenue: f64,
    pub buy_location: i64,
    pub sell_location: i64,
    /// (ask price, bid price, quantity) per fill, for auditability.
    pub fills: Vec<(f64, f64, i64)>,
}

pub struct RouteEngine {
    store: Arc<MarketOrderStore>,
    sde: Arc<SdeCatalog>,
    navigation: Arc<Navigation>,
    character: Arc<CharacterService>,
    volume: Arc<VolumeService>,
}

impl RouteEngine {
    pub fn new(
        store: Arc<MarketOrderStore>,
        sde: Arc<SdeCatalog>,
        navigation: Arc<Navigation>,
        character: Arc<CharacterService>,
        volume: Arc<VolumeService>,
    ) -> Self {
        Self {
            store,
            sde,
            navigation,
            character,
            volume,
        }
    }

    pub async fn calculate(
        &self,
        request: &RouteCalculationRequest,
        auth: Option<(i64, &str)>,
        deadline: Deadline,
    ) -> Result<RouteCalculation> {
        let started = Instant::now();
        let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        if self.sde.region(request.region_id).is_none() {
            return Err(Error::NotFound(format!("region {}", request.region_id)));
        }

        // One snapshot read for the entire pass.
        let orders = self.store.get_all_orders(request.region_id)?;
        let mut by_type: HashMap<i32, Vec<MarketOrder>> = HashMap::new();
        for order in orders {
            by_type.entry(order.type_id).or_default().push(order);
        }
        let mut books: Vec<(i32, OrderBook)> = by_type
            .into_iter()
            .map(|(type_id, orders)| (type_id, OrderBook::from_orders(orders)))
            .filter(|(_, book)| book.is_two_sided())
            .collect();
        books.sort_by_key(|(type_id, _)| *type_id);
        let candidate_types = books.len();

        let ship = self.ship_parameters(request, auth, deadline).await?;

        let needs_metrics = request.include_volume_metrics
            || request.min_daily_volume.is_some()
            || request.max_liquidation_days.is_some();

        let mut routes: Vec<TradingRoute> = Vec::new();
        let mut warning = None;
        let mut processed = 0usize;

        for (type_id, book) in &books {
            if deadline.is_expired() {
                warning = Some("timeout, partial results".to_string());
                break;
            }
            processed += 1;

            let Some(item) = self.sde.item_type(*type_id) else {
                continue;
            };
            if item.volume <= 0.0 {
                continue;
            }

            let Some(matched) = match_books(book, ship.tax.effective()) else {
                continue;
            };

            let Some(mut route) = self.price_candidate(*type_id, item.volume, &matched, &ship)
            else {
                continue;
            };

            if let Some(max_travel) = request.max_travel_seconds {
                if route.travel_seconds > max_travel {
                    continue;
                }
            }

            if needs_metrics {
                let metrics = self
                    .volume
                    .metrics(request.region_id, *type_id, matched.quantity, deadline)
                    .await
                    .unwrap_or(None);

                if let Some(min_volume) = request.min_daily_volume {
                    match &metrics {
                        Some(m) if m.daily_volume_avg >= min_volume => {}
                        _ => continue,
                    }
                }
                if let Some(max_days) = request.max_liquidation_days {
                    match &metrics {
                        Some(m) if m.liquidation_days <= max_days => {}
                        _ => continue,
                    }
                }
                if request.include_volume_metrics {
                    route.volume_metrics = metrics;
                }
            }

            routes.push(route);
        }

        // ISK per hour decides, net profit settles ties.
        routes.sort_by(|a, b| {
            b.isk_per_hour
                .total_cmp(&a.isk_per_hour)
                .then(b.net_profit.total_cmp(&a.net_profit))
        });
        routes.truncate(limit);
        for (i, route) in routes.iter_mut().enumerate() {
            route.rank = (i + 1) as u32;
        }

        let calculation_time_ms = started.elapsed().as_millis() as u64;
        info!(
            region_id = request.region_id,
            candidates = candidate_types,
            processed,
            results = routes.len(),
            elapsed_ms = calculation_time_ms,
            partial = warning.is_some(),
            "Route calculation finished"
        );

        Ok(RouteCalculation {
            routes,
            warning,
            calculation_time_ms,
            processed_types: processed,
            candidate_types,
        })
    }

    /// Resolves cargo, warp, align, tax, and the start system for the pass.
    async fn ship_parameters(
        &self,
        request: &RouteCalculationRequest,
        auth: Option<(i64, &str)>,
        deadline: Deadline,
    ) -> Result<ShipParameters> {
        let (skills, bonuses, tax, start_system) = match auth {
            Some((character_id, token)) => {
                // Four independent upstream endpoints; fetch them side by
                // side and join before deriving anything.
                let (skills, bonuses, tax, location) = futures_util::future::join4(
                    self.character.skills(character_id, token, deadline),
                    self.character.fitting_bonuses(
                        character_id,
                        request.ship_type_id,
                        token,
                        deadline,
                    ),
                    self.character.tax_rate(character_id, token, deadline),
                    self.character.location(character_id, token, deadline),
                )
                .await;
                (
                    skills,
                    bonuses.unwrap_or_default(),
                    tax,
                    location.ok().map(|l| l.solar_system_id),
                )
            }
            None => (
                CharacterSkills::degraded_default(),
                FittingBonuses::default(),
                TaxRate::fallback(),
                None,
            ),
        };

        let attributes = self.sde.ship_attributes(request.ship_type_id).copied();

        let cargo_capacity = match (request.cargo_capacity, &attributes) {
            (Some(override_m3), _) if override_m3 > 0.0 => override_m3,
            (_, Some(attrs)) => formulas::effective_cargo_capacity(
                attrs.cargo_capacity,
                skills.racial_industrial,
                skills.freighter,
                &bonuses.cargo_multipliers,
                bonuses.cargo_flat_m3,
            ),
            _ => {
                return Err(Error::Validation(format!(
                    "unknown ship type {} and no cargo capacity given",
                    request.ship_type_id
                )))
            }
        };

        let warp_speed = request.warp_speed.filter(|v| *v > 0.0).unwrap_or_else(|| {
            attributes
                .map(|attrs| {
                    formulas::effective_warp_speed(
                        attrs.base_warp_speed,
                        skills.warp_drive_operation,
                        skills.navigation,
                        &bonuses.warp_speed_multipliers,
                    )
                })
                .unwrap_or(DEFAULT_WARP_SPEED_AU_S)
        });

        let align_time = request.align_time.filter(|v| *v >= 0.0).unwrap_or_else(|| {
            attributes
                .map(|attrs| {
                    formulas::align_time_seconds(
                        attrs.mass,
                        attrs.inertia_modifier,
                        skills.evasive_maneuvering,
                        &bonuses.inertia_modifiers,
                    )
                })
                .unwrap_or(DEFAULT_ALIGN_SECS)
        });

        debug!(
            ship_type_id = request.ship_type_id,
            cargo_capacity, warp_speed, align_time,
            tax = tax.effective(),
            "Resolved ship parameters"
        );

        Ok(ShipParameters {
            cargo_capacity,
            warp_speed,
            align_time,
            tax,
            start_system,
        })
    }

    /// Turns a matched book into a full route proposal. Returns `None` when
    /// the candidate cannot be priced or routed; the caller skips it.
    fn price_candidate(
        &self,
        type_id: i32,
        item_volume: f64,
        matched: &MatchResult,
        ship: &ShipParameters,
    ) -> Option<TradingRoute> {
        if matched.quantity <= 0 {
            return None;
        }

        let gross_profit = matched.revenue - matched.cost;
        let sales_tax = matched.revenue * ship.tax.sales_tax;
        let broker_fees = matched.revenue * ship.tax.broker_fee;
        let estimated_relist_fee = ship.tax.broker_fee * matched.revenue * RELIST_REVENUE_FRACTION;
        let net_profit = gross_profit - sales_tax - broker_fees - estimated_relist_fee;
        if net_profit <= 0.0 {
            return None;
        }

        let avg_ask = matched.cost / matched.quantity as f64;
        let avg_bid = matched.revenue / matched.quantity as f64;
        let spread_percent = (avg_bid - avg_ask) / avg_ask * 100.0;
        let net_profit_percent = net_profit / matched.cost * 100.0;

        // Cargo bounds the per-tour load; the rest takes extra tours.
        let per_tour_units = (ship.cargo_capacity / item_volume).floor() as i64;
        if per_tour_units <= 0 {
            return None;
        }
        let per_tour_quantity = per_tour_units.min(matched.quantity);
        let number_of_tours =
            ((matched.quantity + per_tour_quantity - 1) / per_tour_quantity) as u32;
        let cargo_used = per_tour_quantity as f64 * item_volume;

        let buy_system = self.navigation.resolve_system(matched.buy_location).ok()?;
        let sell_system = self.navigation.resolve_system(matched.sell_location).ok()?;
        let start_system = ship.start_system.unwrap_or(buy_system);
        let route = self
            .navigation
            .shortest_path(start_system, sell_system, false)
            .ok()?;

        let per_tour_travel = route.jumps as f64
            * (WARP_LEG_AU / ship.warp_speed + ship.align_time + GATE_CYCLE_SECS);
        let travel_seconds = per_tour_travel * number_of_tours as f64;
        let hours = (travel_seconds + FIXED_OVERHEAD_SECS) / 3600.0;
        let isk_per_hour = net_profit / hours;

        let station_name = |location_id: i64| -> String {
            self.sde
                .station(location_id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| format!("Structure {location_id}"))
        };

        Some(TradingRoute {
            rank: 0,
            type_id,
            type_name: self
                .sde
                .item_type(type_id)
                .map(|t| t.name.clone())
                .unwrap_or_default(),
            buy_station_id: matched.buy_location,
            buy_station_name: station_name(matched.buy_location),
            sell_station_id: matched.sell_location,
            sell_station_name: station_name(matched.sell_location),
            buy_price: avg_ask,
            sell_price: avg_bid,
            quantity: matched.quantity,
            gross_profit,
            sales_tax,
            broker_fees,
            estimated_relist_fee,
            net_profit,
            net_profit_percent,
            spread_percent,
            travel_seconds,
            jumps: route.jumps,
            cargo_used_m3: cargo_used,
            cargo_capacity_m3: ship.cargo_capacity,
            cargo_utilization_percent: cargo_used / ship.cargo_capacity * 100.0,
            isk_per_hour,
            number_of_tours,
            min_route_security: route.min_security,
            route_system_ids: route.systems.clone(),
            volume_metrics: None,
        })
    }
}

struct ShipParameters {
    cargo_capacity: f64,
    warp_speed: f64,
    align_time: f64,
    tax: TaxRate,
    start_system: Option<i32>,
}

/// Walks asks (ascending) against bids (descending), accumulating volume
/// while the ask undercuts the post-tax bid. Each side's station is the one
/// contributing the most matched volume.
pub(crate) fn match_books(book: &OrderBook, tax: f64) -> Option<MatchResult> {
    let mut ask_index = 0usize;
    let mut bid_index = 0usize;
    let mut ask_remaining = book.asks.first()?.volume_remain;
    let mut bid_remaining = book.bids.first()?.volume_remain;

    let mut result = MatchResult::default();
    let mut buy_volume: HashMap<i64, i64> = HashMap::new();
    let mut sell_volume: HashMap<i64, i64> = HashMap::new();

    while ask_index < book.asks.len() && bid_index < book.bids.len() {
        let ask = &book.asks[ask_index];
        let bid = &book.bids[bid_index];

        if ask.price >= bid.price * (1.0 - tax) {
            break;
        }
        if bid.min_volume.unwrap_or(1) > bid.volume_remain {
            bid_index += 1;
            if bid_index < book.bids.len() {
                bid_remaining = book.bids[bid_index].volume_remain;
            }
            continue;
        }

        let fill = ask_remaining.min(bid_remaining);
        if fill > 0 {
            result.quantity += fill;
            result.cost += ask.price * fill as f64;
            result.revenue += bid.price * fill as f64;
            result.fills.push((ask.price, bid.price, fill));
            *buy_volume.entry(ask.location_id).or_default() += fill;
            *sell_volume.entry(bid.location_id).or_default() += fill;
            ask_remaining -= fill;
            bid_remaining -= fill;
        }

        if ask_remaining == 0 {
            ask_index += 1;
            if ask_index < book.asks.len() {
                ask_remaining = book.asks[ask_index].volume_remain;
            }
        }
        if bid_remaining == 0 {
            bid_index += 1;
            if bid_index < book.bids.len() {
                bid_remaining = book.bids[bid_index].volume_remain;
            }
        }
    }

    if result.quantity == 0 {
        return None;
    }

    let dominant = |volumes: &HashMap<i64, i64>| -> i64 {
        volumes
            .iter()
            .max_by_key(|(location, volume)| (**volume, -**location))
            .map(|(location, _)| *location)
            .unwrap_or_default()
    };
    result.buy_location = dominant(&buy_volume);
    result.sell_location = dominant(&sell_volume);

    Some(result)
}
