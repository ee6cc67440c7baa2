//! Sell-side orchestration for a docked inventory stack.
//!
//! Joins the character's location, their effective tax, the regional buy
//! orders, and the jump topology into a ranked list of places to sell.
//! Business failures stop the request; per-order failures skip the order.

use crate::character::CharacterService;
use crate::error::{BusinessError, Error, Result};
use crate::market::MarketOrderStore;
use crate::models::Deadline;
use crate::navigation::{Navigation, HIGHSEC_THRESHOLD};
use crate::sde::SdeCatalog;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityFilter {
    #[default]
    Any,
    /// Every system along the route at or above 0.5 security.
    Highsec,
    /// Excludes only routes that dip into nullsec.
    Highlow,
}

impl SecurityFilter {
    fn passes(&self, min_route_security: f64) -> bool {
        match self {
            SecurityFilter::Any => true,
            SecurityFilter::Highsec => min_route_security >= HIGHSEC_THRESHOLD,
            SecurityFilter::Highlow => min_route_security > 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventorySellRequest {
    pub type_id: i32,
    pub quantity: i64,
    /// Cost basis per unit, used to compute profit.
    pub buy_price_per_unit: f64,
    pub region_id: i32,
    pub min_profit_per_unit: Option<f64>,
    #[serde(default)]
    pub security_filter: SecurityFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct SellOpportunity {
    pub order_id: i64,
    pub station_id: i64,
    pub station_name: String,
    pub system_id: i32,
    pub system_name: String,
    pub price: f64,
    pub net_price_per_unit: f64,
    pub profit_per_unit: f64,
    pub quantity: i64,
    pub total_profit: f64,
    pub jumps: u32,
    pub min_route_security: f64,
}

pub struct InventorySellOrchestrator {
    character: Arc<CharacterService>,
    navigation: Arc<Navigation>,
    store: Arc<MarketOrderStore>,
    sde: Arc<SdeCatalog>,
}

impl InventorySellOrchestrator {
    pub fn new(
        character: Arc<CharacterService>,
        navigation: Arc<Navigation>,
        store: Arc<MarketOrderStore>,
        sde: Arc<SdeCatalog>,
    ) -> Self {
        Self {
            character,
            navigation,
            store,
            sde,
        }
    }

    pub async fn sell_routes(
        &self,
        request: &InventorySellRequest,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<Vec<SellOpportunity>> {
        if request.quantity <= 0 {
            return Err(Error::Validation("quantity must be positive".into()));
        }
        if self.sde.item_type(request.type_id).is_none() {
            return Err(Error::NotFound(format!("type {}", request.type_id)));
        }
        if self.sde.region(request.region_id).is_none() {
            return Err(Error::NotFound(format!("region {}", request.region_id)));
        }

        // Location and tax come from independent upstream endpoints, so
        // fetch them side by side. The docked check still runs before any
        // market read, so an undocked caller costs nothing further.
        let (location, tax) = futures_util::future::join(
            self.character.location(character_id, token, deadline),
            self.character.tax_rate(character_id, token, deadline),
        )
        .await;
        let location = location?;
        let Some(docked_at) = location.docked_location_id() else {
            return Err(BusinessError::NotDocked.into());
        };

        // Structures resolve through the location payload's own system.
        let start_system = self
            .navigation
            .resolve_system(docked_at)
            .unwrap_or(location.solar_system_id);

        let tax = tax.effective();
        let min_profit = request.min_profit_per_unit.unwrap_or(0.0);

        let orders = self.store.get_orders(request.region_id, request.type_id)?;
        let mut opportunities = Vec::new();

        for order in orders.into_iter().filter(|o| o.is_buy_order) {
            let net_price = order.price * (1.0 - tax);
            let profit_per_unit = net_price - request.buy_price_per_unit;
            if profit_per_unit < min_profit {
                continue;
            }

            let quantity = request.quantity.min(order.volume_remain);
            if quantity <= 0 {
                continue;
            }

            let Ok(order_system) = self.navigation.resolve_system(order.location_id) else {
                continue;
            };
            let Ok(route) = self
                .navigation
                .shortest_path(start_system, order_system, false)
            else {
                continue;
            };
            if !request.security_filter.passes(route.min_security) {
                continue;
            }

            let system_name = self
                .sde
                .system(order_system)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            let station_name = self
                .sde
                .station(order.location_id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| format!("Structure {}", order.location_id));

            opportunities.push(SellOpportunity {
                order_id: order.order_id,
                station_id: order.location_id,
                station_name,
                system_id: order_system,
                system_name,
                price: order.price,
                net_price_per_unit: net_price,
                profit_per_unit,
                quantity,
                total_profit: profit_per_unit * quantity as f64,
                jumps: route.jumps,
                min_route_security: route.min_security,
            });
        }

        opportunities.sort_by(|a, b| {
            b.profit_per_unit
                .total_cmp(&a.profit_per_unit)
                .then(a.order_id.cmp(&b.order_id))
        });

        debug!(
            type_id = request.type_id,
            region_id = request.region_id,
            results = opportunities.len(),
            "Inventory sell routes computed"
        );
        Ok(opportunities)
    }
}
