//! HTTP handlers: thin adapters from request bodies to the orchestrators
//! and from domain results to response envelopes.

use crate::api::auth::Principal;
use crate::api::{ApiError, AppState};
use crate::error::Error;
use crate::models::{Deadline, MarketOrder, RegionStaleness};
use crate::trading::{InventorySellRequest, RouteCalculationRequest, SellOpportunity};
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadline for ordinary lookups; route calculation has its own budget.
const REQUEST_DEADLINE: Duration = Duration::from_secs(15);

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn calculate_routes(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<RouteCalculationRequest>,
) -> Result<Response, ApiError> {
    let deadline = Deadline::after(state.config.route_calc_deadline);
    let outcome = state
        .engine
        .calculate(
            &request,
            Some((principal.character_id, &principal.token)),
            deadline,
        )
        .await?;

    // Partial results are still results, but the status says so.
    let status = if outcome.warning.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Debug, Serialize)]
pub struct InventorySellResponse {
    pub routes: Vec<SellOpportunity>,
    pub count: usize,
}

pub async fn inventory_sell(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<InventorySellRequest>,
) -> Result<Json<InventorySellResponse>, ApiError> {
    let deadline = Deadline::after(REQUEST_DEADLINE);
    let routes = state
        .inventory
        .sell_routes(&request, principal.character_id, &principal.token, deadline)
        .await?;
    Ok(Json(InventorySellResponse {
        count: routes.len(),
        routes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct MarketOrdersQuery {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn market_orders(
    State(state): State<AppState>,
    Path((region_id, type_id)): Path<(i32, i32)>,
    Query(query): Query<MarketOrdersQuery>,
) -> Result<Json<Vec<MarketOrder>>, ApiError> {
    let deadline = Deadline::after(REQUEST_DEADLINE);
    if query.refresh {
        state.refresher.refresh_region(region_id, deadline).await?;
    }
    let orders = state.store.get_orders(region_id, type_id)?;
    Ok(Json(orders))
}

pub async fn market_staleness(
    State(state): State<AppState>,
    Path(region_id): Path<i32>,
) -> Result<Json<RegionStaleness>, ApiError> {
    Ok(Json(state.store.staleness(region_id)?))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchItem {
    pub type_id: i32,
    pub name: String,
    pub group_name: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub items: Vec<SearchItem>,
    pub count: usize,
}

pub async fn search_items(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    if query.q.trim().chars().count() < 3 {
        return Err(ApiError(Error::Validation(
            "query must be at least 3 characters".into(),
        )));
    }
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let items: Vec<SearchItem> = state
        .sde
        .search_types(query.q.trim(), limit)
        .into_iter()
        .map(|t| SearchItem {
            type_id: t.type_id,
            name: t.name.clone(),
            group_name: t.group_name.clone(),
        })
        .collect();

    Ok(Json(SearchResponse {
        count: items.len(),
        items,
    }))
}

#[derive(Debug, Serialize)]
pub struct RegionEntry {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RegionsResponse {
    pub regions: Vec<RegionEntry>,
    pub count: usize,
}

pub async fn regions(State(state): State<AppState>) -> Json<RegionsResponse> {
    let regions: Vec<RegionEntry> = state
        .sde
        .regions()
        .into_iter()
        .map(|r| RegionEntry {
            id: r.region_id,
            name: r.name.clone(),
        })
        .collect();
    Json(RegionsResponse {
        count: regions.len(),
        regions,
    })
}

pub async fn character_location(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<crate::models::CharacterLocation>, ApiError> {
    let deadline = Deadline::after(REQUEST_DEADLINE);
    let location = state
        .character
        .location(principal.character_id, &principal.token, deadline)
        .await?;
    Ok(Json(location))
}

pub async fn character_ship(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<crate::models::CharacterShip>, ApiError> {
    let deadline = Deadline::after(REQUEST_DEADLINE);
    let ship = state
        .character
        .ship(principal.character_id, &principal.token, deadline)
        .await?;
    Ok(Json(ship))
}

pub async fn character_ships(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<crate::models::CharacterShip>>, ApiError> {
    let deadline = Deadline::after(REQUEST_DEADLINE);
    let ships = state
        .character
        .ships(principal.character_id, &principal.token, deadline)
        .await?;
    Ok(Json(ships))
}

pub async fn character_skills(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(character_id): Path<i64>,
) -> Result<Json<crate::models::CharacterSkills>, ApiError> {
    require_same_principal(&principal, character_id)?;
    let deadline = Deadline::after(REQUEST_DEADLINE);
    let skills = state
        .character
        .skills(character_id, &principal.token, deadline)
        .await;
    Ok(Json(skills))
}

pub async fn character_fitting(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((character_id, ship_type_id)): Path<(i64, i32)>,
) -> Result<Json<crate::models::FittingBonuses>, ApiError> {
    require_same_principal(&principal, character_id)?;
    let deadline = Deadline::after(REQUEST_DEADLINE);
    let bonuses = state
        .character
        .fitting_bonuses(character_id, ship_type_id, &principal.token, deadline)
        .await?;
    Ok(Json(bonuses))
}

#[derive(Debug, Deserialize)]
pub struct WaypointRequest {
    pub destination_id: i64,
    #[serde(default)]
    pub clear_other_waypoints: bool,
    #[serde(default)]
    pub add_to_beginning: bool,
}

pub async fn set_waypoint(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<WaypointRequest>,
) -> Result<StatusCode, ApiError> {
    let deadline = Deadline::after(REQUEST_DEADLINE);
    state
        .esi
        .set_waypoint(
            request.destination_id,
            &principal.token,
            request.clear_other_waypoints,
            request.add_to_beginning,
            deadline,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Path character ids must name the authenticated principal.
fn require_same_principal(principal: &Principal, character_id: i64) -> Result<(), ApiError> {
    if principal.character_id != character_id {
        return Err(ApiError(Error::Forbidden));
    }
    Ok(())
}
