//! Upstream game API access: client, wire types, and call governors.

pub mod client;
pub mod limits;
pub mod models;

pub use client::EsiClient;
pub use limits::{ErrorBudget, TokenBucket};

use crate::error::Result;
use crate::models::Deadline;
use async_trait::async_trait;
use models::*;

/// Capability set over the upstream API. Services depend on this trait so
/// tests can substitute an in-memory double.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Full regional order book, all pages.
    async fn market_orders(&self, region_id: i32, deadline: Deadline)
        -> Result<Vec<EsiMarketOrder>>;

    /// Daily trade aggregates for one type in a region.
    async fn market_history(
        &self,
        region_id: i32,
        type_id: i32,
        deadline: Deadline,
    ) -> Result<Vec<EsiMarketHistoryDay>>;

    async fn character_location(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<EsiCharacterLocation>;

    async fn character_skills(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<EsiSkills>;

    async fn character_ship(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<EsiShip>;

    async fn character_assets(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<Vec<EsiAsset>>;

    async fn character_fittings(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<Vec<EsiFitting>>;

    /// Bulk id to display-name resolution.
    async fn resolve_names(&self, ids: &[i64], deadline: Deadline) -> Result<Vec<EsiName>>;

    /// Autopilot passthrough. The only mutating upstream call in the system.
    async fn set_waypoint(
        &self,
        destination_id: i64,
        token: &str,
        clear_other_waypoints: bool,
        add_to_beginning: bool,
        deadline: Deadline,
    ) -> Result<()>;
}
