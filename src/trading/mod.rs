//! Trading use cases: region route calculation and inventory sell-off.

pub mod engine;
pub mod inventory;

pub use engine::{RouteCalculation, RouteCalculationRequest, RouteEngine};
pub use inventory::{
    InventorySellOrchestrator, InventorySellRequest, SecurityFilter, SellOpportunity,
};
