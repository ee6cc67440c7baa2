//! Wire types for upstream responses.
//!
//! These mirror the JSON the game API emits; the services translate them
//! into the domain types in `crate::models`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiMarketOrder {
    pub order_id: i64,
    pub type_id: i32,
    pub location_id: i64,
    #[serde(default)]
    pub system_id: Option<i32>,
    pub is_buy_order: bool,
    pub price: f64,
    pub volume_remain: i64,
    pub volume_total: i64,
    #[serde(default)]
    pub min_volume: Option<i64>,
    pub duration: i32,
    pub issued: DateTime<Utc>,
}

/// One day of regional trade aggregates for a type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiMarketHistoryDay {
    pub date: NaiveDate,
    pub volume: i64,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub order_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiCharacterLocation {
    pub solar_system_id: i32,
    #[serde(default)]
    pub station_id: Option<i64>,
    #[serde(default)]
    pub structure_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiSkill {
    pub skill_id: i32,
    pub active_skill_level: i32,
    pub trained_skill_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiSkills {
    pub skills: Vec<EsiSkill>,
    #[serde(default)]
    pub total_sp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiShip {
    pub ship_item_id: i64,
    pub ship_name: String,
    pub ship_type_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiAsset {
    pub item_id: i64,
    pub type_id: i32,
    pub location_id: i64,
    pub quantity: i64,
    pub location_flag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiFittingItem {
    pub type_id: i32,
    pub flag: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiFitting {
    pub fitting_id: i64,
    pub name: String,
    pub ship_type_id: i32,
    pub items: Vec<EsiFittingItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiName {
    pub id: i64,
    pub name: String,
    pub category: String,
}
