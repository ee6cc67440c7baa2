//! Shared fixtures for unit tests: a miniature star map catalog, canned
//! upstream doubles, and an in-memory remote cache.

use crate::cache::RemoteCache;
use crate::error::{Error, Result};
use crate::esi::models::*;
use crate::esi::UpstreamApi;
use crate::models::{Deadline, MarketOrder};
use crate::sde::SdeCatalog;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub const REGION_FORGE: i32 = 10000002;
pub const REGION_DOMAIN: i32 = 10000043;

pub const SYSTEM_JITA: i32 = 30000142;
pub const SYSTEM_PERIMETER: i32 = 30000144;
pub const SYSTEM_URLEN: i32 = 30000139;
pub const SYSTEM_RANCER: i32 = 30001000;
pub const SYSTEM_POLARIS: i32 = 30009999;
pub const SYSTEM_AMARR: i32 = 30002187;

pub const STATION_JITA: i64 = 60003760;
pub const STATION_URLEN: i64 = 60008494;
pub const STATION_RANCER: i64 = 60011866;

pub const TYPE_TRITANIUM: i32 = 34;
pub const TYPE_PYERITE: i32 = 35;
pub const SHIP_BADGER: i32 = 648;
pub const MODULE_CARGOHOLD: i32 = 1317;
pub const MODULE_CARGO_RIG: i32 = 31117;
pub const MODULE_WARP_RIG: i32 = 33303;
pub const MODULE_ISTAB: i32 = 1403;

/// Builds the fixture catalog in an in-memory database.
pub fn catalog() -> SdeCatalog {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE inv_types (
            type_id INTEGER PRIMARY KEY,
            type_name TEXT NOT NULL,
            group_name TEXT NOT NULL,
            volume REAL NOT NULL
        );
        CREATE TABLE type_attributes (
            type_id INTEGER NOT NULL,
            attribute TEXT NOT NULL,
            value REAL NOT NULL
        );
        CREATE TABLE map_regions (
            region_id INTEGER PRIMARY KEY,
            region_name TEXT NOT NULL
        );
        CREATE TABLE map_solar_systems (
            system_id INTEGER PRIMARY KEY,
            system_name TEXT NOT NULL,
            region_id INTEGER NOT NULL,
            security REAL NOT NULL
        );
        CREATE TABLE sta_stations (
            station_id INTEGER PRIMARY KEY,
            station_name TEXT NOT NULL,
            system_id INTEGER NOT NULL
        );
        CREATE TABLE map_system_jumps (
            from_system_id INTEGER NOT NULL,
            to_system_id INTEGER NOT NULL
        );

        INSERT INTO inv_types VALUES
            (34, 'Tritanium', 'Mineral', 0.01),
            (35, 'Pyerite', 'Mineral', 0.01),
            (648, 'Badger', 'Hauler', 20000.0),
            (1317, 'Expanded Cargohold II', 'Cargo Expander', 5.0),
            (31117, 'Small Cargohold Optimization I', 'Rig Cargohold', 5.0),
            (33303, 'Small Hyperspatial Velocity Optimizer I', 'Rig Navigation', 5.0),
            (1403, 'Inertial Stabilizers II', 'Inertial Stabilizer', 5.0);

        INSERT INTO type_attributes VALUES
            (648, 'capacity', 3900.0),
            (648, 'mass', 13500000.0),
            (648, 'agility', 1.0),
            (648, 'warp_speed', 4.5),
            (1317, 'cargo_multiplier', 1.255),
            (31117, 'cargo_multiplier', 1.15),
            (33303, 'warp_multiplier', 1.1),
            (1403, 'inertia_multiplier', 0.8);

        INSERT INTO map_regions VALUES
            (10000002, 'The Forge'),
            (10000043, 'Domain');

        INSERT INTO map_solar_systems VALUES
            (30000142, 'Jita', 10000002, 0.95),
            (30000144, 'Perimeter', 10000002, 0.90),
            (30000139, 'Urlen', 10000002, 0.85),
            (30001000, 'Rancer', 10000002, 0.30),
            (30009999, 'Polaris', 10000002, 0.00),
            (30002187, 'Amarr', 10000043, 1.00);

        INSERT INTO sta_stations VALUES
            (60003760, 'Jita IV - Moon 4 - Caldari Navy Assembly Plant', 30000142),
            (60008494, 'Urlen III - Trade Hub', 30000139),
            (60011866, 'Rancer V - Thukker Mix Factory', 30001000);

        INSERT INTO map_system_jumps VALUES
            (30000142, 30000144),
            (30000144, 30000139),
            (30000142, 30001000),
            (30001000, 30000139);
        "#,
    )
    .unwrap();
    SdeCatalog::from_connection(&conn).unwrap()
}

pub fn catalog_arc() -> Arc<SdeCatalog> {
    Arc::new(catalog())
}

pub fn order(
    order_id: i64,
    type_id: i32,
    location_id: i64,
    is_buy: bool,
    price: f64,
    volume: i64,
) -> MarketOrder {
    MarketOrder {
        order_id,
        type_id,
        region_id: REGION_FORGE,
        location_id,
        is_buy_order: is_buy,
        price,
        volume_remain: volume,
        volume_total: volume,
        min_volume: None,
        duration: 90,
        issued: Utc::now(),
        fetched_at: Utc::now(),
    }
}

pub fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(30))
}

/// Upstream double with canned responses and per-endpoint call counters.
#[derive(Default)]
pub struct StubUpstream {
    pub orders: Mutex<Vec<EsiMarketOrder>>,
    pub orders_error: Mutex<Option<Error>>,
    pub orders_calls: AtomicUsize,
    /// Artificial latency, to hold single-flight barriers open in tests.
    pub orders_delay: Mutex<Option<Duration>>,
    pub history: Mutex<HashMap<(i32, i32), Vec<EsiMarketHistoryDay>>>,
    pub history_calls: AtomicUsize,
    pub location: Mutex<Option<EsiCharacterLocation>>,
    pub location_calls: AtomicUsize,
    pub skills: Mutex<Option<EsiSkills>>,
    pub skills_error: Mutex<Option<Error>>,
    pub skills_calls: AtomicUsize,
    pub ship: Mutex<Option<EsiShip>>,
    pub assets: Mutex<Vec<EsiAsset>>,
    pub fittings: Mutex<Vec<EsiFitting>>,
    pub names: Mutex<HashMap<i64, String>>,
    pub waypoints: Mutex<Vec<i64>>,
}

impl StubUpstream {
    pub fn with_location(location: EsiCharacterLocation) -> Self {
        let stub = Self::default();
        *stub.location.lock() = Some(location);
        stub
    }

    pub fn docked_at(station_id: i64, system_id: i32) -> Self {
        Self::with_location(EsiCharacterLocation {
            solar_system_id: system_id,
            station_id: Some(station_id),
            structure_id: None,
        })
    }

    pub fn set_skill_levels(&self, levels: &[(i32, i32)]) {
        let skills = levels
            .iter()
            .map(|&(skill_id, level)| EsiSkill {
                skill_id,
                active_skill_level: level,
                trained_skill_level: level,
            })
            .collect();
        *self.skills.lock() = Some(EsiSkills {
            skills,
            total_sp: None,
        });
    }
}

#[async_trait]
impl UpstreamApi for StubUpstream {
    async fn market_orders(
        &self,
        _region_id: i32,
        _deadline: Deadline,
    ) -> Result<Vec<EsiMarketOrder>> {
        self.orders_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.orders_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.orders_error.lock().clone() {
            return Err(err);
        }
        Ok(self.orders.lock().clone())
    }

    async fn market_history(
        &self,
        region_id: i32,
        type_id: i32,
        _deadline: Deadline,
    ) -> Result<Vec<EsiMarketHistoryDay>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .history
            .lock()
            .get(&(region_id, type_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn character_location(
        &self,
        character_id: i64,
        _token: &str,
        _deadline: Deadline,
    ) -> Result<EsiCharacterLocation> {
        self.location_calls.fetch_add(1, Ordering::SeqCst);
        self.location
            .lock()
            .clone()
            .ok_or(Error::NotFound(format!("character {character_id}")))
    }

    async fn character_skills(
        &self,
        character_id: i64,
        _token: &str,
        _deadline: Deadline,
    ) -> Result<EsiSkills> {
        self.skills_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.skills_error.lock().clone() {
            return Err(err);
        }
        self.skills
            .lock()
            .clone()
            .ok_or(Error::NotFound(format!("character {character_id}")))
    }

    async fn character_ship(
        &self,
        character_id: i64,
        _token: &str,
        _deadline: Deadline,
    ) -> Result<EsiShip> {
        self.ship
            .lock()
            .clone()
            .ok_or(Error::NotFound(format!("character {character_id}")))
    }

    async fn character_assets(
        &self,
        _character_id: i64,
        _token: &str,
        _deadline: Deadline,
    ) -> Result<Vec<EsiAsset>> {
        Ok(self.assets.lock().clone())
    }

    async fn character_fittings(
        &self,
        _character_id: i64,
        _token: &str,
        _deadline: Deadline,
    ) -> Result<Vec<EsiFitting>> {
        Ok(self.fittings.lock().clone())
    }

    async fn resolve_names(&self, ids: &[i64], _deadline: Deadline) -> Result<Vec<EsiName>> {
        let names = self.names.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                names.get(id).map(|name| EsiName {
                    id: *id,
                    name: name.clone(),
                    category: "structure".to_string(),
                })
            })
            .collect())
    }

    async fn set_waypoint(
        &self,
        destination_id: i64,
        _token: &str,
        _clear_other_waypoints: bool,
        _add_to_beginning: bool,
        _deadline: Deadline,
    ) -> Result<()> {
        self.waypoints.lock().push(destination_id);
        Ok(())
    }
}

/// Remote cache double. TTLs are recorded but never enforced; tests that
/// care about expiry use the local tier's clock instead.
#[derive(Default)]
pub struct MemoryRemote {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRemote {
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[async_trait]
impl RemoteCache for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}
