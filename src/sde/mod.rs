//! Read-only static game catalog.
//!
//! The catalog ships as a prebuilt SQLite file and never changes while the
//! server runs, so everything is loaded into memory once at startup and the
//! connection is dropped. All lookups afterwards are plain map reads and are
//! safe to share across tasks.

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Station ids live in a fixed numeric band; anything above it is a
/// player-owned structure whose name only the upstream can resolve.
pub const STATION_ID_MIN: i64 = 60_000_000;
pub const STATION_ID_MAX: i64 = 64_000_000;

#[derive(Debug, Clone)]
pub struct ItemType {
    pub type_id: i32,
    pub name: String,
    pub group_name: String,
    /// Packaged volume in m³.
    pub volume: f64,
}

/// Base hull attributes used by the cargo and navigation formulas.
#[derive(Debug, Clone, Copy)]
pub struct ShipAttributes {
    pub type_id: i32,
    pub cargo_capacity: f64,
    pub mass: f64,
    pub inertia_modifier: f64,
    /// AU per second.
    pub base_warp_speed: f64,
}

/// Bonuses a fitted module contributes. Absent fields mean the module does
/// not touch that attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleAttributes {
    pub cargo_multiplier: Option<f64>,
    pub cargo_flat: Option<f64>,
    pub warp_multiplier: Option<f64>,
    pub inertia_multiplier: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SolarSystem {
    pub system_id: i32,
    pub name: String,
    pub region_id: i32,
    pub security: f64,
}

#[derive(Debug, Clone)]
pub struct Region {
    pub region_id: i32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Station {
    pub station_id: i64,
    pub name: String,
    pub system_id: i32,
}

pub struct SdeCatalog {
    types: HashMap<i32, ItemType>,
    ships: HashMap<i32, ShipAttributes>,
    modules: HashMap<i32, ModuleAttributes>,
    systems: HashMap<i32, SolarSystem>,
    regions: HashMap<i32, Region>,
    stations: HashMap<i64, Station>,
    jumps: Vec<(i32, i32)>,
}

impl SdeCatalog {
    /// Opens the catalog file read-only and pulls every table into memory.
    /// A missing or unreadable catalog is a fatal startup condition.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("opening catalog at {}", path.display()))?;
        let catalog = Self::from_connection(&conn)?;
        info!(
            types = catalog.types.len(),
            systems = catalog.systems.len(),
            stations = catalog.stations.len(),
            jumps = catalog.jumps.len(),
            "Static catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_connection(conn: &Connection) -> Result<Self> {
        let mut types = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT type_id, type_name, group_name, volume FROM inv_types")
            .context("catalog is missing inv_types")?;
        let rows = stmt.query_map([], |row| {
            Ok(ItemType {
                type_id: row.get(0)?,
                name: row.get(1)?,
                group_name: row.get(2)?,
                volume: row.get(3)?,
            })
        })?;
        for item in rows {
            let item = item?;
            types.insert(item.type_id, item);
        }

        // Attribute rows are sparse key/value pairs per type. Ships are the
        // types that carry a capacity; modules are the types that modify one
        // of the attributes the formulas consume.
        let mut attrs: HashMap<i32, HashMap<String, f64>> = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT type_id, attribute, value FROM type_attributes")
            .context("catalog is missing type_attributes")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        for row in rows {
            let (type_id, attribute, value) = row?;
            attrs.entry(type_id).or_default().insert(attribute, value);
        }

        let mut ships = HashMap::new();
        let mut modules = HashMap::new();
        for (type_id, attr) in &attrs {
            if let Some(&capacity) = attr.get("capacity") {
                ships.insert(
                    *type_id,
                    ShipAttributes {
                        type_id: *type_id,
                        cargo_capacity: capacity,
                        mass: attr.get("mass").copied().unwrap_or(0.0),
                        inertia_modifier: attr.get("agility").copied().unwrap_or(1.0),
                        base_warp_speed: attr.get("warp_speed").copied().unwrap_or(3.0),
                    },
                );
            }
            let module = ModuleAttributes {
                cargo_multiplier: attr.get("cargo_multiplier").copied(),
                cargo_flat: attr.get("cargo_flat").copied(),
                warp_multiplier: attr.get("warp_multiplier").copied(),
                inertia_multiplier: attr.get("inertia_multiplier").copied(),
            };
            if module.cargo_multiplier.is_some()
                || module.cargo_flat.is_some()
                || module.warp_multiplier.is_some()
                || module.inertia_multiplier.is_some()
            {
                modules.insert(*type_id, module);
            }
        }

        let mut regions = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT region_id, region_name FROM map_regions")
            .context("catalog is missing map_regions")?;
        let rows = stmt.query_map([], |row| {
            Ok(Region {
                region_id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        for region in rows {
            let region = region?;
            regions.insert(region.region_id, region);
        }

        let mut systems = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT system_id, system_name, region_id, security FROM map_solar_systems")
            .context("catalog is missing map_solar_systems")?;
        let rows = stmt.query_map([], |row| {
            Ok(SolarSystem {
                system_id: row.get(0)?,
                name: row.get(1)?,
                region_id: row.get(2)?,
                security: row.get(3)?,
            })
        })?;
        for system in rows {
            let system = system?;
            systems.insert(system.system_id, system);
        }

        let mut stations = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT station_id, station_name, system_id FROM sta_stations")
            .context("catalog is missing sta_stations")?;
        let rows = stmt.query_map([], |row| {
            Ok(Station {
                station_id: row.get(0)?,
                name: row.get(1)?,
                system_id: row.get(2)?,
            })
        })?;
        for station in rows {
            let station = station?;
            stations.insert(station.station_id, station);
        }

        let mut jumps = Vec::new();
        let mut stmt = conn
            .prepare("SELECT from_system_id, to_system_id FROM map_system_jumps")
            .context("catalog is missing map_system_jumps")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(1)?)))?;
        for jump in rows {
            jumps.push(jump?);
        }

        Ok(Self {
            types,
            ships,
            modules,
            systems,
            regions,
            stations,
            jumps,
        })
    }

    pub fn item_type(&self, type_id: i32) -> Option<&ItemType> {
        self.types.get(&type_id)
    }

    pub fn ship_attributes(&self, type_id: i32) -> Option<&ShipAttributes> {
        self.ships.get(&type_id)
    }

    pub fn module_attributes(&self, type_id: i32) -> Option<&ModuleAttributes> {
        self.modules.get(&type_id)
    }

    pub fn system(&self, system_id: i32) -> Option<&SolarSystem> {
        self.systems.get(&system_id)
    }

    pub fn region(&self, region_id: i32) -> Option<&Region> {
        self.regions.get(&region_id)
    }

    /// All regions, id ascending.
    pub fn regions(&self) -> Vec<&Region> {
        let mut all: Vec<&Region> = self.regions.values().collect();
        all.sort_by_key(|r| r.region_id);
        all
    }

    pub fn station(&self, station_id: i64) -> Option<&Station> {
        self.stations.get(&station_id)
    }

    pub fn is_station_id(location_id: i64) -> bool {
        (STATION_ID_MIN..STATION_ID_MAX).contains(&location_id)
    }

    /// Case-insensitive substring search over type names, name ascending.
    pub fn search_types(&self, query: &str, limit: usize) -> Vec<&ItemType> {
        let needle = query.to_lowercase();
        let mut hits: Vec<&ItemType> = self
            .types
            .values()
            .filter(|t| t.name.to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name).then(a.type_id.cmp(&b.type_id)));
        hits.truncate(limit);
        hits
    }

    pub fn jumps(&self) -> &[(i32, i32)] {
        &self.jumps
    }

    pub fn systems(&self) -> impl Iterator<Item = &SolarSystem> {
        self.systems.values()
    }
}
