//! Typed, cached accessors over the upstream character endpoints.
//!
//! Skill fetches degrade to zero levels instead of failing; the tax rate
//! falls back to its historical default in the same situation. Locations
//! are cached briefly since characters move, everything else for minutes.

pub mod formulas;

use crate::cache::{CacheFabric, Lookup};
use crate::error::{Error, Result};
use crate::esi::models::{EsiCharacterLocation, EsiSkills};
use crate::esi::UpstreamApi;
use crate::models::{CharacterLocation, CharacterShip, CharacterSkills, Deadline, FittingBonuses, TaxRate};
use crate::sde::SdeCatalog;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const LOCATION_TTL: Duration = Duration::from_secs(10);
const SKILLS_TTL: Duration = Duration::from_secs(300);
const SHIP_TTL: Duration = Duration::from_secs(300);
const FITTING_TTL: Duration = Duration::from_secs(300);
const NAME_TTL: Duration = Duration::from_secs(3600);

// Skill catalog ids consumed by the formulas.
const SKILL_ACCOUNTING: i32 = 16622;
const SKILL_BROKER_RELATIONS: i32 = 3446;
const SKILL_ADVANCED_BROKER_RELATIONS: i32 = 33467;
const SKILL_NAVIGATION: i32 = 3449;
const SKILL_EVASIVE_MANEUVERING: i32 = 3453;
const SKILL_WARP_DRIVE_OPERATION: i32 = 3455;
const SKILLS_RACIAL_INDUSTRIAL: [i32; 4] = [3340, 3341, 3342, 3343];
const SKILLS_FREIGHTER: [i32; 4] = [20524, 20525, 20526, 20527];

pub struct CharacterService {
    esi: Arc<dyn UpstreamApi>,
    cache: Arc<CacheFabric>,
    sde: Arc<SdeCatalog>,
}

impl CharacterService {
    pub fn new(esi: Arc<dyn UpstreamApi>, cache: Arc<CacheFabric>, sde: Arc<SdeCatalog>) -> Self {
        Self { esi, cache, sde }
    }

    /// Current location enriched with system, region, and station names.
    pub async fn location(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<CharacterLocation> {
        let key = format!("char:loc:{character_id}");
        let raw: EsiCharacterLocation = self
            .cache
            .get_or_compute(&key, LOCATION_TTL, deadline, || async {
                self.esi
                    .character_location(character_id, token, deadline)
                    .await
            })
            .await?;

        self.enrich_location(raw, deadline).await
    }

    async fn enrich_location(
        &self,
        raw: EsiCharacterLocation,
        deadline: Deadline,
    ) -> Result<CharacterLocation> {
        let system = self
            .sde
            .system(raw.solar_system_id)
            .ok_or_else(|| Error::NotFound(format!("system {}", raw.solar_system_id)))?;
        let region = self
            .sde
            .region(system.region_id)
            .ok_or_else(|| Error::NotFound(format!("region {}", system.region_id)))?;

        let location_name = if let Some(station_id) = raw.station_id {
            Some(match self.sde.station(station_id) {
                Some(station) => station.name.clone(),
                None => self.resolve_location_name(station_id, deadline).await,
            })
        } else if let Some(structure_id) = raw.structure_id {
            Some(self.resolve_location_name(structure_id, deadline).await)
        } else {
            None
        };

        Ok(CharacterLocation {
            solar_system_id: system.system_id,
            solar_system_name: system.name.clone(),
            region_id: region.region_id,
            region_name: region.name.clone(),
            station_id: raw.station_id,
            structure_id: raw.structure_id,
            location_name,
        })
    }

    /// Display name for a location the catalog does not carry. Falls back
    /// to a synthesized name when the upstream cannot or will not resolve
    /// it; never fails the caller.
    async fn resolve_location_name(&self, location_id: i64, deadline: Deadline) -> String {
        let key = format!("names:{location_id}");
        match self.cache.lookup(&key).await {
            Lookup::Hit(bytes) => {
                if let Ok(name) = serde_json::from_slice::<String>(&bytes) {
                    return name;
                }
            }
            // A recent lookup already came back empty; do not ask again.
            Lookup::Negative => return format!("Structure {location_id}"),
            Lookup::Miss => {}
        }

        match self.esi.resolve_names(&[location_id], deadline).await {
            Ok(names) => {
                if let Some(name) = names.into_iter().find(|n| n.id == location_id) {
                    let _ = self.cache.set(&key, &name.name, NAME_TTL).await;
                    name.name
                } else {
                    self.cache.set_negative(&key).await;
                    format!("Structure {location_id}")
                }
            }
            Err(e) => {
                warn!(location_id, error = %e, "Name resolution failed");
                format!("Structure {location_id}")
            }
        }
    }

    /// Skill levels for the formula layer. Upstream failures yield the
    /// zero-level default with `degraded` set; this method never errors.
    pub async fn skills(&self, character_id: i64, token: &str, deadline: Deadline) -> CharacterSkills {
        let key = format!("char:skills:{character_id}");
        let result = self
            .cache
            .get_or_compute(&key, SKILLS_TTL, deadline, || async {
                let wire = self
                    .esi
                    .character_skills(character_id, token, deadline)
                    .await?;
                Ok(map_skills(&wire))
            })
            .await;

        match result {
            Ok(skills) => skills,
            Err(e) => {
                warn!(character_id, error = %e, "Skill fetch failed, using defaults");
                CharacterSkills::degraded_default()
            }
        }
    }

    /// Effective tax components. Falls back to the stock rate when the
    /// skill snapshot is degraded.
    pub async fn tax_rate(&self, character_id: i64, token: &str, deadline: Deadline) -> TaxRate {
        let skills = self.skills(character_id, token, deadline).await;
        if skills.degraded {
            return TaxRate::fallback();
        }

        TaxRate {
            sales_tax: formulas::sales_tax_fraction(skills.accounting),
            broker_fee: formulas::broker_fee_fraction(
                skills.broker_relations,
                skills.advanced_broker_relations,
                0.0,
                0.0,
            ),
            degraded: false,
        }
    }

    /// The currently boarded ship.
    pub async fn ship(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<CharacterShip> {
        let key = format!("char:ship:{character_id}");
        let wire = self
            .cache
            .get_or_compute(&key, SHIP_TTL, deadline, || async {
                self.esi.character_ship(character_id, token, deadline).await
            })
            .await?;

        let hull = self
            .sde
            .item_type(wire.ship_type_id)
            .ok_or_else(|| Error::NotFound(format!("type {}", wire.ship_type_id)))?;
        let attributes = self.sde.ship_attributes(wire.ship_type_id);

        Ok(CharacterShip {
            ship_type_id: wire.ship_type_id,
            ship_name: wire.ship_name,
            type_name: hull.name.clone(),
            cargo_capacity: attributes.map(|a| a.cargo_capacity).unwrap_or(0.0),
        })
    }

    /// Every ship hull in the character's assets.
    pub async fn ships(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<Vec<CharacterShip>> {
        let key = format!("char:ships:{character_id}");
        let assets = self
            .cache
            .get_or_compute(&key, SHIP_TTL, deadline, || async {
                self.esi
                    .character_assets(character_id, token, deadline)
                    .await
            })
            .await?;

        let mut ships = Vec::new();
        for asset in assets {
            let Some(attributes) = self.sde.ship_attributes(asset.type_id) else {
                continue;
            };
            let Some(hull) = self.sde.item_type(asset.type_id) else {
                continue;
            };
            ships.push(CharacterShip {
                ship_type_id: asset.type_id,
                ship_name: hull.name.clone(),
                type_name: hull.name.clone(),
                cargo_capacity: attributes.cargo_capacity,
            });
        }
        Ok(ships)
    }

    /// Aggregated bonuses from the character's saved fitting for a hull.
    /// No saved fitting means no bonuses, not an error.
    pub async fn fitting_bonuses(
        &self,
        character_id: i64,
        ship_type_id: i32,
        token: &str,
        deadline: Deadline,
    ) -> Result<FittingBonuses> {
        let key = format!("char:fit:{character_id}");
        let fittings = self
            .cache
            .get_or_compute(&key, FITTING_TTL, deadline, || async {
                self.esi
                    .character_fittings(character_id, token, deadline)
                    .await
            })
            .await?;

        let Some(fitting) = fittings.iter().find(|f| f.ship_type_id == ship_type_id) else {
            return Ok(FittingBonuses::default());
        };

        let mut bonuses = FittingBonuses::default();
        for item in &fitting.items {
            let Some(module) = self.sde.module_attributes(item.type_id) else {
                continue;
            };
            for _ in 0..item.quantity.max(1) {
                if let Some(m) = module.cargo_multiplier {
                    bonuses.cargo_multipliers.push(m);
                }
                if let Some(flat) = module.cargo_flat {
                    bonuses.cargo_flat_m3 += flat;
                }
                if let Some(m) = module.warp_multiplier {
                    bonuses.warp_speed_multipliers.push(m);
                }
                if let Some(m) = module.inertia_multiplier {
                    bonuses.inertia_modifiers.push(m);
                }
            }
        }
        Ok(bonuses)
    }
}

fn map_skills(wire: &EsiSkills) -> CharacterSkills {
    let level = |skill_id: i32| -> u8 {
        wire.skills
            .iter()
            .find(|s| s.skill_id == skill_id)
            .map(|s| s.active_skill_level.clamp(0, 5) as u8)
            .unwrap_or(0)
    };
    let best_of = |ids: &[i32]| -> u8 { ids.iter().map(|&id| level(id)).max().unwrap_or(0) };

    CharacterSkills {
        accounting: level(SKILL_ACCOUNTING),
        broker_relations: level(SKILL_BROKER_RELATIONS),
        advanced_broker_relations: level(SKILL_ADVANCED_BROKER_RELATIONS),
        navigation: level(SKILL_NAVIGATION),
        evasive_maneuvering: level(SKILL_EVASIVE_MANEUVERING),
        warp_drive_operation: level(SKILL_WARP_DRIVE_OPERATION),
        racial_industrial: best_of(&SKILLS_RACIAL_INDUSTRIAL),
        freighter: best_of(&SKILLS_FREIGHTER),
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esi::models::{EsiFitting, EsiFittingItem};
    use crate::testutil::*;
    use std::sync::atomic::Ordering;

    fn service(stub: Arc<StubUpstream>) -> CharacterService {
        CharacterService::new(stub, Arc::new(CacheFabric::new(None)), catalog_arc())
    }

    #[tokio::test]
    async fn location_is_enriched_and_cached() {
        let stub = Arc::new(StubUpstream::docked_at(STATION_JITA, SYSTEM_JITA));
        let service = service(stub.clone());

        let location = service.location(7, "token", deadline()).await.unwrap();
        assert!(location.is_docked());
        assert_eq!(location.solar_system_name, "Jita");
        assert_eq!(location.region_name, "The Forge");
        assert_eq!(
            location.location_name.as_deref(),
            Some("Jita IV - Moon 4 - Caldari Navy Assembly Plant")
        );

        service.location(7, "token", deadline()).await.unwrap();
        assert_eq!(stub.location_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn structure_names_resolve_through_upstream() {
        let structure_id = 1_035_466_617_946i64;
        let stub = Arc::new(StubUpstream::with_location(EsiCharacterLocation {
            solar_system_id: SYSTEM_PERIMETER,
            station_id: None,
            structure_id: Some(structure_id),
        }));
        stub.names
            .lock()
            .insert(structure_id, "Perimeter - Tranquility Trading Tower".to_string());
        let service = service(stub);

        let location = service.location(7, "token", deadline()).await.unwrap();
        assert_eq!(
            location.location_name.as_deref(),
            Some("Perimeter - Tranquility Trading Tower")
        );
    }

    #[tokio::test]
    async fn unknown_structure_names_are_synthesized() {
        let structure_id = 1_035_466_617_946i64;
        let stub = Arc::new(StubUpstream::with_location(EsiCharacterLocation {
            solar_system_id: SYSTEM_PERIMETER,
            station_id: None,
            structure_id: Some(structure_id),
        }));
        let service = service(stub);

        let location = service.location(7, "token", deadline()).await.unwrap();
        assert_eq!(
            location.location_name,
            Some(format!("Structure {structure_id}"))
        );
    }

    #[tokio::test]
    async fn skill_fetch_failure_degrades_gracefully() {
        let stub = Arc::new(StubUpstream::default());
        *stub.skills_error.lock() =
            Some(Error::UpstreamUnavailable("budget exhausted".into()));
        let service = service(stub);

        let skills = service.skills(7, "token", deadline()).await;
        assert!(skills.degraded);
        assert_eq!(skills.accounting, 0);

        let tax = service.tax_rate(7, "token", deadline()).await;
        assert!(tax.degraded);
        assert!((tax.effective() - 0.055).abs() < 1e-12);
    }

    #[tokio::test]
    async fn tax_rate_from_trained_skills() {
        let stub = Arc::new(StubUpstream::default());
        stub.set_skill_levels(&[
            (SKILL_ACCOUNTING, 5),
            (SKILL_BROKER_RELATIONS, 5),
            (SKILL_ADVANCED_BROKER_RELATIONS, 5),
        ]);
        let service = service(stub);

        let tax = service.tax_rate(7, "token", deadline()).await;
        assert!(!tax.degraded);
        assert!((tax.sales_tax - 0.036).abs() < 1e-12);
        assert!((tax.broker_fee - 0.012).abs() < 1e-12);
        assert!((tax.effective() - 0.048).abs() < 1e-12);
    }

    #[tokio::test]
    async fn fitting_bonuses_aggregate_modules() {
        let stub = Arc::new(StubUpstream::default());
        *stub.fittings.lock() = vec![EsiFitting {
            fitting_id: 1,
            name: "hauling fit".to_string(),
            ship_type_id: SHIP_BADGER,
            items: vec![
                EsiFittingItem {
                    type_id: MODULE_CARGOHOLD,
                    flag: 11,
                    quantity: 2,
                },
                EsiFittingItem {
                    type_id: MODULE_WARP_RIG,
                    flag: 92,
                    quantity: 1,
                },
            ],
        }];
        let service = service(stub);

        let bonuses = service
            .fitting_bonuses(7, SHIP_BADGER, "token", deadline())
            .await
            .unwrap();
        assert_eq!(bonuses.cargo_multipliers, vec![1.255, 1.255]);
        assert_eq!(bonuses.warp_speed_multipliers, vec![1.1]);
        assert!(bonuses.inertia_modifiers.is_empty());

        // A hull without a saved fitting gets the empty bonus set.
        let none = service
            .fitting_bonuses(7, 9999, "token", deadline())
            .await
            .unwrap();
        assert!(none.cargo_multipliers.is_empty());
    }
}
