//! Jump-graph pathfinding and location resolution.
//!
//! The graph is built once from the static catalog and shared read-only.
//! Paths are shortest by hop count; equal-length paths resolve to the one
//! with the smaller sum of system ids, which keeps responses stable across
//! runs and hash-map orderings.

use crate::error::{BusinessError, Error, Result};
use crate::models::RoutePath;
use crate::sde::SdeCatalog;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Systems below this are not traversed when the caller asks to stay in
/// high security space.
pub const HIGHSEC_THRESHOLD: f64 = 0.5;

pub struct Navigation {
    sde: Arc<SdeCatalog>,
    adjacency: HashMap<i32, Vec<i32>>,
}

impl Navigation {
    pub fn new(sde: Arc<SdeCatalog>) -> Self {
        let mut adjacency: HashMap<i32, Vec<i32>> = HashMap::new();
        for &(a, b) in sde.jumps() {
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort_unstable();
            neighbors.dedup();
        }
        info!(
            systems = adjacency.len(),
            gates = sde.jumps().len(),
            "Jump graph built"
        );
        Self { sde, adjacency }
    }

    /// Maps a station, structure, or system id to its containing system.
    /// Structures are not in the catalog and cannot be resolved here.
    pub fn resolve_system(&self, location_id: i64) -> Result<i32> {
        if SdeCatalog::is_station_id(location_id) {
            return self
                .sde
                .station(location_id)
                .map(|s| s.system_id)
                .ok_or_else(|| Error::NotFound(format!("station {location_id}")));
        }

        if let Ok(system_id) = i32::try_from(location_id) {
            if self.sde.system(system_id).is_some() {
                return Ok(system_id);
            }
        }

        Err(BusinessError::InvalidLocation.into())
    }

    pub fn resolve_region(&self, system_id: i32) -> Result<i32> {
        self.sde
            .system(system_id)
            .map(|s| s.region_id)
            .ok_or_else(|| Error::NotFound(format!("system {system_id}")))
    }

    pub fn shortest_path(&self, from: i32, to: i32, avoid_lowsec: bool) -> Result<RoutePath> {
        let origin = self
            .sde
            .system(from)
            .ok_or_else(|| Error::NotFound(format!("system {from}")))?;
        if self.sde.system(to).is_none() {
            return Err(Error::NotFound(format!("system {to}")));
        }

        if from == to {
            return Ok(RoutePath::same_system(from, origin.security));
        }

        let path = if avoid_lowsec {
            // A filtered search can come up empty even on a connected
            // graph; fall back to the unconstrained route and let the
            // reported minimum security speak for itself.
            match self.search(from, to, true) {
                Some(path) => Some(path),
                None => self.search(from, to, false),
            }
        } else {
            self.search(from, to, false)
        };

        let systems = path.ok_or(BusinessError::NoRoute)?;
        let jumps = (systems.len() - 1) as u32;
        let min_security = self.min_route_security(&systems);
        Ok(RoutePath {
            systems,
            jumps,
            min_security,
        })
    }

    pub fn min_route_security(&self, systems: &[i32]) -> f64 {
        systems
            .iter()
            .filter_map(|id| self.sde.system(*id).map(|s| s.security))
            .fold(f64::INFINITY, f64::min)
            .min(1.0)
    }

    /// Uniform-cost search over (hops, sum of system ids). The secondary
    /// component settles ties deterministically.
    fn search(&self, from: i32, to: i32, highsec_only: bool) -> Option<Vec<i32>> {
        let traversable = |id: i32| -> bool {
            if !highsec_only {
                return true;
            }
            self.sde
                .system(id)
                .map(|s| s.security >= HIGHSEC_THRESHOLD)
                .unwrap_or(false)
        };

        if !traversable(from) || !traversable(to) {
            return None;
        }

        let mut best: HashMap<i32, (u32, u64)> = HashMap::new();
        let mut prev: HashMap<i32, i32> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u32, u64, i32)>> = BinaryHeap::new();

        best.insert(from, (0, from as u64));
        heap.push(Reverse((0, from as u64, from)));

        while let Some(Reverse((hops, sum, node))) = heap.pop() {
            if best.get(&node).is_some_and(|&(h, s)| (hops, sum) > (h, s)) {
                continue;
            }
            if node == to {
                let mut path = vec![node];
                let mut cursor = node;
                while let Some(&parent) = prev.get(&cursor) {
                    path.push(parent);
                    cursor = parent;
                }
                path.reverse();
                return Some(path);
            }

            let Some(neighbors) = self.adjacency.get(&node) else {
                continue;
            };
            for &next in neighbors {
                if !traversable(next) {
                    continue;
                }
                let candidate = (hops + 1, sum + next as u64);
                let improves = best
                    .get(&next)
                    .map_or(true, |&(h, s)| candidate < (h, s));
                if improves {
                    best.insert(next, candidate);
                    prev.insert(next, node);
                    heap.push(Reverse((candidate.0, candidate.1, next)));
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn navigation() -> Navigation {
        Navigation::new(catalog_arc())
    }

    #[test]
    fn resolves_stations_systems_and_rejects_structures() {
        let nav = navigation();
        assert_eq!(nav.resolve_system(STATION_JITA).unwrap(), SYSTEM_JITA);
        assert_eq!(
            nav.resolve_system(SYSTEM_PERIMETER as i64).unwrap(),
            SYSTEM_PERIMETER
        );
        assert!(matches!(
            nav.resolve_system(1_035_466_617_946),
            Err(Error::Business(BusinessError::InvalidLocation))
        ));
        assert!(matches!(
            nav.resolve_system(STATION_JITA + 999),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn resolves_regions() {
        let nav = navigation();
        assert_eq!(nav.resolve_region(SYSTEM_JITA).unwrap(), REGION_FORGE);
        assert_eq!(nav.resolve_region(SYSTEM_AMARR).unwrap(), REGION_DOMAIN);
        assert!(nav.resolve_region(1).is_err());
    }

    #[test]
    fn same_system_route_is_empty() {
        let nav = navigation();
        let route = nav.shortest_path(SYSTEM_JITA, SYSTEM_JITA, false).unwrap();
        assert_eq!(route.jumps, 0);
        assert_eq!(route.systems, vec![SYSTEM_JITA]);
        assert!((route.min_security - 0.95).abs() < 1e-9);
    }

    #[test]
    fn tie_breaks_on_smaller_id_sum() {
        let nav = navigation();
        // Two 2-jump paths exist; the one through Perimeter has the
        // smaller id sum and must win every time.
        let route = nav.shortest_path(SYSTEM_JITA, SYSTEM_URLEN, false).unwrap();
        assert_eq!(route.jumps, 2);
        assert_eq!(
            route.systems,
            vec![SYSTEM_JITA, SYSTEM_PERIMETER, SYSTEM_URLEN]
        );
        assert!((route.min_security - 0.85).abs() < 1e-9);
    }

    #[test]
    fn avoid_lowsec_stays_in_highsec() {
        let nav = navigation();
        let route = nav.shortest_path(SYSTEM_JITA, SYSTEM_URLEN, true).unwrap();
        assert!(route.min_security >= HIGHSEC_THRESHOLD);
        assert_eq!(
            route.systems,
            vec![SYSTEM_JITA, SYSTEM_PERIMETER, SYSTEM_URLEN]
        );
    }

    #[test]
    fn avoid_lowsec_falls_back_when_destination_is_lowsec() {
        let nav = navigation();
        let route = nav.shortest_path(SYSTEM_JITA, SYSTEM_RANCER, true).unwrap();
        assert_eq!(route.jumps, 1);
        assert!(route.min_security < HIGHSEC_THRESHOLD);
    }

    #[test]
    fn disconnected_pair_reports_no_route() {
        let nav = navigation();
        let result = nav.shortest_path(SYSTEM_JITA, SYSTEM_POLARIS, false);
        assert!(matches!(
            result,
            Err(Error::Business(BusinessError::NoRoute))
        ));
    }

    #[test]
    fn path_is_no_longer_than_alternatives() {
        let nav = navigation();
        // Jita to Rancer has a direct gate plus a 2-jump detour.
        let route = nav.shortest_path(SYSTEM_JITA, SYSTEM_RANCER, false).unwrap();
        assert_eq!(route.jumps, 1);
    }

    #[test]
    fn min_route_security_is_minimum_over_path() {
        let nav = navigation();
        let sec = nav.min_route_security(&[SYSTEM_JITA, SYSTEM_RANCER, SYSTEM_URLEN]);
        assert!((sec - 0.30).abs() < 1e-9);
    }
}
