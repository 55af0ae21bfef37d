//! Static route and fleet reference data.
//!
//! Processors only see the [`ReferenceData`] trait, so tests can swap in
//! their own tables.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::model::SaccoInfo;

pub trait ReferenceData: Send + Sync {
    /// Operator of a route, or `None` if the route is unmapped.
    fn lookup_route(&self, route_id: &str) -> Option<SaccoInfo>;

    /// Route a matatu is registered on.
    fn route_of(&self, matatu_id: &str) -> Option<String>;

    /// Operator of a matatu, via the route it is registered on.
    fn sacco_of_matatu(&self, matatu_id: &str) -> Option<SaccoInfo> {
        self.route_of(matatu_id)
            .and_then(|route| self.lookup_route(&route))
    }
}

/// Nairobi routes with their operating SACCO and terminus.
pub const NAIROBI_ROUTES: &[(&str, &str, &str, &str)] = &[
    ("route_33", "sacco_01", "Citi Hoppa", "Kikuyu Town"),
    ("route_23", "sacco_02", "KBS", "Westlands"),
    ("route_58", "sacco_03", "Double M", "Kawangware"),
    ("route_111", "sacco_04", "Metro Trans", "Rongai"),
    ("route_46", "sacco_05", "Forward Travellers", "Eastleigh"),
];

/// Registered matatus and the route each one runs.
pub const NAIROBI_FLEET: &[(&str, &str)] = &[
    ("KBZ 123A", "route_33"),
    ("KDA 456B", "route_33"),
    ("KCX 789C", "route_23"),
    ("KDF 321D", "route_58"),
    ("KCB 654E", "route_111"),
    ("KDG 987F", "route_46"),
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteRow {
    route_id: String,
    sacco_id: String,
    sacco_name: String,
    terminus: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FleetRow {
    matatu_id: String,
    route_id: String,
}

/// In-memory lookup tables, read-only once built.
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceData {
    routes: HashMap<String, SaccoInfo>,
    fleet: HashMap<String, String>,
}

impl StaticReferenceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nairobi() -> Self {
        let mut data = Self::new();
        for (route, sacco_id, sacco_name, terminus) in NAIROBI_ROUTES {
            data.insert_route(route, SaccoInfo::new(sacco_id, sacco_name, terminus));
        }
        for (matatu, route) in NAIROBI_FLEET {
            data.insert_matatu(matatu, route);
        }
        data
    }

    pub fn insert_route(&mut self, route_id: &str, sacco: SaccoInfo) {
        self.routes.insert(route_id.to_string(), sacco);
    }

    pub fn insert_matatu(&mut self, matatu_id: &str, route_id: &str) {
        self.fleet.insert(matatu_id.to_string(), route_id.to_string());
    }

    /// Loads routes from a CSV with `routeId,saccoId,saccoName,terminus`
    /// columns, replacing any route with the same id.
    pub fn load_routes(&mut self, path: &Path) -> anyhow::Result<usize> {
        let file = File::open(path)?;
        let mut rdr = csv::Reader::from_reader(file);
        let mut count = 0;
        for result in rdr.deserialize() {
            let row: RouteRow = result?;
            self.insert_route(
                &row.route_id,
                SaccoInfo::new(&row.sacco_id, &row.sacco_name, &row.terminus),
            );
            count += 1;
        }
        info!(path = %path.display(), routes = count, "Loaded route reference data");
        Ok(count)
    }

    /// Loads the fleet from a CSV with `matatuId,routeId` columns.
    pub fn load_fleet(&mut self, path: &Path) -> anyhow::Result<usize> {
        let file = File::open(path)?;
        let mut rdr = csv::Reader::from_reader(file);
        let mut count = 0;
        for result in rdr.deserialize() {
            let row: FleetRow = result?;
            self.insert_matatu(&row.matatu_id, &row.route_id);
            count += 1;
        }
        info!(path = %path.display(), matatus = count, "Loaded fleet reference data");
        Ok(count)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn fleet_size(&self) -> usize {
        self.fleet.len()
    }
}

impl ReferenceData for StaticReferenceData {
    fn lookup_route(&self, route_id: &str) -> Option<SaccoInfo> {
        self.routes.get(route_id).cloned()
    }

    fn route_of(&self, matatu_id: &str) -> Option<String> {
        self.fleet.get(matatu_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_nairobi_lookup() {
        let data = StaticReferenceData::nairobi();
        let sacco = data.lookup_route("route_111").unwrap();
        assert_eq!(sacco.sacco_name, "Metro Trans");
        assert_eq!(sacco.terminus, "Rongai");
        assert_eq!(data.lookup_route("route_999"), None);
    }

    #[test]
    fn test_sacco_of_matatu_goes_through_route() {
        let data = StaticReferenceData::nairobi();
        assert_eq!(data.sacco_of_matatu("KCX 789C").unwrap().sacco_id, "sacco_02");
        assert_eq!(data.sacco_of_matatu("KZZ 000Z"), None);
    }

    #[test]
    fn test_load_from_csv() {
        let mut routes = tempfile::NamedTempFile::new().unwrap();
        writeln!(routes, "routeId,saccoId,saccoName,terminus").unwrap();
        writeln!(routes, "route_9,sacco_09,Super Metro,Kitengela").unwrap();
        let mut fleet = tempfile::NamedTempFile::new().unwrap();
        writeln!(fleet, "matatuId,routeId").unwrap();
        writeln!(fleet, "KAA 001A,route_9").unwrap();

        let mut data = StaticReferenceData::new();
        assert_eq!(data.load_routes(routes.path()).unwrap(), 1);
        assert_eq!(data.load_fleet(fleet.path()).unwrap(), 1);
        assert_eq!(
            data.sacco_of_matatu("KAA 001A").unwrap().sacco_name,
            "Super Metro"
        );
    }
}
