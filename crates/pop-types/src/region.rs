use serde::{Deserialize, Serialize};
use std::fmt;

/// Subnetwork code bucketing peers by geographic or logical area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionCode(pub u64);

pub const GLOBAL_REGION: RegionCode = RegionCode(0);
pub const ASIA_REGION: RegionCode = RegionCode(1);
pub const AFRICA_REGION: RegionCode = RegionCode(2);
pub const SOUTH_AMERICA_REGION: RegionCode = RegionCode(3);
pub const NORTH_AMERICA_REGION: RegionCode = RegionCode(4);
pub const EUROPE_REGION: RegionCode = RegionCode(5);
pub const OCEANIA_REGION: RegionCode = RegionCode(6);
/// User-defined region.
pub const CUSTOM_REGION: RegionCode = RegionCode(u64::MAX);

/// A CDN subnetwork. Two regions are the same region iff their codes match;
/// the name is carried for display and the lookup table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub code: RegionCode,
}

impl Region {
    pub fn new(name: impl Into<String>, code: RegionCode) -> Self {
        Self {
            name: name.into(),
            code,
        }
    }

    /// Look up one of the well-known regions by its canonical spelling.
    pub fn from_name(name: &str) -> Option<Region> {
        let code = match name {
            "Global" => GLOBAL_REGION,
            "Asia" => ASIA_REGION,
            "Africa" => AFRICA_REGION,
            "SouthAmerica" => SOUTH_AMERICA_REGION,
            "NorthAmerica" => NORTH_AMERICA_REGION,
            "Europe" => EUROPE_REGION,
            "Oceania" => OCEANIA_REGION,
            _ => return None,
        };
        Some(Region::new(name, code))
    }

    /// Convert a list of region names into regions, skipping unknown names.
    pub fn parse_names(names: &[String]) -> Vec<Region> {
        names
            .iter()
            .filter_map(|n| Region::from_name(n))
            .collect()
    }

    /// Whether any region in `ours` matches any region in `theirs`.
    pub fn intersects(ours: &[Region], theirs: &[Region]) -> bool {
        ours.iter()
            .any(|a| theirs.iter().any(|b| a.code == b.code))
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Region {}

impl std::hash::Hash for Region {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.code.hash(state);
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.code.0)
    }
}
