//! Station catalogue
//!
//! Pure in-memory lookup structure loaded once at process start from
//! `data/stations.json`. Providers consult it read-only for alias
//! normalisation, the Vienna membership test (by name or coordinate) and
//! the commuter-belt flag. Station ids are opaque strings; nothing in here
//! parses them.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// One station entry as stored in the catalogue file.
#[derive(Debug, Clone, Deserialize)]
pub struct Station {
    #[serde(deserialize_with = "de_opaque_id")]
    pub bst_id: String,
    #[serde(default)]
    pub bst_code: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub in_vienna: bool,
    #[serde(default)]
    pub pendler: bool,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub vor_ids: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Station ids appear both as short numerics and long HAFAS ids; accept
/// either JSON form and keep the text verbatim.
fn de_opaque_id<'de, D: serde::Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::Num(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

/// Coarse Vienna city boundary ring (lon, lat), used for the coordinate
/// membership test.
const VIENNA_BOUNDARY: &[(f64, f64)] = &[
    (16.181, 48.166),
    (16.230, 48.132),
    (16.330, 48.118),
    (16.450, 48.120),
    (16.548, 48.148),
    (16.577, 48.205),
    (16.547, 48.270),
    (16.480, 48.318),
    (16.390, 48.323),
    (16.290, 48.300),
    (16.215, 48.255),
    (16.185, 48.210),
];

/// Read-only station lookup structure.
pub struct StationCatalogue {
    stations: Vec<Station>,
    /// canonical name/alias -> index into `stations`
    index: HashMap<String, usize>,
}

impl StationCatalogue {
    /// Load the catalogue from a JSON array file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading station catalogue from {}", path.display()))?;
        let stations: Vec<Station> =
            serde_json::from_str(&raw).context("station catalogue is not a JSON array")?;
        Ok(Self::from_stations(stations))
    }

    pub fn from_stations(stations: Vec<Station>) -> Self {
        let mut index = HashMap::new();
        for (i, station) in stations.iter().enumerate() {
            let mut keys = vec![station.name.clone()];
            keys.extend(station.aliases.iter().cloned());
            for key in keys {
                let canon = canonical_name(&key);
                if canon.is_empty() {
                    continue;
                }
                match index.entry(canon) {
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(i);
                    }
                    std::collections::hash_map::Entry::Occupied(e) => {
                        if *e.get() != i {
                            warn!(
                                alias = %key,
                                station = %station.name,
                                kept = %stations[*e.get()].name,
                                "alias collision, later entry ignored"
                            );
                        }
                    }
                }
            }
        }
        Self { stations, index }
    }

    /// An empty catalogue (providers degrade to keyword-only filtering).
    pub fn empty() -> Self {
        Self::from_stations(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    fn lookup(&self, raw: &str) -> Option<&Station> {
        let canon = canonical_name(raw);
        if canon.is_empty() {
            return None;
        }
        self.index.get(&canon).map(|&i| &self.stations[i])
    }

    /// Whether `raw` names a known station at all.
    pub fn is_known(&self, raw: &str) -> bool {
        self.lookup(raw).is_some()
    }

    /// Vienna membership by station name or alias.
    pub fn is_in_vienna(&self, raw: &str) -> bool {
        self.lookup(raw).map(|s| s.in_vienna).unwrap_or(false)
    }

    /// Vienna membership by coordinate (point-in-polygon against the
    /// bundled city boundary).
    pub fn is_in_vienna_coord(&self, lat: f64, lon: f64) -> bool {
        point_in_ring(lon, lat, VIENNA_BOUNDARY)
    }

    /// Commuter-belt flag.
    pub fn is_commuter(&self, raw: &str) -> bool {
        self.lookup(raw).map(|s| s.pendler).unwrap_or(false)
    }

    /// Regional-authority ids for a station name.
    pub fn vor_ids(&self, raw: &str) -> Vec<String> {
        self.lookup(raw)
            .map(|s| s.vor_ids.clone())
            .unwrap_or_default()
    }
}

/// Normalise a raw station name for index lookups: lowercase, fold
/// diacritics, unify the Hauptbahnhof spelling, strip generic station-type
/// suffix words and collapse whitespace.
pub fn canonical_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.to_lowercase().chars() {
        match ch {
            'ä' => out.push('a'),
            'ö' => out.push('o'),
            'ü' => out.push('u'),
            'ß' => out.push_str("ss"),
            'é' | 'è' | 'ê' => out.push('e'),
            'á' | 'à' | 'â' => out.push('a'),
            'í' | 'ì' => out.push('i'),
            'ó' | 'ò' => out.push('o'),
            'ú' | 'ù' => out.push('u'),
            c if c.is_alphanumeric() || c.is_whitespace() => out.push(c),
            '-' | '/' | '.' => out.push(' '),
            _ => {}
        }
    }
    let replaced = out.replace("hauptbahnhof", "hbf");
    let tokens: Vec<&str> = replaced
        .split_whitespace()
        .filter(|t| !matches!(*t, "bahnhof" | "bahnhst" | "bhf" | "bf" | "haltestelle" | "station"))
        .collect();
    tokens.join(" ")
}

/// Ray-casting point-in-polygon test over a (x, y) ring.
fn point_in_ring(x: f64, y: f64, ring: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = ring.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}
