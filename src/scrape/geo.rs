//! Postal-code gazetteer and great-circle distance for the radius filter.
//!
//! The embedded table covers German cities at the postal-code level; a
//! larger dataset can be swapped in via `PostalGazetteer::from_csv`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

const EMBEDDED_GAZETTEER: &str = include_str!("gazetteer_de.csv");

static POSTAL_CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{5}\b").expect("static regex"));

pub type Coordinates = (f64, f64);

/// Lookup table from German postal codes and city names to coordinates.
#[derive(Debug)]
pub struct PostalGazetteer {
    by_postal_code: HashMap<String, Coordinates>,
    by_city: HashMap<String, Coordinates>,
}

impl Default for PostalGazetteer {
    fn default() -> Self {
        Self::from_csv(EMBEDDED_GAZETTEER)
    }
}

impl PostalGazetteer {
    /// Parse `plz,city,lat,lon` rows; malformed rows are skipped with a log.
    pub fn from_csv(csv: &str) -> Self {
        let mut by_postal_code = HashMap::new();
        let mut by_city = HashMap::new();

        for line in csv.lines().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 4 {
                warn!(line, "Skipping malformed gazetteer row");
                continue;
            }
            let (Ok(lat), Ok(lon)) = (fields[2].parse::<f64>(), fields[3].parse::<f64>()) else {
                warn!(line, "Skipping gazetteer row with bad coordinates");
                continue;
            };
            by_postal_code.insert(fields[0].to_string(), (lat, lon));
            by_city.insert(fields[1].to_lowercase(), (lat, lon));
        }

        Self {
            by_postal_code,
            by_city,
        }
    }

    pub fn postal_coords(&self, postal_code: &str) -> Option<Coordinates> {
        self.by_postal_code.get(postal_code.trim()).copied()
    }

    /// Resolve a free-text location: an embedded postal code wins, then an
    /// exact city match, then a city name contained in the text.
    pub fn resolve_location(&self, location: &str) -> Option<Coordinates> {
        let trimmed = location.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(m) = POSTAL_CODE_PATTERN.find(trimmed)
            && let Some(coords) = self.postal_coords(m.as_str())
        {
            return Some(coords);
        }

        let lower = trimmed.to_lowercase();
        if let Some(coords) = self.by_city.get(&lower) {
            return Some(*coords);
        }

        self.by_city
            .iter()
            .find(|(city, _)| lower.contains(city.as_str()))
            .map(|(_, coords)| *coords)
    }
}

/// Great-circle distance between two points in kilometres.
pub fn haversine_km(origin: Coordinates, destination: Coordinates) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let (lat1, lon1) = origin;
    let (lat2, lon2) = destination;
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Result statistics for the radius post-filter.
#[derive(Debug, Clone, Serialize)]
pub struct RadiusFilterStats {
    pub origin_coordinates: Option<Coordinates>,
    pub radius_km: f64,
    pub kept_count: usize,
    pub excluded_count: usize,
    pub missing_count: usize,
    pub excluded_ids: Vec<String>,
    pub missing_ids: Vec<String>,
}
