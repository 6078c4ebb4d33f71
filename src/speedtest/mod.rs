pub mod catalog;
pub mod download;
pub mod engine;
pub mod ping;
pub mod reduce;
pub mod transport;
pub mod upload;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use engine::{PhaseSamples, ThroughputEngine};
pub use ping::Probe;
pub use transport::{ByteStream, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Download,
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Download => write!(f, "download"),
            Phase::Upload => write!(f, "upload"),
        }
    }
}

/// Geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Location) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// A measurement server. `url` is the base of the `__down`/`__up` endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub host: String,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(skip)]
    pub latency_ms: Option<f64>,
}

impl Server {
    pub fn new(id: impl Into<String>, host: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            url: url.into(),
            name: None,
            country: None,
            lat: None,
            lon: None,
            distance_km: None,
            latency_ms: None,
        }
    }

    pub fn with_distance(mut self, distance_km: f64) -> Self {
        self.distance_km = Some(distance_km);
        self
    }

    pub fn location(&self) -> Option<Location> {
        Some(Location {
            lat: self.lat?,
            lon: self.lon?,
        })
    }

    fn base(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn download_url(&self) -> String {
        format!("{}/__down", self.base())
    }

    pub fn upload_url(&self) -> String {
        format!("{}/__up", self.base())
    }

    pub fn latency_url(&self) -> String {
        format!("{}/__down?bytes=0", self.base())
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.host)?;
        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }
        if let Some(distance) = self.distance_km {
            write!(f, " {distance:.0} km")?;
        }
        Ok(())
    }
}

/// Bytes moved by one connection during one tick of a phase. Interval bounds
/// are offsets from the start of the phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub phase: Phase,
    pub connection: usize,
    pub interval_start: Duration,
    pub interval_end: Duration,
    pub bytes: u64,
    pub ramp_up: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub mbps: f64,
    pub sample_count: usize,
    pub bucket_count: usize,
    pub duration_ms: u64,
    pub degraded: bool,
}
