use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::speedtest::{Location, Server};

const ENV_PREFIX: &str = "LINKSPEED_";

/// What to do when a phase yields too few intervals for a trimmed mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplesPolicy {
    #[default]
    Fail,
    Degrade,
}

impl FromStr for SamplesPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(SamplesPolicy::Fail),
            "degrade" => Ok(SamplesPolicy::Degrade),
            _ => Err(()),
        }
    }
}

/// Engine configuration. Every field has a default, so a TOML file only needs
/// the keys it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Remote JSON catalog. When unset, `static_servers` are used directly.
    pub server_list_url: Option<String>,
    /// Servers used without a fetch, or as fallback when the fetch fails.
    pub static_servers: Vec<Server>,
    /// Client position used to compute `distance_km` for catalog entries
    /// that only carry coordinates.
    pub client_location: Option<Location>,
    pub max_candidates: usize,
    pub probe_count: usize,
    pub probe_timeout_ms: u64,
    pub probe_concurrency: usize,

    pub phase_duration_ms: u64,
    pub tick_ms: u64,
    pub ramp_up_ms: u64,
    pub initial_connections: usize,
    pub max_connections: usize,
    pub connection_step: usize,
    pub ramp_interval_ms: u64,
    /// Minimum relative growth of aggregate throughput between ramp windows
    /// for more connections to be added.
    pub ramp_growth_threshold: f64,
    pub max_phase_bytes: u64,
    pub cancel_grace_ms: u64,

    pub trim_fraction: f64,
    pub min_buckets: usize,
    pub insufficient_samples: SamplesPolicy,

    /// Body size requested per download request. Connections re-request
    /// when a body completes before the deadline.
    pub download_request_bytes: u64,
    pub upload_request_bytes: u64,
    pub upload_chunk_bytes: usize,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_list_url: None,
            static_servers: vec![Server::new(
                "cloudflare",
                "speed.cloudflare.com",
                "https://speed.cloudflare.com",
            )],
            client_location: None,
            max_candidates: 5,
            probe_count: 3,
            probe_timeout_ms: 2_000,
            probe_concurrency: 4,
            phase_duration_ms: 10_000,
            tick_ms: 500,
            ramp_up_ms: 1_000,
            initial_connections: 2,
            max_connections: 8,
            connection_step: 2,
            ramp_interval_ms: 2_000,
            ramp_growth_threshold: 0.05,
            max_phase_bytes: 2_500_000_000,
            cancel_grace_ms: 200,
            trim_fraction: 0.1,
            min_buckets: 3,
            insufficient_samples: SamplesPolicy::Fail,
            download_request_bytes: 100_000_000,
            upload_request_bytes: 25_000_000,
            upload_chunk_bytes: 64 * 1024,
            connect_timeout_ms: 10_000,
            user_agent: concat!("linkspeed/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies `LINKSPEED_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|key| dotenvy::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Applies overrides from `lookup`, keyed by the upper-case field name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SERVER_LIST_URL") {
            self.server_list_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        override_parsed(&lookup, "MAX_CANDIDATES", &mut self.max_candidates)?;
        override_parsed(&lookup, "PROBE_COUNT", &mut self.probe_count)?;
        override_parsed(&lookup, "PROBE_TIMEOUT_MS", &mut self.probe_timeout_ms)?;
        override_parsed(&lookup, "PROBE_CONCURRENCY", &mut self.probe_concurrency)?;
        override_parsed(&lookup, "PHASE_DURATION_MS", &mut self.phase_duration_ms)?;
        override_parsed(&lookup, "TICK_MS", &mut self.tick_ms)?;
        override_parsed(&lookup, "RAMP_UP_MS", &mut self.ramp_up_ms)?;
        override_parsed(&lookup, "INITIAL_CONNECTIONS", &mut self.initial_connections)?;
        override_parsed(&lookup, "MAX_CONNECTIONS", &mut self.max_connections)?;
        override_parsed(&lookup, "CONNECTION_STEP", &mut self.connection_step)?;
        override_parsed(&lookup, "RAMP_INTERVAL_MS", &mut self.ramp_interval_ms)?;
        override_parsed(&lookup, "RAMP_GROWTH_THRESHOLD", &mut self.ramp_growth_threshold)?;
        override_parsed(&lookup, "MAX_PHASE_BYTES", &mut self.max_phase_bytes)?;
        override_parsed(&lookup, "CANCEL_GRACE_MS", &mut self.cancel_grace_ms)?;
        override_parsed(&lookup, "TRIM_FRACTION", &mut self.trim_fraction)?;
        override_parsed(&lookup, "MIN_BUCKETS", &mut self.min_buckets)?;
        override_parsed(&lookup, "DOWNLOAD_REQUEST_BYTES", &mut self.download_request_bytes)?;
        override_parsed(&lookup, "UPLOAD_REQUEST_BYTES", &mut self.upload_request_bytes)?;
        override_parsed(&lookup, "UPLOAD_CHUNK_BYTES", &mut self.upload_chunk_bytes)?;
        override_parsed(&lookup, "CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms)?;
        if let Some(agent) = lookup("USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(value) = lookup("INSUFFICIENT_SAMPLES") {
            self.insufficient_samples = value.parse().map_err(|_| SettingsError::Env {
                key: format!("{ENV_PREFIX}INSUFFICIENT_SAMPLES"),
                value,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: &str| Err(SettingsError::Invalid(msg.to_string()));
        if self.tick_ms == 0 {
            return invalid("tick_ms must be greater than zero");
        }
        if self.phase_duration_ms < self.tick_ms {
            return invalid("phase_duration_ms must cover at least one tick");
        }
        if self.ramp_up_ms >= self.phase_duration_ms {
            return invalid("ramp_up_ms must be shorter than phase_duration_ms");
        }
        if self.initial_connections == 0 || self.max_connections < self.initial_connections {
            return invalid("need 0 < initial_connections <= max_connections");
        }
        if self.ramp_interval_ms == 0 {
            return invalid("ramp_interval_ms must be greater than zero");
        }
        if self.probe_count == 0 || self.max_candidates == 0 || self.probe_concurrency == 0 {
            return invalid("probe_count, max_candidates and probe_concurrency must be positive");
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return invalid("trim_fraction must be in [0, 0.5)");
        }
        if self.min_buckets == 0 {
            return invalid("min_buckets must be positive");
        }
        if self.upload_chunk_bytes == 0 || self.upload_request_bytes == 0 {
            return invalid("upload sizes must be positive");
        }
        Ok(())
    }

    pub fn phase_duration(&self) -> Duration {
        Duration::from_millis(self.phase_duration_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn ramp_up(&self) -> Duration {
        Duration::from_millis(self.ramp_up_ms)
    }

    pub fn ramp_interval(&self) -> Duration {
        Duration::from_millis(self.ramp_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| SettingsError::Env {
            key: format!("{ENV_PREFIX}{key}"),
            value,
        })?;
    }
    Ok(())
}
