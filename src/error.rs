use std::fmt;

use serde::Serialize;

use crate::speedtest::Phase;

/// Fatal outcomes of a test run. Every variant terminates the run it
/// occurred in and is reported through [`crate::RunFailure`].
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("no measurement servers available - {0}")]
    CatalogUnavailable(String),
    #[error("none of the {probed} candidate servers answered a latency probe")]
    NoReachableServer { probed: usize },
    #[error("every {phase} connection failed")]
    PhaseUnreachable { phase: Phase },
    #[error("{phase} produced {buckets} usable intervals, {required} required")]
    InsufficientSamples {
        phase: Phase,
        buckets: usize,
        required: usize,
    },
    #[error("test cancelled")]
    Cancelled,
    #[error("failed to build HTTP client - {0}")]
    Client(#[from] reqwest::Error),
    #[error("{0}")]
    Settings(#[from] SettingsError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::CatalogUnavailable(_) => ErrorKind::CatalogUnavailable,
            EngineError::NoReachableServer { .. } => ErrorKind::NoReachableServer,
            EngineError::PhaseUnreachable { .. } => ErrorKind::PhaseUnreachable,
            EngineError::InsufficientSamples { .. } => ErrorKind::InsufficientSamples,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Client(_) => ErrorKind::Client,
            EngineError::Settings(_) => ErrorKind::Settings,
        }
    }

    /// The phase the error belongs to, if it happened inside one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            EngineError::PhaseUnreachable { phase }
            | EngineError::InsufficientSamples { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CatalogUnavailable,
    NoReachableServer,
    PhaseUnreachable,
    InsufficientSamples,
    Cancelled,
    Client,
    Settings,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CatalogUnavailable => "catalog_unavailable",
            ErrorKind::NoReachableServer => "no_reachable_server",
            ErrorKind::PhaseUnreachable => "phase_unreachable",
            ErrorKind::InsufficientSamples => "insufficient_samples",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Client => "client",
            ErrorKind::Settings => "settings",
        };
        f.write_str(name)
    }
}

/// Failure of a single throughput connection. Recovered inside the engine by
/// dropping the connection.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("HTTP request failed - {0}")]
    Http(#[from] reqwest::Error),
    #[error("connection dropped - {0}")]
    Dropped(String),
}

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings - {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings - {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
    #[error("invalid settings - {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_errors_carry_their_phase() {
        let err = EngineError::PhaseUnreachable {
            phase: Phase::Upload,
        };
        assert_eq!(err.kind(), ErrorKind::PhaseUnreachable);
        assert_eq!(err.phase(), Some(Phase::Upload));
        assert_eq!(err.to_string(), "every upload connection failed");

        let err = EngineError::NoReachableServer { probed: 5 };
        assert_eq!(err.phase(), None);
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InsufficientSamples).unwrap();
        assert_eq!(json, "\"insufficient_samples\"");
        assert_eq!(ErrorKind::InsufficientSamples.to_string(), "insufficient_samples");
    }

    #[test]
    fn settings_errors_map_to_their_own_kind() {
        let err = EngineError::from(SettingsError::Invalid("tick_ms must be greater than zero".into()));
        assert_eq!(err.kind(), ErrorKind::Settings);
        assert_eq!(err.phase(), None);
        assert_eq!(
            err.to_string(),
            "invalid settings - tick_ms must be greater than zero"
        );
        assert_eq!(serde_json::to_string(&err.kind()).unwrap(), "\"settings\"");
    }
}
