//! Structured output of a test run: the progress event stream, the final
//! result and the failure value that carries partial results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{EngineError, ErrorKind};
use crate::speedtest::{Phase, PhaseResult, Server};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoadingServers,
    SelectingServer,
    Download,
    Upload,
    Complete,
}

impl Stage {
    pub fn phase(self) -> Option<Phase> {
        match self {
            Stage::Download => Some(Phase::Download),
            Stage::Upload => Some(Phase::Upload),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::LoadingServers => "loading_servers",
            Stage::SelectingServer => "selecting_server",
            Stage::Download => "download",
            Stage::Upload => "upload",
            Stage::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Stage(Stage),
    PartialSpeed {
        phase: Phase,
        mbps: f64,
    },
    Error {
        kind: ErrorKind,
        phase: Option<Phase>,
        message: String,
    },
}

impl ProgressEvent {
    pub fn from_error(err: &EngineError) -> Self {
        ProgressEvent::Error {
            kind: err.kind(),
            phase: err.phase(),
            message: err.to_string(),
        }
    }

    pub fn to_wire(&self) -> WireEvent {
        match self {
            ProgressEvent::Stage(stage) => WireEvent {
                kind: "stage",
                phase: stage.phase(),
                value: None,
                message: Some(stage.name().to_string()),
            },
            ProgressEvent::PartialSpeed { phase, mbps } => WireEvent {
                kind: "partial",
                phase: Some(*phase),
                value: Some(*mbps),
                message: None,
            },
            ProgressEvent::Error {
                kind,
                phase,
                message,
            } => WireEvent {
                kind: "error",
                phase: *phase,
                value: None,
                message: Some(format!("{kind}: {message}")),
            },
        }
    }
}

/// Serialized form of a [`ProgressEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub server: Server,
    pub ping_ms: f64,
    pub download: PhaseResult,
    pub upload: PhaseResult,
    pub completed_at: DateTime<Utc>,
}

impl TestResult {
    pub fn to_report(&self) -> TestReport {
        TestReport {
            server: ServerReport {
                host: self.server.host.clone(),
                distance_km: self.server.distance_km,
            },
            ping_ms: self.ping_ms,
            download_mbps: self.download.mbps,
            upload_mbps: self.upload.mbps,
            timestamp: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    pub server: ServerReport,
    pub ping_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerReport {
    pub host: String,
    pub distance_km: Option<f64>,
}

/// Whatever a run had finished before it failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResult {
    pub server: Option<Server>,
    pub ping_ms: Option<f64>,
    pub download: Option<PhaseResult>,
    pub upload: Option<PhaseResult>,
}

#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: EngineError,
    pub partial: PartialResult,
}

impl RunFailure {
    pub fn new(error: EngineError, partial: PartialResult) -> Self {
        Self { error, partial }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Sending half of the progress stream. A sink without a receiver, or one
/// whose receiver went away, silently discards events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn discard() -> Self {
        Self::default()
    }

    pub async fn stage(&self, stage: Stage) {
        self.send(ProgressEvent::Stage(stage)).await;
    }

    pub async fn error(&self, err: &EngineError) {
        self.send(ProgressEvent::from_error(err)).await;
    }

    /// Live speed updates are best effort: dropped when the consumer lags.
    pub fn partial(&self, phase: Phase, mbps: f64) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(ProgressEvent::PartialSpeed { phase, mbps });
        }
    }

    /// The reduced value of a finished phase. Unlike live updates this one
    /// waits for room in the channel.
    pub async fn phase_done(&self, result: &PhaseResult) {
        self.send(ProgressEvent::PartialSpeed {
            phase: result.phase,
            mbps: result.mbps,
        })
        .await;
    }

    async fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
