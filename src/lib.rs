//! Internet link speed measurement engine.
//!
//! Selects the lowest-latency measurement server, then runs time-boxed
//! multi-connection download and upload phases against it and reduces the
//! per-tick byte counts into a single Mbps figure per phase. Progress is
//! reported as a stream of [`ProgressEvent`] values so any front-end can
//! render it.

pub mod error;
pub mod report;
pub mod runner;
pub mod settings;
pub mod speedtest;

pub use error::{ConnectionError, EngineError, ErrorKind, SettingsError};
pub use report::{EventSink, PartialResult, ProgressEvent, RunFailure, Stage, TestResult};
pub use runner::{SpeedTest, TestRun};
pub use settings::Settings;
pub use speedtest::{Phase, PhaseResult, Sample, Server};
