use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::report::{EventSink, PartialResult, ProgressEvent, RunFailure, Stage, TestResult};
use crate::settings::{SamplesPolicy, Settings};
use crate::speedtest::catalog::load_servers;
use crate::speedtest::engine::EngineConfig;
use crate::speedtest::ping::{select_best_server, HttpProbe, ProbeConfig};
use crate::speedtest::reduce::{reduce, reduce_degraded, ReduceConfig};
use crate::speedtest::transport::HttpConnector;
use crate::speedtest::{
    Connector, Phase, PhaseResult, PhaseSamples, Probe, Server, ThroughputEngine,
};

const EVENT_BUFFER: usize = 64;

/// A complete test: catalog, server selection, download and upload.
pub struct SpeedTest {
    settings: Settings,
    client: reqwest::Client,
    probe: Arc<dyn Probe>,
    engine: ThroughputEngine,
    cancel: CancellationToken,
}

impl SpeedTest {
    /// Validates `settings` and builds the HTTP transport.
    pub fn new(settings: Settings) -> Result<Self, EngineError> {
        settings.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .user_agent(settings.user_agent.clone())
            .build()?;
        let connector = HttpConnector::new(&settings)?;
        Ok(Self {
            probe: Arc::new(HttpProbe::new(client.clone())),
            engine: ThroughputEngine::new(Arc::new(connector), EngineConfig::from(&settings)),
            client,
            settings,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.engine = ThroughputEngine::new(connector, EngineConfig::from(&self.settings));
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Cancelling this token stops the run at its next suspension point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the test in the current task, reporting progress to `events`.
    pub async fn run(&self, events: &EventSink) -> Result<TestResult, RunFailure> {
        let mut partial = PartialResult::default();
        match self.execute(events, &mut partial).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!("Speed test failed: {err}");
                events.error(&err).await;
                Err(RunFailure::new(err, partial))
            }
        }
    }

    /// Runs the test on a background task.
    pub fn spawn(self) -> TestRun {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let events = EventSink::new(tx);
            self.run(&events).await
        });
        TestRun {
            events: rx,
            cancel,
            handle,
        }
    }

    async fn execute(
        &self,
        events: &EventSink,
        partial: &mut PartialResult,
    ) -> Result<TestResult, EngineError> {
        events.stage(Stage::LoadingServers).await;
        let servers = cancellable(&self.cancel, load_servers(&self.settings, &self.client)).await?;

        events.stage(Stage::SelectingServer).await;
        let config = ProbeConfig::from(&self.settings);
        let server = cancellable(
            &self.cancel,
            select_best_server(&servers, self.probe.as_ref(), &config),
        )
        .await?;
        let ping_ms = server.latency_ms.unwrap_or_default();
        partial.server = Some(server.clone());
        partial.ping_ms = Some(ping_ms);

        events.stage(Stage::Download).await;
        let download = self.measure_phase(Phase::Download, &server, events).await?;
        partial.download = Some(download.clone());

        events.stage(Stage::Upload).await;
        let upload = self.measure_phase(Phase::Upload, &server, events).await?;
        partial.upload = Some(upload.clone());

        events.stage(Stage::Complete).await;
        info!(
            "Test complete: ping {:.1} ms, down {:.2} Mbps, up {:.2} Mbps",
            ping_ms, download.mbps, upload.mbps
        );
        Ok(TestResult {
            server,
            ping_ms,
            download,
            upload,
            completed_at: Utc::now(),
        })
    }

    async fn measure_phase(
        &self,
        phase: Phase,
        server: &Server,
        events: &EventSink,
    ) -> Result<PhaseResult, EngineError> {
        let samples = self
            .engine
            .measure(phase, server, self.settings.phase_duration(), events, &self.cancel)
            .await?;
        let result = self.reduce(&samples)?;
        events.phase_done(&result).await;
        Ok(result)
    }

    fn reduce(&self, samples: &PhaseSamples) -> Result<PhaseResult, EngineError> {
        match reduce(samples, &ReduceConfig::from(&self.settings)) {
            Err(err @ EngineError::InsufficientSamples { .. })
                if self.settings.insufficient_samples == SamplesPolicy::Degrade =>
            {
                warn!("{err}; reporting a degraded result");
                Ok(reduce_degraded(samples))
            }
            other => other,
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = work => result,
    }
}

/// Handle to a test running in the background. Polled as a stream it yields
/// progress events until the run ends.
pub struct TestRun {
    events: mpsc::Receiver<ProgressEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<TestResult, RunFailure>>,
}

impl TestRun {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the outcome. Events not yet consumed are discarded.
    pub async fn finish(self) -> Result<TestResult, RunFailure> {
        let TestRun { events, handle, .. } = self;
        drop(events);
        match handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(RunFailure::new(EngineError::Cancelled, PartialResult::default())),
        }
    }
}

impl Stream for TestRun {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
