//! Time-boxed multi-connection throughput measurement.
//!
//! One coordinator loop owns the phase deadline, the connection ramp and the
//! live progress ticker. Each connection runs as its own task and records
//! its byte counts into a private [`SampleRecorder`]; recorders are merged
//! only once the phase is over.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::reduce::to_mbps;
use super::transport::{ByteStream, Connector};
use super::{Phase, Sample, Server};
use crate::error::{ConnectionError, EngineError};
use crate::report::EventSink;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick: Duration,
    pub ramp_up: Duration,
    pub initial_connections: usize,
    pub max_connections: usize,
    pub connection_step: usize,
    pub ramp_interval: Duration,
    pub ramp_growth_threshold: f64,
    pub max_bytes: u64,
    pub cancel_grace: Duration,
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            tick: settings.tick(),
            ramp_up: settings.ramp_up(),
            initial_connections: settings.initial_connections,
            max_connections: settings.max_connections,
            connection_step: settings.connection_step,
            ramp_interval: settings.ramp_interval(),
            ramp_growth_threshold: settings.ramp_growth_threshold,
            max_bytes: settings.max_phase_bytes,
            cancel_grace: settings.cancel_grace(),
        }
    }
}

/// Everything a phase recorded, before reduction.
#[derive(Debug, Clone)]
pub struct PhaseSamples {
    pub phase: Phase,
    pub samples: Vec<Sample>,
    pub elapsed: Duration,
    pub connections_opened: usize,
    pub connections_failed: usize,
}

/// Attributes byte counts of one connection to ticks of the phase timeline.
/// Offsets are measured from phase start and clamped to `limit`, so late
/// chunks land in the final tick.
pub struct SampleRecorder {
    phase: Phase,
    connection: usize,
    tick: Duration,
    ramp_ticks: u64,
    limit: Duration,
    current: u64,
    bytes: u64,
    samples: Vec<Sample>,
    tap: Option<mpsc::UnboundedSender<Sample>>,
}

impl SampleRecorder {
    pub fn new(
        phase: Phase,
        connection: usize,
        config: &EngineConfig,
        limit: Duration,
        opened_at: Duration,
    ) -> Self {
        let tick_nanos = config.tick.as_nanos().max(1);
        let ramp_ticks = config.ramp_up.as_nanos().div_ceil(tick_nanos) as u64;
        let mut recorder = Self {
            phase,
            connection,
            tick: config.tick,
            ramp_ticks,
            limit,
            current: 0,
            bytes: 0,
            samples: Vec::new(),
            tap: None,
        };
        recorder.current = recorder.tick_at(opened_at);
        recorder
    }

    /// Forward every finished sample to `tap` as well.
    pub fn with_tap(mut self, tap: mpsc::UnboundedSender<Sample>) -> Self {
        self.tap = Some(tap);
        self
    }

    fn tick_at(&self, offset: Duration) -> u64 {
        let last = self.limit.saturating_sub(Duration::from_nanos(1));
        (offset.min(last).as_nanos() / self.tick.as_nanos().max(1)) as u64
    }

    fn tick_start(&self, tick: u64) -> Duration {
        Duration::from_nanos((self.tick.as_nanos() as u64).saturating_mul(tick))
    }

    pub fn record(&mut self, offset: Duration, bytes: u64) {
        let tick = self.tick_at(offset);
        if tick > self.current {
            self.flush_until(tick, None);
        }
        self.bytes += bytes;
    }

    /// Closes the open tick at `offset` and hands back the samples.
    pub fn finish(mut self, offset: Duration) -> Vec<Sample> {
        let end = offset.min(self.limit);
        let tick = self.tick_at(end);
        if tick > self.current {
            self.flush_until(tick, None);
        }
        self.flush_until(self.current + 1, Some(end));
        self.samples
    }

    /// Emits the open tick and zero samples for idle ticks before `tick`.
    fn flush_until(&mut self, tick: u64, end: Option<Duration>) {
        while self.current < tick {
            let start = self.tick_start(self.current);
            let mut interval_end = self.tick_start(self.current + 1).min(self.limit);
            if let Some(end) = end {
                interval_end = interval_end.min(end);
            }
            if interval_end > start {
                let sample = Sample {
                    phase: self.phase,
                    connection: self.connection,
                    interval_start: start,
                    interval_end,
                    bytes: self.bytes,
                    ramp_up: self.current < self.ramp_ticks,
                };
                if let Some(tap) = &self.tap {
                    let _ = tap.send(sample.clone());
                }
                self.samples.push(sample);
            }
            self.bytes = 0;
            self.current += 1;
        }
    }
}

/// Connection counts shared by the ramp scheduler and the workers.
#[derive(Debug)]
pub struct ConnectionPool {
    max: usize,
    opened: AtomicUsize,
    live: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            opened: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Claims a connection slot; `None` once the cap is reached.
    pub fn try_open(&self) -> Option<usize> {
        let id = self
            .opened
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Some(id)
    }

    pub fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.opened() >= self.max
    }
}

/// Releases the pool slot however the worker exits.
struct SlotGuard(Arc<ConnectionPool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct WorkerReport {
    connection: usize,
    samples: Vec<Sample>,
    error: Option<ConnectionError>,
}

struct Worker {
    phase: Phase,
    connection: usize,
    server: Server,
    connector: Arc<dyn Connector>,
    recorder: SampleRecorder,
    started: Instant,
    cancel: CancellationToken,
    _slot: SlotGuard,
}

enum Transfer {
    Completed,
    Cancelled,
    Failed(ConnectionError),
}

impl Worker {
    async fn run(mut self) -> WorkerReport {
        let error = loop {
            let stream = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                opened = self.connector.open(self.phase, &self.server) => match opened {
                    Ok(stream) => stream,
                    Err(err) => break Some(err),
                },
            };
            match self.pump(stream).await {
                Transfer::Completed => continue,
                Transfer::Cancelled => break None,
                Transfer::Failed(err) => break Some(err),
            }
        };
        WorkerReport {
            connection: self.connection,
            samples: self.recorder.finish(self.started.elapsed()),
            error,
        }
    }

    async fn pump(&mut self, mut stream: ByteStream) -> Transfer {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Transfer::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(bytes)) => self.recorder.record(self.started.elapsed(), bytes),
                    Some(Err(err)) => return Transfer::Failed(err),
                    None => return Transfer::Completed,
                },
            }
        }
    }
}

/// Bytes per tick as reported by workers so far. Feeds live progress and the
/// ramp decision only; the final result comes from the workers' own samples.
///
/// A worker forwards a tick once its first chunk of the following tick
/// arrives, so only ticks that ended at least one tick ago are complete
/// across all connections.
struct LiveTotals {
    tick: Duration,
    per_tick: BTreeMap<Duration, (u64, Duration)>,
    total: u64,
}

impl LiveTotals {
    fn new(tick: Duration) -> Self {
        Self {
            tick,
            per_tick: BTreeMap::new(),
            total: 0,
        }
    }

    fn add(&mut self, sample: &Sample) {
        let entry = self
            .per_tick
            .entry(sample.interval_start)
            .or_insert((0, sample.interval_end));
        entry.0 += sample.bytes;
        entry.1 = entry.1.max(sample.interval_end);
        self.total += sample.bytes;
    }

    /// End of the newest tick every connection has forwarded at `now`.
    fn settled(&self, now: Duration) -> Duration {
        let elapsed_ticks = (now.as_nanos() / self.tick.as_nanos().max(1)) as u64;
        let nanos = (self.tick.as_nanos() as u64).saturating_mul(elapsed_ticks.saturating_sub(1));
        Duration::from_nanos(nanos)
    }

    fn latest_mbps(&self, now: Duration) -> Option<f64> {
        self.per_tick
            .range(..self.settled(now))
            .next_back()
            .map(|(start, (bytes, end))| to_mbps(*bytes, end.saturating_sub(*start)))
    }

    /// Aggregate rate of the ticks starting in `[from, to)`.
    fn window_mbps(&self, from: Duration, to: Duration) -> f64 {
        if to <= from {
            return 0.0;
        }
        let bytes: u64 = self.per_tick.range(from..to).map(|(_, (bytes, _))| bytes).sum();
        to_mbps(bytes, to - from)
    }
}

enum Stop {
    Deadline,
    ByteCap,
    AllFailed,
    Cancelled,
}

pub struct ThroughputEngine {
    connector: Arc<dyn Connector>,
    config: EngineConfig,
}

impl ThroughputEngine {
    pub fn new(connector: Arc<dyn Connector>, config: EngineConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one phase against `server` for at most `budget`.
    pub async fn measure(
        &self,
        phase: Phase,
        server: &Server,
        budget: Duration,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<PhaseSamples, EngineError> {
        let config = &self.config;
        info!("Starting {phase} phase against {} for {:?}", server.host, budget);

        let started = Instant::now();
        let phase_cancel = cancel.child_token();
        let pool = Arc::new(ConnectionPool::new(config.max_connections));
        let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        let spawn = |workers: &mut JoinSet<WorkerReport>| {
            let Some(connection) = pool.try_open() else {
                return false;
            };
            let worker = Worker {
                phase,
                connection,
                server: server.clone(),
                connector: Arc::clone(&self.connector),
                recorder: SampleRecorder::new(phase, connection, config, budget, started.elapsed())
                    .with_tap(tap_tx.clone()),
                started,
                cancel: phase_cancel.clone(),
                _slot: SlotGuard(Arc::clone(&pool)),
            };
            workers.spawn(worker.run());
            true
        };
        for _ in 0..config.initial_connections {
            spawn(&mut workers);
        }

        let deadline = tokio::time::sleep_until(started + budget);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(started + config.tick, config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ramp = tokio::time::interval_at(started + config.ramp_interval, config.ramp_interval);
        ramp.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut live = LiveTotals::new(config.tick);
        let mut ramping = config.connection_step > 0;
        let mut window_start = Duration::ZERO;
        let mut last_rate: Option<f64> = None;
        let mut samples = Vec::new();
        let mut failed = 0usize;

        let stop = loop {
            tokio::select! {
                _ = &mut deadline => break Stop::Deadline,
                _ = cancel.cancelled() => break Stop::Cancelled,
                Some(sample) = tap_rx.recv() => {
                    live.add(&sample);
                    if live.total >= config.max_bytes {
                        break Stop::ByteCap;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(mbps) = live.latest_mbps(started.elapsed()) {
                        events.partial(phase, mbps);
                    }
                }
                _ = ramp.tick(), if ramping => {
                    let window_end = live.settled(started.elapsed());
                    let rate = live.window_mbps(window_start, window_end);
                    let growing = match last_rate {
                        None => rate > 0.0,
                        Some(previous) => rate > previous * (1.0 + config.ramp_growth_threshold),
                    };
                    window_start = window_end;
                    last_rate = Some(rate);
                    if growing && !pool.is_full() {
                        let mut added = 0;
                        while added < config.connection_step && spawn(&mut workers) {
                            added += 1;
                        }
                        debug!("{phase}: {rate:.1} Mbps, added {added} connections ({} live)", pool.live());
                    } else {
                        debug!("{phase}: holding at {} connections ({rate:.1} Mbps)", pool.live());
                        ramping = false;
                    }
                }
                joined = workers.join_next(), if !workers.is_empty() => {
                    if let Some(joined) = joined {
                        failed += collect(joined, &mut samples, phase);
                    }
                    if workers.is_empty() {
                        break Stop::AllFailed;
                    }
                }
            }
        };

        phase_cancel.cancel();
        let drained = tokio::time::timeout(
            config.cancel_grace,
            drain(&mut workers, &mut samples, phase),
        )
        .await;
        match drained {
            Ok(n) => failed += n,
            Err(_) => {
                warn!("{phase}: {} connections ignored cancellation, aborting", workers.len());
                workers.abort_all();
            }
        }
        let elapsed = started.elapsed().min(budget);
        let opened = pool.opened();

        match stop {
            Stop::Cancelled => return Err(EngineError::Cancelled),
            Stop::AllFailed => {
                warn!("{phase}: all {opened} connections failed");
                return Err(EngineError::PhaseUnreachable { phase });
            }
            Stop::ByteCap => info!("{phase}: byte cap reached after {:?}", elapsed),
            Stop::Deadline => debug!("{phase}: deadline reached"),
        }

        samples.sort_by_key(|s: &Sample| (s.interval_start, s.connection));
        info!(
            "{phase} phase done: {} samples from {opened} connections ({failed} dropped)",
            samples.len()
        );
        Ok(PhaseSamples {
            phase,
            samples,
            elapsed,
            connections_opened: opened,
            connections_failed: failed,
        })
    }
}

/// Merges one finished worker; returns 1 if it ended in failure.
fn collect(
    joined: Result<WorkerReport, tokio::task::JoinError>,
    samples: &mut Vec<Sample>,
    phase: Phase,
) -> usize {
    match joined {
        Ok(report) => {
            samples.extend(report.samples);
            match report.error {
                Some(err) => {
                    warn!("{phase} connection {} dropped: {err}", report.connection);
                    1
                }
                None => 0,
            }
        }
        Err(err) => {
            warn!("{phase} connection task ended abnormally: {err}");
            1
        }
    }
}

async fn drain(workers: &mut JoinSet<WorkerReport>, samples: &mut Vec<Sample>, phase: Phase) -> usize {
    let mut failed = 0;
    while let Some(joined) = workers.join_next().await {
        failed += collect(joined, samples, phase);
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ProgressEvent;
    use async_trait::async_trait;

    fn config() -> EngineConfig {
        EngineConfig {
            tick: Duration::from_millis(100),
            ramp_up: Duration::from_millis(200),
            initial_connections: 2,
            max_connections: 2,
            connection_step: 0,
            ramp_interval: Duration::from_millis(400),
            ramp_growth_threshold: 0.05,
            max_bytes: u64::MAX,
            cancel_grace: Duration::from_millis(200),
        }
    }

    fn server() -> Server {
        Server::new("mock", "mock.test", "http://mock.test")
    }

    /// Yields `chunk` bytes every `every`, forever.
    fn steady(chunk: u64, every: Duration) -> ByteStream {
        futures::stream::unfold((), move |_| async move {
            tokio::time::sleep(every).await;
            Some((Ok(chunk), ()))
        })
        .boxed()
    }

    /// The first `failures` opens are refused, the rest stream steadily.
    struct FlakyConnector {
        failures: usize,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn open(&self, _phase: Phase, _server: &Server) -> Result<ByteStream, ConnectionError> {
            if self.opens.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ConnectionError::Dropped("connection refused".into()));
            }
            Ok(steady(10_000, Duration::from_millis(10)))
        }
    }

    /// Accepts connections that never deliver a byte.
    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn open(&self, _phase: Phase, _server: &Server) -> Result<ByteStream, ConnectionError> {
            Ok(futures::stream::pending().boxed())
        }
    }

    /// Every stream delivers one chunk and then completes, so workers keep
    /// reopening.
    struct ShortBodyConnector {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Connector for ShortBodyConnector {
        async fn open(&self, _phase: Phase, _server: &Server) -> Result<ByteStream, ConnectionError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(futures::stream::iter([Ok(1_000)]).boxed())
        }
    }

    /// Every stream draws from one shared send schedule, so the aggregate
    /// rate stays the same however many connections are open.
    struct CappedConnector {
        chunk: u64,
        slot: Duration,
        next: Arc<std::sync::Mutex<Option<Instant>>>,
    }

    impl CappedConnector {
        fn new(chunk: u64, slot: Duration) -> Self {
            Self {
                chunk,
                slot,
                next: Arc::new(std::sync::Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl Connector for CappedConnector {
        async fn open(&self, _phase: Phase, _server: &Server) -> Result<ByteStream, ConnectionError> {
            let (chunk, slot, next) = (self.chunk, self.slot, Arc::clone(&self.next));
            Ok(futures::stream::unfold((), move |_| {
                let next = Arc::clone(&next);
                async move {
                    let at = {
                        let mut next = next.lock().unwrap();
                        let now = Instant::now();
                        let at = next.map_or(now, |n| n.max(now));
                        *next = Some(at + slot);
                        at
                    };
                    tokio::time::sleep_until(at).await;
                    Some((Ok(chunk), ()))
                }
            })
            .boxed())
        }
    }

    fn engine(connector: impl Connector + 'static, config: EngineConfig) -> ThroughputEngine {
        ThroughputEngine::new(Arc::new(connector), config)
    }

    #[test]
    fn recorder_fills_idle_ticks_and_clamps_late_bytes() {
        let mut config = config();
        config.ramp_up = Duration::from_millis(100);
        let limit = Duration::from_millis(500);
        let mut recorder = SampleRecorder::new(Phase::Upload, 3, &config, limit, Duration::from_millis(50));
        recorder.record(Duration::from_millis(60), 10);
        recorder.record(Duration::from_millis(320), 20);
        // After the deadline: belongs to the last tick.
        recorder.record(Duration::from_millis(530), 5);
        let samples = recorder.finish(Duration::from_millis(540));

        let summary: Vec<(u64, u64, u64, bool)> = samples
            .iter()
            .map(|s| {
                (
                    s.interval_start.as_millis() as u64,
                    s.interval_end.as_millis() as u64,
                    s.bytes,
                    s.ramp_up,
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, 100, 10, true),
                (100, 200, 0, false),
                (200, 300, 0, false),
                (300, 400, 20, false),
                (400, 500, 5, false),
            ]
        );
        assert!(samples.iter().all(|s| s.connection == 3 && s.phase == Phase::Upload));
    }

    #[test]
    fn recorder_cuts_final_tick_at_stop() {
        let config = config();
        let mut recorder =
            SampleRecorder::new(Phase::Download, 0, &config, Duration::from_secs(1), Duration::ZERO);
        recorder.record(Duration::from_millis(130), 7);
        let samples = recorder.finish(Duration::from_millis(150));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].interval_start, Duration::from_millis(100));
        assert_eq!(samples[1].interval_end, Duration::from_millis(150));
        assert_eq!(samples[1].bytes, 7);
    }

    #[test]
    fn pool_caps_connections() {
        let pool = ConnectionPool::new(2);
        assert_eq!(pool.try_open(), Some(0));
        assert_eq!(pool.try_open(), Some(1));
        assert_eq!(pool.try_open(), None);
        assert!(pool.is_full());
        pool.release();
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.opened(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn survives_partial_connection_failure() {
        let mut config = config();
        config.initial_connections = 4;
        config.max_connections = 4;
        let engine = engine(
            FlakyConnector {
                failures: 3,
                opens: AtomicUsize::new(0),
            },
            config,
        );
        let result = engine
            .measure(
                Phase::Download,
                &server(),
                Duration::from_secs(1),
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.connections_opened, 4);
        assert_eq!(result.connections_failed, 3);
        let carrying: std::collections::BTreeSet<usize> = result
            .samples
            .iter()
            .filter(|s| s.bytes > 0)
            .map(|s| s.connection)
            .collect();
        assert_eq!(carrying.len(), 1, "only the surviving connection moves bytes");
        assert!(result.samples.iter().map(|s| s.bytes).sum::<u64>() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn total_failure_is_phase_unreachable() {
        let mut config = config();
        config.initial_connections = 4;
        config.max_connections = 4;
        let engine = engine(
            FlakyConnector {
                failures: usize::MAX,
                opens: AtomicUsize::new(0),
            },
            config,
        );
        let started = std::time::Instant::now();
        let err = engine
            .measure(
                Phase::Upload,
                &server(),
                Duration::from_secs(5),
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PhaseUnreachable { phase: Phase::Upload }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_sources_stop_at_deadline() {
        let engine = engine(StalledConnector, config());
        let budget = Duration::from_secs(2);
        let started = std::time::Instant::now();
        let result = engine
            .measure(
                Phase::Download,
                &server(),
                budget,
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < budget + Duration::from_millis(200));
        assert!(result.samples.iter().all(|s| s.bytes == 0));
        assert_eq!(result.elapsed, budget);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_transfers_reopen_on_the_same_slot() {
        let connector = Arc::new(ShortBodyConnector {
            opens: AtomicUsize::new(0),
        });
        let engine = ThroughputEngine::new(connector.clone(), config());
        let result = engine
            .measure(
                Phase::Download,
                &server(),
                Duration::from_millis(500),
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.connections_opened, 2);
        assert_eq!(result.connections_failed, 0);
        assert!(connector.opens.load(Ordering::SeqCst) > 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ramp_adds_connections_while_throughput_grows() {
        let mut config = config();
        config.initial_connections = 1;
        config.max_connections = 3;
        config.connection_step = 1;
        config.ramp_interval = Duration::from_millis(300);
        let engine = engine(
            FlakyConnector {
                failures: 0,
                opens: AtomicUsize::new(0),
            },
            config,
        );
        let result = engine
            .measure(
                Phase::Download,
                &server(),
                Duration::from_millis(1500),
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.connections_opened >= 2, "opened {}", result.connections_opened);
        assert!(result.connections_opened <= 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn byte_cap_ends_phase_early() {
        let mut config = config();
        config.max_bytes = 200_000;
        let engine = engine(
            FlakyConnector {
                failures: 0,
                opens: AtomicUsize::new(0),
            },
            config,
        );
        let started = std::time::Instant::now();
        let result = engine
            .measure(
                Phase::Download,
                &server(),
                Duration::from_secs(5),
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.elapsed < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_stops_the_phase() {
        let engine = engine(StalledConnector, config());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = engine
            .measure(
                Phase::Download,
                &server(),
                Duration::from_secs(10),
                &EventSink::discard(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn emits_live_speed_per_tick() {
        let (tx, mut rx) = mpsc::channel(64);
        let engine = engine(
            FlakyConnector {
                failures: 0,
                opens: AtomicUsize::new(0),
            },
            config(),
        );
        engine
            .measure(
                Phase::Upload,
                &server(),
                Duration::from_millis(600),
                &EventSink::new(tx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let mut partials = 0;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::PartialSpeed { phase, mbps } = event {
                assert_eq!(phase, Phase::Upload);
                assert!(mbps >= 0.0);
                partials += 1;
            }
        }
        assert!(partials >= 2, "got {partials} partial updates");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ramp_stops_once_throughput_stops_growing() {
        let mut config = config();
        config.initial_connections = 2;
        config.max_connections = 8;
        config.connection_step = 2;
        config.ramp_interval = Duration::from_millis(500);
        // 5 kB every 5 ms across all connections: 8 Mbps no matter what.
        let engine = engine(CappedConnector::new(5_000, Duration::from_millis(5)), config);
        let result = engine
            .measure(
                Phase::Download,
                &server(),
                Duration::from_millis(1_200),
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // One step after the first window, none after the flat second one.
        assert_eq!(result.connections_opened, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_speed_counts_every_connection() {
        let mut config = config();
        config.initial_connections = 4;
        config.max_connections = 4;
        let (tx, mut rx) = mpsc::channel(64);
        let engine = engine(
            FlakyConnector {
                failures: 0,
                opens: AtomicUsize::new(0),
            },
            config,
        );
        let result = engine
            .measure(
                Phase::Download,
                &server(),
                Duration::from_millis(1_500),
                &EventSink::new(tx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let reduced = super::super::reduce::reduce(&result, &Default::default())
            .unwrap()
            .mbps;

        let mut partials = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::PartialSpeed { mbps, .. } = event {
                partials.push(mbps);
            }
        }
        assert!(partials.len() >= 5, "got {partials:?}");
        assert!(
            partials.iter().all(|&mbps| mbps > reduced * 0.75),
            "partials {partials:?} against reduced {reduced:.1}"
        );
    }
}
