use std::cmp::Ordering;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use log::{debug, info};

use super::Server;
use crate::error::{ConnectionError, EngineError};
use crate::settings::Settings;

/// One small request/response exchange with a server.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn round_trip(&self, server: &Server) -> Result<Duration, ConnectionError>;
}

/// Times a zero-byte download, headers and (empty) body included.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn round_trip(&self, server: &Server) -> Result<Duration, ConnectionError> {
        let start = Instant::now();
        let response = self
            .client
            .get(server.latency_url())
            .send()
            .await?
            .error_for_status()?;
        response.bytes().await?;
        Ok(start.elapsed())
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub max_candidates: usize,
    pub probe_count: usize,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl From<&Settings> for ProbeConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_candidates: settings.max_candidates,
            probe_count: settings.probe_count,
            timeout: settings.probe_timeout(),
            concurrency: settings.probe_concurrency,
        }
    }
}

struct Candidate {
    order: usize,
    server: Server,
}

/// Picks the server with the lowest minimum RTT among the nearest
/// `max_candidates`. Ties go to the nearer server, then to catalog order.
pub async fn select_best_server(
    servers: &[Server],
    probe: &dyn Probe,
    config: &ProbeConfig,
) -> Result<Server, EngineError> {
    info!("Finding best server...");
    let mut candidates: Vec<Candidate> = servers
        .iter()
        .cloned()
        .enumerate()
        .map(|(order, server)| Candidate { order, server })
        .collect();
    candidates.sort_by(|a, b| compare_distance(&a.server, &b.server));
    candidates.truncate(config.max_candidates);
    let probed = candidates.len();

    let mut reachable: Vec<(Duration, Candidate)> = stream::iter(candidates)
        .map(|candidate| async move {
            let latency = min_round_trip(probe, &candidate.server, config).await;
            match latency {
                Some(latency) => {
                    debug!("[{}] {}: {:?}", candidate.server.id, candidate.server.host, latency);
                    Some((latency, candidate))
                }
                None => {
                    debug!("[{}] {}: unreachable", candidate.server.id, candidate.server.host);
                    None
                }
            }
        })
        .buffer_unordered(config.concurrency.max(1))
        .filter_map(|result| async move { result })
        .collect()
        .await;

    reachable.sort_by(|(la, a), (lb, b)| {
        la.cmp(lb)
            .then_with(|| compare_distance(&a.server, &b.server))
            .then_with(|| a.order.cmp(&b.order))
    });

    let (latency, best) = reachable
        .into_iter()
        .next()
        .ok_or(EngineError::NoReachableServer { probed })?;
    let mut server = best.server;
    server.latency_ms = Some(latency.as_secs_f64() * 1000.0);
    info!("Selected server {} ({:?})", server, latency);
    Ok(server)
}

/// Sequential probes against one server; `None` if none succeeded in time.
async fn min_round_trip(probe: &dyn Probe, server: &Server, config: &ProbeConfig) -> Option<Duration> {
    let mut best: Option<Duration> = None;
    for _ in 0..config.probe_count {
        match tokio::time::timeout(config.timeout, probe.round_trip(server)).await {
            Ok(Ok(rtt)) => best = Some(best.map_or(rtt, |b| b.min(rtt))),
            Ok(Err(err)) => debug!("Probe to {} failed: {err}", server.host),
            Err(_) => debug!("Probe to {} timed out", server.host),
        }
    }
    best
}

/// Unknown distances sort last.
fn compare_distance(a: &Server, b: &Server) -> Ordering {
    let key = |s: &Server| s.distance_km.unwrap_or(f64::INFINITY);
    key(a).total_cmp(&key(b))
}
