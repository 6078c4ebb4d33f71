//! Reduction of per-connection tick samples into one Mbps figure.
//!
//! Samples from all connections that share a tick are summed into a bucket,
//! each bucket becomes an Mbps value, the outer `trim_fraction` of buckets on
//! both ends is dropped and the rest is averaged.

use std::collections::BTreeMap;
use std::time::Duration;

use super::{PhaseResult, PhaseSamples, Sample};
use crate::error::EngineError;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy)]
pub struct ReduceConfig {
    pub trim_fraction: f64,
    pub min_buckets: usize,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            trim_fraction: 0.1,
            min_buckets: 3,
        }
    }
}

impl From<&Settings> for ReduceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            trim_fraction: settings.trim_fraction,
            min_buckets: settings.min_buckets,
        }
    }
}

pub fn to_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / 1_000_000.0 / secs
}

/// Mbps per tick across all connections, in timeline order. Ramp-up samples
/// and zero-length intervals are skipped.
pub fn bucket_speeds(samples: &[Sample]) -> Vec<f64> {
    let mut buckets: BTreeMap<Duration, (u64, Duration)> = BTreeMap::new();
    for sample in samples.iter().filter(|s| !s.ramp_up) {
        let bucket = buckets
            .entry(sample.interval_start)
            .or_insert((0, sample.interval_end));
        bucket.0 += sample.bytes;
        bucket.1 = bucket.1.max(sample.interval_end);
    }
    buckets
        .into_iter()
        .filter(|(start, (_, end))| end > start)
        .map(|(start, (bytes, end))| to_mbps(bytes, end - start))
        .collect()
}

/// Number of buckets dropped from each tail.
pub fn trim_count(buckets: usize, fraction: f64) -> usize {
    (buckets as f64 * fraction).floor() as usize
}

pub fn reduce(samples: &PhaseSamples, config: &ReduceConfig) -> Result<PhaseResult, EngineError> {
    let mut speeds = bucket_speeds(&samples.samples);
    let bucket_count = speeds.len();
    let trim = trim_count(bucket_count, config.trim_fraction);
    let kept = bucket_count.saturating_sub(2 * trim);
    if kept < config.min_buckets {
        return Err(EngineError::InsufficientSamples {
            phase: samples.phase,
            buckets: kept,
            required: config.min_buckets,
        });
    }

    speeds.sort_by(f64::total_cmp);
    let kept_speeds = &speeds[trim..bucket_count - trim];
    let mbps = kept_speeds.iter().sum::<f64>() / kept_speeds.len() as f64;

    Ok(PhaseResult {
        phase: samples.phase,
        mbps,
        sample_count: measured_samples(&samples.samples),
        bucket_count,
        duration_ms: samples.elapsed.as_millis() as u64,
        degraded: false,
    })
}

/// Untrimmed mean of whatever buckets exist, for callers that accept a
/// low-confidence number over an error.
pub fn reduce_degraded(samples: &PhaseSamples) -> PhaseResult {
    let speeds = bucket_speeds(&samples.samples);
    let mbps = if speeds.is_empty() {
        0.0
    } else {
        speeds.iter().sum::<f64>() / speeds.len() as f64
    };
    PhaseResult {
        phase: samples.phase,
        mbps,
        sample_count: measured_samples(&samples.samples),
        bucket_count: speeds.len(),
        duration_ms: samples.elapsed.as_millis() as u64,
        degraded: true,
    }
}

fn measured_samples(samples: &[Sample]) -> usize {
    samples.iter().filter(|s| !s.ramp_up).count()
}
