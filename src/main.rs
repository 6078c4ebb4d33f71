//! linkspeed: measure download and upload throughput against the nearest
//! Cloudflare-compatible speed test server.
//!
//! Usage:
//!   linkspeed                          # defaults, human readable output
//!   linkspeed --json                   # one JSON object per line
//!   linkspeed --config linkspeed.toml --duration 15 --max-connections 16
//!
//! Settings are read from the TOML file (if given), then `LINKSPEED_*`
//! environment variables (a `.env` file is honoured), then flags.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use log::{debug, warn};
use serde_json::json;

use linkspeed::{PartialResult, ProgressEvent, RunFailure, Settings, SpeedTest, TestResult};

#[derive(Parser, Debug)]
#[command(name = "linkspeed", version)]
#[command(about = "Multi-connection internet speed test")]
struct Args {
    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Duration of each phase in seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Upper bound on parallel connections per phase
    #[arg(long)]
    max_connections: Option<usize>,

    /// URL of a JSON server catalog
    #[arg(long)]
    server_list_url: Option<String>,

    /// Timeout for a single latency probe
    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    /// Sampling interval
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Emit progress and result as JSON lines
    #[arg(long)]
    json: bool,
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Settings::default(),
        };
        settings.apply_env()?;

        if let Some(secs) = self.duration {
            settings.phase_duration_ms = (secs * 1000.0).round() as u64;
        }
        if let Some(max) = self.max_connections {
            settings.max_connections = max;
            settings.initial_connections = settings.initial_connections.min(max);
        }
        if let Some(url) = &self.server_list_url {
            settings.server_list_url = Some(url.clone());
        }
        if let Some(ms) = self.probe_timeout_ms {
            settings.probe_timeout_ms = ms;
        }
        if let Some(ms) = self.tick_ms {
            settings.tick_ms = ms;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let settings = args.settings()?;
    debug!("Settings: {settings:?}");

    let mut run = SpeedTest::new(settings)?.spawn();
    let cancel = run.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling test");
            cancel.cancel();
        }
    });

    while let Some(event) = run.next().await {
        render_event(&event, args.json)?;
    }

    let succeeded = render_outcome(run.finish().await, args.json)?;
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Prints the result, or the partial results of a failed run. The failure
/// itself was already shown through its terminal error event.
fn render_outcome(outcome: Result<TestResult, RunFailure>, as_json: bool) -> Result<bool> {
    match outcome {
        Ok(result) => {
            render_result(&result, as_json)?;
            Ok(true)
        }
        Err(failure) => {
            render_partial(&failure, as_json)?;
            Ok(false)
        }
    }
}

fn render_event(event: &ProgressEvent, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string(&event.to_wire())?);
        return Ok(());
    }
    match event {
        ProgressEvent::Stage(stage) => println!("[{stage}]"),
        ProgressEvent::PartialSpeed { phase, mbps } => println!("  {phase:<8} {mbps:>9.2} Mbps"),
        ProgressEvent::Error { kind, message, .. } => eprintln!("error ({kind}): {message}"),
    }
    Ok(())
}

fn render_result(result: &TestResult, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string(&result.to_report())?);
        return Ok(());
    }
    println!();
    println!("Server:   {}", result.server);
    println!("Ping:     {:.1} ms", result.ping_ms);
    println!("Download: {:.2} Mbps{}", result.download.mbps, degraded_note(result.download.degraded));
    println!("Upload:   {:.2} Mbps{}", result.upload.mbps, degraded_note(result.upload.degraded));
    println!("At:       {}", result.completed_at.to_rfc3339());
    Ok(())
}

fn render_partial(failure: &RunFailure, as_json: bool) -> Result<()> {
    let PartialResult {
        server,
        ping_ms,
        download,
        upload,
    } = &failure.partial;
    if as_json {
        let partial = json!({
            "error": failure.kind(),
            "server": server.as_ref().map(|s| json!({"host": s.host, "distance_km": s.distance_km})),
            "ping_ms": ping_ms,
            "download_mbps": download.as_ref().map(|r| r.mbps),
            "upload_mbps": upload.as_ref().map(|r| r.mbps),
        });
        println!("{partial}");
        return Ok(());
    }
    if let Some(server) = server {
        println!("Server:   {server}");
    }
    if let Some(ping) = ping_ms {
        println!("Ping:     {ping:.1} ms");
    }
    if let Some(download) = download {
        println!("Download: {:.2} Mbps", download.mbps);
    }
    if let Some(upload) = upload {
        println!("Upload:   {:.2} Mbps", upload.mbps);
    }
    Ok(())
}

fn degraded_note(degraded: bool) -> &'static str {
    if degraded {
        " (low confidence)"
    } else {
        ""
    }
}
