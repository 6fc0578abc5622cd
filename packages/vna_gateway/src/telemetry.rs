//! Telemetry: RSL sources and the periodic broadcaster.

use axum::extract::ws::Message;
use serde::Serialize;
use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clients::{BroadcastReport, ClientSet};
use crate::config::{SourceKind, TelemetryConfig};

/// Centre of the simulated RSL waveform, in dBm
pub const SIMULATED_BASELINE_DBM: f64 = -85.5;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleOrigin {
    Vna,
    Simulated,
}

/// One live RSL reading. Never stored.
#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct TelemetrySample {
    /// Received signal level in dBm
    pub rsl: f64,
    /// Seconds since the unix epoch
    pub timestamp: f64,
    pub source: SampleOrigin,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("no RSL command configured")]
    EmptyCommand,

    #[error("failed to run RSL command: {0}")]
    Spawn(#[from] io::Error),

    #[error("RSL command timed out after {0:?}")]
    Timeout(Duration),

    #[error("RSL command exited with {0}")]
    Failed(std::process::ExitStatus),

    #[error("unparsable RSL output: {0:?}")]
    Unparsable(String),
}

pub fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Something that can produce an RSL reading. Reads may block.
pub trait SignalSource: Send + Sync {
    fn origin(&self) -> SampleOrigin;
    fn read_rsl(&self) -> Result<f64, TelemetryError>;
}

/// Deterministic stand-in for the instrument: a slow sine around the baseline.
#[derive(Debug, Default)]
pub struct SimulatedSource {
    reads: AtomicU64,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_value(&self) -> f64 {
        let n = self.reads.fetch_add(1, Ordering::Relaxed);
        SIMULATED_BASELINE_DBM + 2.0 * (0.3 * n as f64).sin()
    }
}

impl SignalSource for SimulatedSource {
    fn origin(&self) -> SampleOrigin {
        SampleOrigin::Simulated
    }

    fn read_rsl(&self) -> Result<f64, TelemetryError> {
        Ok(self.next_value())
    }
}

/// Reads RSL by running the instrument-control collaborator once per sample.
///
/// Reads are serialized: the instrument accepts one session at a time.
#[derive(Debug)]
pub struct InstrumentSource {
    command: Vec<String>,
    timeout: Duration,
    session: Mutex<()>,
}

impl InstrumentSource {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            session: Mutex::new(()),
        }
    }
}

impl SignalSource for InstrumentSource {
    fn origin(&self) -> SampleOrigin {
        SampleOrigin::Vna
    }

    fn read_rsl(&self) -> Result<f64, TelemetryError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(TelemetryError::EmptyCommand)?;

        let _session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = Instant::now() + self.timeout;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        // Drained while we wait, so a chatty child never blocks on a full pipe
        let stdout = child.stdout.take();
        let (output_tx, output_rx) = mpsc::channel();
        let drain = std::thread::Builder::new()
            .name("rsl-stdout".to_string())
            .spawn(move || {
                let mut buf = Vec::new();
                let result = match stdout {
                    Some(mut out) => out.read_to_end(&mut buf).map(|_| buf),
                    None => Ok(buf),
                };
                let _ = output_tx.send(result);
            });
        if let Err(e) = drain {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TelemetryError::Spawn(e));
        }

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TelemetryError::Timeout(self.timeout));
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        if !status.success() {
            return Err(TelemetryError::Failed(status));
        }

        // A grandchild may still hold the pipe open; do not wait past the deadline
        let remaining = deadline.saturating_duration_since(Instant::now());
        let stdout = match output_rx.recv_timeout(remaining) {
            Ok(result) => result?,
            Err(_) => return Err(TelemetryError::Timeout(self.timeout)),
        };
        parse_rsl(&String::from_utf8_lossy(&stdout))
    }
}

/// Last token of the last non-empty line, as dBm.
pub fn parse_rsl(stdout: &str) -> Result<f64, TelemetryError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| TelemetryError::Unparsable(String::new()))?;

    line.split_whitespace()
        .last()
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or_else(|| TelemetryError::Unparsable(line.to_string()))
}

/// Produces samples from a primary source, falling back to simulation.
pub struct TelemetrySampler {
    primary: Arc<dyn SignalSource>,
    fallback: SimulatedSource,
}

impl TelemetrySampler {
    pub fn new(primary: Arc<dyn SignalSource>) -> Self {
        Self {
            primary,
            fallback: SimulatedSource::new(),
        }
    }

    pub fn simulated() -> Self {
        Self::new(Arc::new(SimulatedSource::new()))
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        match config.source {
            SourceKind::Simulated => Self::simulated(),
            SourceKind::Instrument => Self::new(Arc::new(InstrumentSource::new(
                config.command.clone(),
                config.timeout,
            ))),
        }
    }

    /// Blocking when the primary source is the instrument
    pub fn sample(&self) -> TelemetrySample {
        let (rsl, source) = match self.primary.read_rsl() {
            Ok(rsl) => (rsl, self.primary.origin()),
            Err(e) => {
                warn!("RSL read failed, using simulated value: {}", e);
                (self.fallback.next_value(), SampleOrigin::Simulated)
            }
        };

        TelemetrySample {
            rsl,
            timestamp: epoch_seconds(),
            source,
        }
    }
}

/// Pushes one sample per period to every live WebSocket client.
pub struct TelemetryBroadcaster {
    clients: Arc<ClientSet>,
    sampler: Arc<TelemetrySampler>,
    interval: Duration,
}

impl TelemetryBroadcaster {
    pub fn new(clients: Arc<ClientSet>, sampler: Arc<TelemetrySampler>, interval: Duration) -> Self {
        Self {
            clients,
            sampler,
            interval,
        }
    }

    /// One broadcast cycle. Returns `None` when nobody was connected, in
    /// which case the source is not read.
    pub async fn tick(&self) -> Option<BroadcastReport> {
        if self.clients.is_empty() {
            return None;
        }

        let sampler = self.sampler.clone();
        let sample = match tokio::task::spawn_blocking(move || sampler.sample()).await {
            Ok(sample) => sample,
            Err(e) => {
                error!("Telemetry read task failed: {}", e);
                return None;
            }
        };

        let json = match serde_json::to_string(&sample) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize telemetry: {}", e);
                return None;
            }
        };

        let report = self.clients.broadcast(Message::Text(json.into()));
        if !report.pruned.is_empty() {
            info!("Pruned {} disconnected client(s)", report.pruned.len());
        }
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast RSL {:.2} dBm",
            sample.rsl
        );
        Some(report)
    }

    pub async fn run(self) {
        info!("Telemetry broadcaster started ({:?} period)", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}
