//! VNA gateway: network control and live telemetry for the network analyzer rig.
//!
//! One listening port carries two protocols. Plain text lines are command
//! sessions served by a thread each; WebSocket handshakes are passed to a
//! single-threaded event loop that answers JSON commands and streams RSL
//! samples to every connected client. Measurement runs are child processes
//! tracked by a [`JobRegistry`] and removed by a [`Reaper`] once they exit.

pub mod clients;
pub mod command;
pub mod config;
pub mod error;
pub mod tcp_server;
pub mod telemetry;
pub mod websocket;

use anyhow::{Context, Result};
use job_registry::{JobRegistry, Reaper};
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::{info, warn};

pub use clients::ClientSet;
pub use command::{Command, CommandInterpreter, Outcome};
pub use config::GatewayConfig;
pub use tcp_server::TcpCommandServer;
pub use telemetry::{TelemetryBroadcaster, TelemetrySampler};

pub struct Gateway {
    config: GatewayConfig,
    listener: TcpListener,
    registry: Arc<JobRegistry>,
    sampler: Arc<TelemetrySampler>,
}

impl Gateway {
    /// Bind the shared port. Nothing is served until [`Gateway::run`].
    pub fn bind(config: GatewayConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("Failed to bind to {}", addr))?;
        let registry = Arc::new(JobRegistry::with_limits(
            config.jobs.max_jobs,
            config.jobs.stop_grace,
        ));
        let sampler = Arc::new(TelemetrySampler::from_config(&config.telemetry));

        Ok(Self {
            config,
            listener,
            registry,
            sampler,
        })
    }

    /// Replace the telemetry sampler chosen from the config
    pub fn with_sampler(mut self, sampler: TelemetrySampler) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Serve until `shutdown` resolves, then ask every live job to stop.
    ///
    /// Must be polled on a tokio runtime; the WebSocket side runs on it,
    /// text sessions run on their own threads.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let local_addr = self.local_addr()?;

        Reaper::spawn(self.registry.clone(), self.config.jobs.reap_interval)
            .context("Failed to start reaper")?
            .detach();

        let interpreter = Arc::new(CommandInterpreter::new(
            self.registry.clone(),
            self.config.jobs.launcher.clone(),
            self.sampler.clone(),
        ));
        let clients = Arc::new(ClientSet::new());

        let (handoff, http_listener) = websocket::HandoffListener::new(local_addr);
        TcpCommandServer::new(self.listener, interpreter.clone(), Some(handoff))
            .spawn()
            .context("Failed to start command server")?;

        let broadcaster = tokio::spawn(
            TelemetryBroadcaster::new(
                clients.clone(),
                self.sampler.clone(),
                self.config.telemetry.interval,
            )
            .run(),
        );

        let app = websocket::router(websocket::AppState {
            interpreter,
            clients,
            client_queue: self.config.telemetry.client_queue,
        });

        info!("Gateway listening on {} (text commands and WebSocket)", local_addr);
        let served = axum::serve(http_listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        broadcaster.abort();
        let stopping = self.registry.terminate_all();
        if stopping > 0 {
            warn!("Sent termination request to {} running job(s)", stopping);
        }

        served.context("WebSocket gateway failed")
    }
}
