//! Graceful Shutdown Module
//!
//! Handles signal handling and graceful shutdown: listeners stop accepting,
//! background tasks observe the broadcast signal, and in-flight remote
//! fetches get a bounded grace period to finish.

use crate::context::RelayContext;
use crate::{RelayError, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    context: Option<RelayContext>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            context: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Set the relay context whose fetches are drained on shutdown
    pub fn set_context(&mut self, context: RelayContext) {
        self.context = Some(context);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Shutdown signal for a component
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.subscribe())
    }

    /// Start listening for shutdown signals
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        // Listen for SIGINT (Ctrl+C) and SIGTERM
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                RelayError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                RelayError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No component subscribed, which is fine
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.drain_in_flight()).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                let remaining = self
                    .context
                    .as_ref()
                    .map(|context| context.dedup.in_flight_count())
                    .unwrap_or(0);
                error!(
                    "Graceful shutdown timed out after {:?} with {} fetches in flight",
                    self.shutdown_timeout, remaining
                );
                Err(RelayError::TimeoutError(format!(
                    "shutdown timed out with {} fetches in flight",
                    remaining
                )))
            }
        }
    }

    /// Wait until no remote fetch is registered or holding a slot
    async fn drain_in_flight(&self) {
        let Some(context) = self.context.as_ref() else {
            return;
        };

        let mut logged = false;
        loop {
            let in_flight = context.dedup.in_flight_count();
            let active = context.admission.in_use();
            if in_flight == 0 && active == 0 {
                return;
            }
            if !logged {
                warn!(
                    "Waiting for in-flight fetches to finish: in_flight={}, active_fetches={}",
                    in_flight, active
                );
                logged = true;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    /// Create new shutdown signal from receiver
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) {
        // Closed and lagged channels both mean the coordinator is gone or fired
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }

    /// Try to receive shutdown signal without blocking
    pub fn try_recv_shutdown(&mut self) -> bool {
        match self.receiver.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => false,
            _ => {
                self.shutdown_requested = true;
                true
            }
        }
    }
}
