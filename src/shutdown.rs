//! Graceful Shutdown Module
//!
//! Background tasks (discovery channels, the counter pruner) are tracked in a
//! `JoinSet` and stopped through a broadcast signal.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shutdown coordinator for graceful termination
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    completion_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (completion_tx, _) = watch::channel(false);

        Self {
            shutdown_tx,
            completion_tx,
            tasks: JoinSet::new(),
        }
    }

    /// A receiver that resolves once shutdown starts.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.shutdown_tx.subscribe(),
        }
    }

    /// Resolves to `true` once every tracked task has stopped.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completion_tx.subscribe()
    }

    /// Spawn a tracked task that observes the shutdown signal on its own.
    pub fn spawn_graceful<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = task(self.subscribe());
        self.tasks.spawn(async move {
            future.await;
            info!(task = name, "Background task stopped");
        });
    }

    /// Signal shutdown and wait up to `timeout` for tracked tasks.
    pub async fn shutdown(mut self, timeout: Duration) {
        info!(tasks = self.tasks.len(), "Initiating graceful shutdown");

        let _ = self.shutdown_tx.send(());

        let shutdown_result = tokio::time::timeout(timeout, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Task failed during shutdown");
                }
            }
        })
        .await;

        match shutdown_result {
            Ok(()) => info!("All tasks completed gracefully"),
            Err(_) => {
                warn!("Shutdown timeout reached, aborting remaining tasks");
                self.tasks.abort_all();
            }
        }

        let _ = self.completion_tx.send(true);
        info!("Shutdown complete");
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown signal receiver
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    /// Waits for the shutdown signal. Also resolves if the coordinator is gone.
    pub async fn recv(&mut self) {
        let _ = self.receiver.recv().await;
    }

    /// Checks if shutdown has been signaled (non-blocking)
    pub fn is_shutdown(&mut self) -> bool {
        !matches!(self.receiver.try_recv(), Err(broadcast::error::TryRecvError::Empty))
    }
}

/// Waits for SIGTERM or SIGINT.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}

/// Run `on_reload` on every SIGHUP until shutdown.
#[cfg(unix)]
pub async fn reload_on_hangup<F>(mut shutdown: ShutdownSignal, mut on_reload: F)
where
    F: FnMut() + Send,
{
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler, key reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("Received SIGHUP, reloading");
                on_reload();
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Runs a server until it stops or a termination signal arrives, then shuts down.
pub async fn run_with_graceful_shutdown<F, S>(
    server_future: F,
    shutdown_coordinator: ShutdownCoordinator,
    shutdown_timeout: Duration,
) where
    F: Future<Output = Result<(), S>> + Send,
    S: std::fmt::Display,
{
    tokio::select! {
        result = server_future => {
            match result {
                Ok(()) => info!("Server stopped normally"),
                Err(e) => error!(error = %e, "Server error"),
            }
        }
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
        }
    }

    shutdown_coordinator.shutdown(shutdown_timeout).await;
}
