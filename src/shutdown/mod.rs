//! Shutdown coordination.
//!
//! Two things stop the gateway:
//! - SIGTERM/SIGINT, which request a clean shutdown
//! - a critical error, which requests a fatal shutdown after a short delay
//!   and, unless disabled, kills the process once the grace period is over
//!
//! Every long-running task holds a [`Shutdown`] handle and waits on it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::ShutdownConfig;
use crate::error::Error;

/// Why the gateway stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Requested by a signal or by the operator.
    Clean,
    /// Caused by a critical error.
    Fatal(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Clean => write!(f, "clean shutdown"),
            ShutdownReason::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Shared shutdown handle.
#[derive(Clone)]
pub struct Shutdown {
    config: ShutdownConfig,
    reason: Arc<RwLock<Option<ShutdownReason>>>,
    fatal_started: Arc<AtomicBool>,
    tx: broadcast::Sender<ShutdownReason>,
}

impl Shutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (tx, _) = broadcast::channel(4);

        Self {
            config,
            reason: Arc::new(RwLock::new(None)),
            fatal_started: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.reason.read().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.read().clone()
    }

    /// Request shutdown. Only the first request is broadcast.
    pub fn request(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.write();
            if current.is_some() {
                return;
            }
            *current = Some(reason.clone());
        }

        info!("Initiating {}", reason);
        let _ = self.tx.send(reason);
    }

    /// Escalate a critical error.
    ///
    /// Logs the error, waits `fatal_delay` so that concurrent log lines get
    /// out, then broadcasts a fatal shutdown. With `force_exit` the process
    /// exits after `grace_period` even if tasks did not stop.
    pub fn fatal(&self, err: &Error) {
        error!(error = %err, "Critical error, shutting down");

        if self.fatal_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let shutdown = self.clone();
        let reason = err.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(shutdown.config.fatal_delay).await;
            shutdown.request(ShutdownReason::Fatal(reason));

            if shutdown.config.force_exit {
                tokio::time::sleep(shutdown.config.grace_period).await;
                error!("Grace period expired, exiting");
                std::process::exit(1);
            }
        });
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();

        if let Some(reason) = self.reason() {
            return reason;
        }

        loop {
            match rx.recv().await {
                Ok(reason) => return reason,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return self.reason().unwrap_or(ShutdownReason::Clean)
                }
            }
        }
    }

    /// Map SIGTERM/SIGINT to a clean shutdown (Unix).
    #[cfg(unix)]
    pub async fn listen_signals(&self) {
        use futures::StreamExt;
        use signal_hook::consts::signal::*;
        use signal_hook_tokio::Signals;

        let signals = match Signals::new([SIGTERM, SIGINT]) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register signal handlers: {}", e);
                return;
            }
        };
        let handle = signals.handle();
        let mut signals = signals.fuse();

        tokio::select! {
            signal = signals.next() => {
                if let Some(signal) = signal {
                    let name = if signal == SIGTERM { "SIGTERM" } else { "SIGINT" };
                    info!("Received signal: {}", name);
                    self.request(ShutdownReason::Clean);
                }
            }
            _ = self.wait() => {}
        }

        handle.close();
    }

    /// Map Ctrl+C to a clean shutdown (non-Unix fallback).
    #[cfg(not(unix))]
    pub async fn listen_signals(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => self.request(ShutdownReason::Clean),
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            },
            _ = self.wait() => {}
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new(ShutdownConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> Shutdown {
        Shutdown::new(ShutdownConfig {
            fatal_delay: Duration::from_millis(10),
            grace_period: Duration::from_millis(10),
            force_exit: false,
        })
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::Clean.to_string(), "clean shutdown");
        assert_eq!(ShutdownReason::Fatal("boom".into()).to_string(), "fatal: boom");
    }

    #[tokio::test]
    async fn test_first_request_wins() {
        let shutdown = quick();
        assert!(!shutdown.is_shutdown());

        shutdown.request(ShutdownReason::Clean);
        shutdown.request(ShutdownReason::Fatal("late".into()));

        assert_eq!(shutdown.reason(), Some(ShutdownReason::Clean));
        assert_eq!(shutdown.wait().await, ShutdownReason::Clean);
    }

    #[tokio::test]
    async fn test_fatal_is_delayed() {
        let shutdown = quick();
        shutdown.fatal(&Error::internal("unknown entrypoint"));
        assert!(!shutdown.is_shutdown());

        let reason = tokio::time::timeout(Duration::from_millis(500), shutdown.wait())
            .await
            .expect("fatal shutdown should be broadcast");
        assert!(matches!(reason, ShutdownReason::Fatal(msg) if msg.contains("unknown entrypoint")));
    }

    #[tokio::test]
    async fn test_wait_from_clone() {
        let shutdown = quick();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.request(ShutdownReason::Clean);

        let reason = tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::Clean);
    }
}
