//! Graceful shutdown for the experiment engine
//!
//! A `watch` channel fans one shutdown trigger out to every listener (the
//! HTTP server's graceful-shutdown future, background tasks). OS signals
//! are turned into that trigger by `main`.

use tokio::sync::watch;
use tracing::{info, warn};

/// Receiving half; clone it for every component that must stop
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered or the controller is gone
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                // Controller dropped: nobody can ever trigger, treat as shutdown
                break;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending half, owned by `main`
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        if self.sender.send(true).is_err() {
            // Every signal already dropped; nothing left to stop
            return;
        }
        info!("Shutdown signal sent");
    }

    /// Another signal bound to this controller
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT, returning the signal name
///
/// If SIGTERM cannot be registered, falls back to Ctrl+C only.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler, listening for Ctrl+C only");
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            "SIGTERM"
        }
        name = wait_for_ctrl_c() => name,
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received SIGINT");
            "SIGINT"
        }
        Err(e) => {
            // Without a handler we can never be interrupted; park forever
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<&'static str>().await
        }
    }
}
