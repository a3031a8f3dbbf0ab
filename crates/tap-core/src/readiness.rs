//! One-shot readiness signal.
//!
//! Endpoint discovery must not answer before the bus has finished its initial
//! endpoint gather. The wiring hands out a [`Readiness`] that settles once its
//! [`ReadinessTrigger`] fires.

use tokio::sync::watch;
use tracing::debug;

/// Shared view of a readiness signal.
///
/// A `Readiness` with no trigger is always ready. A trigger that is dropped
/// without firing also releases every waiter.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    rx: Option<watch::Receiver<bool>>,
}

/// Firing side of a readiness signal.
#[derive(Debug)]
pub struct ReadinessTrigger {
    tx: watch::Sender<bool>,
}

/// Create a linked trigger and signal, initially not ready.
#[must_use]
pub fn readiness() -> (ReadinessTrigger, Readiness) {
    let (tx, rx) = watch::channel(false);
    (ReadinessTrigger { tx }, Readiness { rx: Some(rx) })
}

impl Readiness {
    /// A signal that is already satisfied.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Check whether waiting would return immediately.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => true,
        }
    }

    /// Wait until the signal settles.
    pub async fn wait(&self) {
        let Some(rx) = &self.rx else {
            return;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|ready| *ready).await.is_err() {
            debug!("Readiness trigger dropped before firing, proceeding");
        }
    }
}

impl ReadinessTrigger {
    /// Mark the signal ready, releasing every waiter.
    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }
}
