//! Registry of in-flight token operations.
//!
//! At most one login exchange or renewal runs per configuration. The first
//! caller becomes the leader; everyone arriving while it runs follows and
//! receives the leader's outcome, including the very same `Arc<TokenSet>`.

use crate::error::ClientError;
use keyward_core::{ConfigurationId, TokenSet};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

pub type OperationOutcome = Result<Arc<TokenSet>, ClientError>;

type Slot = watch::Receiver<Option<OperationOutcome>>;

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    slots: Mutex<HashMap<ConfigurationId, Slot>>,
}

/// Result of [`InFlightRegistry::join`].
#[derive(Debug)]
pub enum Participation {
    /// Run the operation, then call [`InFlightGuard::complete`].
    Leader(InFlightGuard),
    /// Another caller is running it.
    Follower(PendingOperation),
}

impl InFlightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the leader for `config_id`, or follow the running operation.
    pub fn join(self: &Arc<Self>, config_id: &ConfigurationId) -> Participation {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = slots.get(config_id) {
            return Participation::Follower(PendingOperation { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(None);
        slots.insert(config_id.clone(), rx);
        Participation::Leader(InFlightGuard {
            registry: Arc::clone(self),
            config_id: config_id.clone(),
            tx,
        })
    }

    /// The running operation for `config_id`, if any.
    #[must_use]
    pub fn pending(&self, config_id: &ConfigurationId) -> Option<PendingOperation> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(config_id)
            .map(|rx| PendingOperation { rx: rx.clone() })
    }

    /// Wait until no operation is running for `config_id`.
    pub async fn wait_for_all(&self, config_id: &ConfigurationId) {
        while let Some(pending) = self.pending(config_id) {
            let _ = pending.wait().await;
        }
    }

    #[must_use]
    pub fn is_in_flight(&self, config_id: &ConfigurationId) -> bool {
        self.pending(config_id).is_some()
    }

    fn release(&self, config_id: &ConfigurationId) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(config_id);
    }
}

/// Held by the leader. Dropping it without completing aborts the operation.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    config_id: ConfigurationId,
    tx: watch::Sender<Option<OperationOutcome>>,
}

impl InFlightGuard {
    /// Publish the outcome to every follower and free the slot.
    pub fn complete(self, outcome: OperationOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.config_id);
    }
}

/// A running operation led by someone else.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    rx: Slot,
}

impl PendingOperation {
    pub async fn wait(mut self) -> OperationOutcome {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone().unwrap_or(Err(ClientError::Aborted));
            }
        }
    }
}
