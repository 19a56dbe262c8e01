//! Shared user-activity tracking.
//!
//! Local interactions are fed through [`ActivityTracker::record`] and
//! rebroadcast (at most once per second) so every tab of the session sees
//! them. The session counts as inactive after five seconds without a
//! signal from any tab.

use crate::host::BroadcastHub;
use keyward_core::AppInstanceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Minimum spacing between two rebroadcasts.
pub const INTERACTION_THROTTLE: Duration = Duration::from_secs(1);

/// Silence after which the session is considered inactive.
pub const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(5);

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractionMessage {
    app_instance_id: AppInstanceId,
}

/// Handle to the background tracking task.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    tx: mpsc::Sender<()>,
    active: watch::Receiver<bool>,
}

impl ActivityTracker {
    pub(crate) fn spawn(
        hub: Arc<dyn BroadcastHub>,
        channel: String,
        app_instance_id: AppInstanceId,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (active_tx, active) = watch::channel(true);
        let remote = hub.subscribe(&channel);
        let task = tokio::spawn(track_loop(
            hub,
            channel,
            app_instance_id,
            rx,
            remote,
            active_tx,
        ));
        (Self { tx, active }, task)
    }

    /// Record a local user interaction (non-blocking, fire-and-forget).
    pub fn record(&self) {
        let _ = self.tx.try_send(());
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.clone()
    }
}

async fn track_loop(
    hub: Arc<dyn BroadcastHub>,
    channel: String,
    app_instance_id: AppInstanceId,
    mut local: mpsc::Receiver<()>,
    mut remote: broadcast::Receiver<serde_json::Value>,
    active: watch::Sender<bool>,
) {
    let mut last_signal = Instant::now();
    let mut last_broadcast: Option<Instant> = None;
    let mut remote_open = true;
    let mark_active = |active: &watch::Sender<bool>| {
        active.send_if_modified(|state| !std::mem::replace(state, true));
    };

    loop {
        let inactive_at = last_signal + INACTIVITY_THRESHOLD;
        let is_active = *active.borrow();

        tokio::select! {
            event = local.recv() => {
                let Some(()) = event else { return };
                let now = Instant::now();
                last_signal = now;
                mark_active(&active);
                if last_broadcast.map_or(true, |at| now.duration_since(at) >= INTERACTION_THROTTLE) {
                    last_broadcast = Some(now);
                    match serde_json::to_value(InteractionMessage { app_instance_id }) {
                        Ok(message) => hub.post(&channel, message),
                        Err(e) => tracing::error!(error = %e, "failed to serialize interaction message"),
                    }
                }
            }
            message = remote.recv(), if remote_open => match message {
                Ok(value) => {
                    let from_other_tab = serde_json::from_value::<InteractionMessage>(value)
                        .is_ok_and(|m| m.app_instance_id != app_instance_id);
                    if from_other_tab {
                        trace!("user interaction in another tab");
                        last_signal = Instant::now();
                        mark_active(&active);
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => remote_open = false,
            },
            () = tokio::time::sleep_until(inactive_at), if is_active => {
                trace!("session became inactive");
                active.send_replace(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroadcastHub;

    fn spawn(hub: &Arc<MemoryBroadcastHub>) -> (ActivityTracker, JoinHandle<()>) {
        ActivityTracker::spawn(hub.clone(), "keyward:user-interaction-tracker:sid".into(), AppInstanceId::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_inactive_without_signals() {
        let hub = Arc::new(MemoryBroadcastHub::new());
        let (tracker, task) = spawn(&hub);
        assert!(tracker.is_active());

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(tracker.is_active());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!tracker.is_active());

        tracker.record();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tracker.is_active());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebroadcast_is_throttled() {
        let hub = Arc::new(MemoryBroadcastHub::new());
        let mut observer = hub.subscribe("keyward:user-interaction-tracker:sid");
        let (tracker, task) = spawn(&hub);

        for _ in 0..5 {
            tracker.record();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        tracker.record();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut received = 0;
        while observer.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_tab_keeps_session_active() {
        let hub = Arc::new(MemoryBroadcastHub::new());
        let (tab_a, task_a) = spawn(&hub);
        let (tab_b, task_b) = spawn(&hub);

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tab_a.record();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(tab_a.is_active());
        assert!(tab_b.is_active());
        task_a.abort();
        task_b.abort();
    }
}
