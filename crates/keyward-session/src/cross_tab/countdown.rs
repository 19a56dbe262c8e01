//! Auto-logout countdown.

use super::activity::INACTIVITY_THRESHOLD;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

/// Drive the countdown until it expires or `activity` closes.
///
/// The countdown starts when the session turns inactive and publishes the
/// remaining whole seconds on `countdown` during the final `warning`
/// window. Activity resets it to `None`. At zero `on_expire` runs once.
pub(crate) async fn run(
    mut activity: watch::Receiver<bool>,
    idle_lifetime: Duration,
    warning: Duration,
    countdown: watch::Sender<Option<u64>>,
    on_expire: impl FnOnce(),
) {
    loop {
        while *activity.borrow_and_update() {
            if activity.changed().await.is_err() {
                return;
            }
        }

        // Inactivity is only detected after the threshold has already elapsed.
        let deadline = Instant::now() + idle_lifetime.saturating_sub(INACTIVITY_THRESHOLD);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = activity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *activity.borrow_and_update() {
                        countdown.send_replace(None);
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        countdown.send_replace(Some(0));
                        info!("idle session lifetime reached, logging out");
                        on_expire();
                        return;
                    }
                    if remaining <= warning {
                        countdown.send_replace(Some(remaining.as_secs_f64().ceil() as u64));
                    }
                }
            }
        }
    }
}
