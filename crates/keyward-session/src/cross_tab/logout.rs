//! Logout propagation through `localStorage`.
//!
//! The logging-out tab writes `<ns>:logout-propagation:<configId>`; other
//! tabs see the storage event and perform the same logout. Entries carry
//! an absolute expiry and are deleted by their writer once it passes, or
//! by the next tab to bootstrap.

use crate::host::{KeyValueStore, StorageEvent};
use crate::keys;
use crate::session::LogoutRedirect;
use chrono::{DateTime, Utc};
use keyward_core::{AppInstanceId, ConfigurationId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Lifetime of a propagation entry.
pub const LOGOUT_PROPAGATION_TTL: Duration = Duration::from_millis(7000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogoutPropagation {
    pub app_instance_id: AppInstanceId,
    /// Milliseconds since the Unix epoch.
    pub expiration_time: i64,
    pub redirect: LogoutRedirect,
}

impl LogoutPropagation {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time <= now.timestamp_millis()
    }
}

/// Write the propagation entry and schedule its removal.
pub(crate) fn publish(
    storage: Arc<dyn KeyValueStore>,
    namespace: &str,
    config_id: &ConfigurationId,
    app_instance_id: AppInstanceId,
    redirect: LogoutRedirect,
) {
    let key = keys::logout_propagation(namespace, config_id);
    let entry = LogoutPropagation {
        app_instance_id,
        expiration_time: Utc::now().timestamp_millis() + LOGOUT_PROPAGATION_TTL.as_millis() as i64,
        redirect,
    };
    let json = match serde_json::to_string(&entry) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize logout propagation");
            return;
        }
    };
    storage.set(&key, &json);
    debug!(key = %key, "published logout propagation");

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(LOGOUT_PROPAGATION_TTL).await;
                // Leave a newer entry from another tab alone.
                if storage.get(&key).as_deref() == Some(json.as_str()) {
                    storage.remove(&key);
                }
            });
        }
        Err(_) => warn!("no async runtime, logout propagation entry left for garbage collection"),
    }
}

/// Delete malformed and expired propagation entries of every configuration.
pub(crate) fn collect_garbage(storage: &dyn KeyValueStore, namespace: &str, now: DateTime<Utc>) {
    let prefix = keys::logout_propagation_prefix(namespace);
    for key in storage.keys().into_iter().filter(|k| k.starts_with(&prefix)) {
        let stale = match storage.get(&key) {
            Some(raw) => serde_json::from_str::<LogoutPropagation>(&raw)
                .map_or(true, |entry| entry.is_expired(now)),
            None => false,
        };
        if stale {
            debug!(key = %key, "removing stale logout propagation entry");
            storage.remove(&key);
        }
    }
}

/// Decide whether a storage event asks this tab to log out.
pub(crate) fn interpret(
    storage: &dyn KeyValueStore,
    event: &StorageEvent,
    own_key: &str,
    own_instance: AppInstanceId,
    now: DateTime<Utc>,
) -> Option<LogoutRedirect> {
    if event.key != own_key {
        return None;
    }
    let raw = event.new_value.as_deref()?;
    let entry = match serde_json::from_str::<LogoutPropagation>(raw) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(key = %own_key, error = %e, "deleting malformed logout propagation entry");
            storage.remove(own_key);
            return None;
        }
    };
    if entry.app_instance_id == own_instance || entry.is_expired(now) {
        return None;
    }
    Some(entry.redirect)
}

/// Run `on_logout` the first time another tab propagates a logout.
///
/// `events` must be subscribed before the session is handed out so no
/// propagation can slip in between.
pub(crate) async fn listen(
    storage: Arc<dyn KeyValueStore>,
    mut events: broadcast::Receiver<StorageEvent>,
    key: String,
    own_instance: AppInstanceId,
    on_logout: impl FnOnce(LogoutRedirect),
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(redirect) =
                    interpret(storage.as_ref(), &event, &key, own_instance, Utc::now())
                {
                    debug!("logout propagated from another tab");
                    on_logout(redirect);
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed storage events");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;

    fn config_id() -> ConfigurationId {
        ConfigurationId::new("https://idp.example.com", "spa")
    }

    fn entry(instance: AppInstanceId, expiration_time: i64) -> String {
        serde_json::to_string(&LogoutPropagation {
            app_instance_id: instance,
            expiration_time,
            redirect: LogoutRedirect::Home,
        })
        .unwrap()
    }

    #[test]
    fn test_interpret_ignores_own_entries() {
        let storage = MemoryStorage::new();
        let key = keys::logout_propagation("keyward", &config_id());
        let me = AppInstanceId::new();
        let now = Utc::now();
        let event = |value: String| StorageEvent {
            key: key.clone(),
            new_value: Some(value),
        };

        let fresh = now.timestamp_millis() + 5000;
        assert_eq!(interpret(&storage, &event(entry(me, fresh)), &key, me, now), None);
        assert_eq!(
            interpret(&storage, &event(entry(AppInstanceId::new(), fresh)), &key, me, now),
            Some(LogoutRedirect::Home)
        );
        let expired = now.timestamp_millis() - 1;
        assert_eq!(
            interpret(&storage, &event(entry(AppInstanceId::new(), expired)), &key, me, now),
            None
        );
    }

    #[test]
    fn test_interpret_deletes_malformed_entry() {
        let storage = MemoryStorage::new();
        let key = keys::logout_propagation("keyward", &config_id());
        storage.set(&key, "{not json");
        let event = StorageEvent {
            key: key.clone(),
            new_value: Some("{not json".into()),
        };

        assert_eq!(interpret(&storage, &event, &key, AppInstanceId::new(), Utc::now()), None);
        assert!(storage.get(&key).is_none());
    }

    #[test]
    fn test_collect_garbage() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let other = ConfigurationId::new("https://idp.example.com", "other");
        let live_key = keys::logout_propagation("keyward", &config_id());
        let expired_key = keys::logout_propagation("keyward", &other);
        let malformed_key = format!("{}ffffffffffffffff", keys::logout_propagation_prefix("keyward"));

        storage.set(&live_key, &entry(AppInstanceId::new(), now.timestamp_millis() + 5000));
        storage.set(&expired_key, &entry(AppInstanceId::new(), now.timestamp_millis() - 5000));
        storage.set(&malformed_key, "garbage");
        storage.set("unrelated", "garbage");

        collect_garbage(&storage, "keyward", now);

        assert!(storage.get(&live_key).is_some());
        assert!(storage.get(&expired_key).is_none());
        assert!(storage.get(&malformed_key).is_none());
        assert!(storage.get("unrelated").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_removes_entry_after_ttl() {
        let storage = Arc::new(MemoryStorage::new());
        let key = keys::logout_propagation("keyward", &config_id());

        publish(
            storage.clone(),
            "keyward",
            &config_id(),
            AppInstanceId::new(),
            LogoutRedirect::CurrentPage,
        );
        assert!(storage.get(&key).is_some());

        tokio::time::sleep(LOGOUT_PROPAGATION_TTL - Duration::from_millis(1)).await;
        assert!(storage.get(&key).is_some());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(storage.get(&key).is_none());
    }
}
