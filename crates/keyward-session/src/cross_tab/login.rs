use crate::host::BroadcastHub;
use crate::keys;
use keyward_core::{AppInstanceId, ConfigurationId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginPropagation {
    app_instance_id: AppInstanceId,
    configuration_id: ConfigurationId,
}

/// Tell other tabs that this one just completed an interactive login.
pub(crate) fn publish(
    hub: &dyn BroadcastHub,
    namespace: &str,
    config_id: &ConfigurationId,
    app_instance_id: AppInstanceId,
) {
    let message = LoginPropagation {
        app_instance_id,
        configuration_id: config_id.clone(),
    };
    match serde_json::to_value(&message) {
        Ok(value) => hub.post(&keys::login_propagation_channel(namespace, config_id), value),
        Err(e) => tracing::error!(error = %e, "failed to serialize login propagation"),
    }
}

/// Resolves when another tab logs in with the same configuration.
///
/// Never resolves if the broadcast hub goes away.
pub(crate) async fn wait_for_login(
    hub: &dyn BroadcastHub,
    namespace: &str,
    config_id: &ConfigurationId,
    app_instance_id: AppInstanceId,
) {
    let mut rx = hub.subscribe(&keys::login_propagation_channel(namespace, config_id));
    loop {
        match rx.recv().await {
            Ok(value) => match serde_json::from_value::<LoginPropagation>(value) {
                Ok(message)
                    if message.app_instance_id != app_instance_id
                        && &message.configuration_id == config_id =>
                {
                    debug!(from = %message.app_instance_id, "login completed in another tab");
                    return;
                }
                _ => {}
            },
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
