//! Host environment abstraction.
//!
//! The engine never touches browser globals directly. Storage, broadcast
//! channels, navigation and hidden frames are injected through these traits
//! so the same code runs against a WASM binding or the in-memory doubles in
//! [`crate::memory`].

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use url::Url;

/// A change to a key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Synchronous string store with change notifications (`localStorage`,
/// `sessionStorage`).
///
/// Subscribers may also observe changes made through the same handle;
/// consumers identify their own writes by app instance id.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn remove(&self, key: &str);

    fn keys(&self) -> Vec<String>;

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Named same-origin message channels (`BroadcastChannel`).
pub trait BroadcastHub: Send + Sync {
    fn post(&self, channel: &str, message: Value);

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value>;
}

/// Page location and navigation.
pub trait Navigator: Send + Sync {
    fn current_url(&self) -> Url;

    /// Rewrite the address bar without reloading (`history.replaceState`).
    fn replace_url(&self, url: &Url);

    /// Leave the page (`location.assign`). The caller should expect to be unloaded.
    fn redirect(&self, url: &Url);
}

/// Hidden iframes used for silent restoration, seen from both sides.
pub trait FrameHost: Send + Sync {
    /// Load `url` in a hidden frame. Messages the frame posts to its parent
    /// arrive on the returned channel; dropping it tears the frame down.
    fn open_hidden_frame(&self, url: &Url) -> mpsc::UnboundedReceiver<Value>;

    /// Whether this page itself runs inside a frame (`window.parent !== window`).
    fn is_framed(&self) -> bool {
        false
    }

    /// `window.parent.postMessage` restricted to this origin. Ignored when not framed.
    fn post_to_parent(&self, _message: Value) {}
}

/// All host capabilities a session needs.
#[derive(Clone)]
pub struct Host {
    pub local_storage: Arc<dyn KeyValueStore>,
    pub session_storage: Arc<dyn KeyValueStore>,
    pub broadcast: Arc<dyn BroadcastHub>,
    pub navigator: Arc<dyn Navigator>,
    pub frames: Arc<dyn FrameHost>,
}

impl Host {
    pub fn new(
        local_storage: Arc<dyn KeyValueStore>,
        session_storage: Arc<dyn KeyValueStore>,
        broadcast: Arc<dyn BroadcastHub>,
        navigator: Arc<dyn Navigator>,
        frames: Arc<dyn FrameHost>,
    ) -> Self {
        Self {
            local_storage,
            session_storage,
            broadcast,
            navigator,
            frames,
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("current_url", &self.navigator.current_url().as_str())
            .finish_non_exhaustive()
    }
}
