//! In-memory host implementations.
//!
//! Used by tests and by native embedders. Several "tabs" are simulated by
//! sharing one [`MemoryStorage`] (as `localStorage`) and one
//! [`MemoryBroadcastHub`] between hosts that each own their session
//! storage and navigator.

use crate::host::{BroadcastHub, FrameHost, Host, KeyValueStore, Navigator, StorageEvent};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use url::Url;

const EVENT_CAPACITY: usize = 256;

/// Key-value store backed by a `BTreeMap`.
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value,
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        self.notify(key, Some(value.to_string()));
    }

    fn remove(&self, key: &str) {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

/// Broadcast channels keyed by name.
#[derive(Default)]
pub struct MemoryBroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl MemoryBroadcastHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }
}

impl BroadcastHub for MemoryBroadcastHub {
    fn post(&self, channel: &str, message: Value) {
        let _ = self.sender(channel).send(message);
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.sender(channel).subscribe()
    }
}

/// Navigator that records every navigation instead of leaving the page.
pub struct MemoryNavigator {
    current: Mutex<Url>,
    redirects: Mutex<Vec<Url>>,
}

impl MemoryNavigator {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            current: Mutex::new(url),
            redirects: Mutex::new(Vec::new()),
        }
    }

    /// Every URL passed to [`Navigator::redirect`], oldest first.
    #[must_use]
    pub fn redirects(&self) -> Vec<Url> {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn last_redirect(&self) -> Option<Url> {
        self.redirects().pop()
    }

    /// Simulate a page load at `url`.
    pub fn load(&self, url: Url) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = url;
    }
}

impl Navigator for MemoryNavigator {
    fn current_url(&self) -> Url {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_url(&self, url: &Url) {
        self.load(url.clone());
    }

    fn redirect(&self, url: &Url) {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());
    }
}

type FrameResponder = dyn Fn(&Url) -> Option<Value> + Send + Sync;

/// Frame host whose "frames" answer through a closure.
///
/// The closure plays the role of the authorization server plus the
/// redirect page: given the frame URL it returns the message the frame
/// would post back, or `None` to stay silent. Frames stay open until the
/// host is dropped.
///
/// [`MemoryFrameHost::page_in_last_frame`] gives the frame host of the page
/// loaded inside a frame, so both sides can run the real engine.
pub struct MemoryFrameHost {
    responder: Box<FrameResponder>,
    opened: Mutex<Vec<(Url, mpsc::UnboundedSender<Value>)>>,
    parent: Option<mpsc::UnboundedSender<Value>>,
}

impl MemoryFrameHost {
    pub fn new(responder: impl Fn(&Url) -> Option<Value> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            opened: Mutex::new(Vec::new()),
            parent: None,
        }
    }

    /// A host whose frames never answer.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(|_| None)
    }

    /// URLs of every frame opened so far.
    #[must_use]
    pub fn opened(&self) -> Vec<Url> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Frame host of the page running inside the most recently opened frame.
    /// Its [`FrameHost::post_to_parent`] messages reach the opener.
    #[must_use]
    pub fn page_in_last_frame(&self) -> Option<Self> {
        let opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, parent) = opened.last()?;
        Some(Self {
            responder: Box::new(|_| None),
            opened: Mutex::new(Vec::new()),
            parent: Some(parent.clone()),
        })
    }
}

impl FrameHost for MemoryFrameHost {
    fn is_framed(&self) -> bool {
        self.parent.is_some()
    }

    fn post_to_parent(&self, message: Value) {
        if let Some(parent) = &self.parent {
            // The opener may have given up already.
            let _ = parent.send(message);
        }
    }

    fn open_hidden_frame(&self, url: &Url) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(message) = (self.responder)(url) {
            let _ = tx.send(message);
        }
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.clone(), tx));
        rx
    }
}

/// Handles to the in-memory parts of one simulated tab.
pub struct MemoryTab {
    pub host: Host,
    pub local_storage: Arc<MemoryStorage>,
    pub session_storage: Arc<MemoryStorage>,
    pub broadcast: Arc<MemoryBroadcastHub>,
    pub navigator: Arc<MemoryNavigator>,
    pub frames: Arc<MemoryFrameHost>,
}

impl MemoryTab {
    /// A single tab at `url` with silent frames.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self::sharing(
            url,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryBroadcastHub::new()),
            Arc::new(MemoryFrameHost::silent()),
        )
    }

    /// A tab sharing `localStorage` and broadcast channels with others.
    #[must_use]
    pub fn sharing(
        url: Url,
        local_storage: Arc<MemoryStorage>,
        broadcast: Arc<MemoryBroadcastHub>,
        frames: Arc<MemoryFrameHost>,
    ) -> Self {
        let session_storage = Arc::new(MemoryStorage::new());
        let navigator = Arc::new(MemoryNavigator::new(url));
        let host = Host::new(
            local_storage.clone(),
            session_storage.clone(),
            broadcast.clone(),
            navigator.clone(),
            frames.clone(),
        );
        Self {
            host,
            local_storage,
            session_storage,
            broadcast,
            navigator,
            frames,
        }
    }

    /// Another tab of the same origin.
    #[must_use]
    pub fn sibling(&self, url: Url) -> Self {
        Self::sharing(
            url,
            self.local_storage.clone(),
            self.broadcast.clone(),
            self.frames.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_notifies_on_set_and_remove() {
        let storage = MemoryStorage::new();
        let mut events = storage.subscribe();

        storage.set("a", "1");
        storage.remove("a");
        storage.remove("a");

        assert_eq!(
            events.recv().await.unwrap(),
            StorageEvent {
                key: "a".into(),
                new_value: Some("1".into())
            }
        );
        assert_eq!(events.recv().await.unwrap().new_value, None);
        assert!(events.try_recv().is_err());
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_channels_are_isolated() {
        let hub = MemoryBroadcastHub::new();
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        hub.post("a", serde_json::json!({"n": 1}));

        assert_eq!(a.recv().await.unwrap()["n"], 1);
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_navigator_records_redirects() {
        let nav = MemoryNavigator::new(Url::parse("https://app.example.com/").unwrap());
        nav.redirect(&Url::parse("https://idp.example.com/auth").unwrap());
        nav.replace_url(&Url::parse("https://app.example.com/page").unwrap());

        assert_eq!(nav.redirects().len(), 1);
        assert_eq!(nav.current_url().path(), "/page");
    }

    #[test]
    fn test_sibling_tabs_share_local_storage_only() {
        let tab_a = MemoryTab::new(Url::parse("https://app.example.com/").unwrap());
        let tab_b = tab_a.sibling(Url::parse("https://app.example.com/other").unwrap());

        tab_a.host.local_storage.set("shared", "yes");
        tab_a.host.session_storage.set("private", "yes");

        assert_eq!(tab_b.host.local_storage.get("shared").as_deref(), Some("yes"));
        assert!(tab_b.host.session_storage.get("private").is_none());
    }

    #[tokio::test]
    async fn test_framed_page_posts_to_opener() {
        let opener = MemoryFrameHost::silent();
        assert!(!opener.is_framed());
        assert!(opener.page_in_last_frame().is_none());

        let mut frame = opener.open_hidden_frame(&Url::parse("https://idp.example.com/auth").unwrap());
        let inner = opener.page_in_last_frame().unwrap();
        assert!(inner.is_framed());

        inner.post_to_parent(serde_json::json!({"hello": "parent"}));
        assert_eq!(frame.recv().await.unwrap()["hello"], "parent");

        // Not framed: nothing to post to.
        opener.post_to_parent(serde_json::json!({}));
    }
}
