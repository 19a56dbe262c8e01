//! Per-page state shared by every client configuration.

use crate::inflight::InFlightRegistry;
use keyward_core::AppInstanceId;
use std::sync::Arc;

/// One per page load. Clone freely; clones share the same instance.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug, Default)]
struct ContextInner {
    app_instance_id: AppInstanceId,
    in_flight: Arc<InFlightRegistry>,
}

impl ClientContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn app_instance_id(&self) -> AppInstanceId {
        self.inner.app_instance_id
    }

    #[must_use]
    pub fn in_flight(&self) -> &Arc<InFlightRegistry> {
        &self.inner.in_flight
    }
}
