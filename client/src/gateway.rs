//! Remote Data Gateway: the client's only view of the backend.

use harbor_engine::{GatewayError, MutationAck, MutationRecord, QueryKey};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Receives real-time changes: the key that changed and its new value.
pub type PushHandler = Arc<dyn Fn(QueryKey, Value) + Send + Sync>;

/// Backend operations the data layer consumes.
///
/// `mutate` must deduplicate by `record.id`: delivering the same record twice
/// applies it once and answers both deliveries alike.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    /// Fetch the current value of a query, routed on its key.
    async fn query(&self, key: &QueryKey) -> Result<Value, GatewayError>;

    /// Apply a queued mutation.
    async fn mutate(&self, record: &MutationRecord) -> Result<MutationAck, GatewayError>;

    /// Watch every key starting with `prefix`.
    fn subscribe(&self, prefix: &QueryKey, handler: PushHandler) -> Subscription;
}

/// Disposer for a real-time subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
