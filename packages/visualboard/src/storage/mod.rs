//! Durable key/value storage shared by the extension contexts.
//!
//! Every context sees the same store. Writers are partitioned by key family:
//! the Content Bridge owns the chat log / bot context keys ([`ChatLogStore`]),
//! the Side Panel owns the board keys ([`BoardStore`]).

mod board;
mod chat_logs;
mod file;
pub mod keys;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::runtime::{guarded, RuntimeHandle};

pub use board::BoardStore;
pub use chat_logs::ChatLogStore;
pub use file::FileStore;
pub use memory::MemoryStore;

/// Awaitable key/value storage holding JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Store wrapper that checks runtime liveness before every call.
pub struct GuardedStore {
    inner: Arc<dyn KeyValueStore>,
    runtime: Arc<dyn RuntimeHandle>,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, runtime: Arc<dyn RuntimeHandle>) -> Self {
        Self { inner, runtime }
    }
}

#[async_trait]
impl KeyValueStore for GuardedStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        guarded(self.runtime.as_ref(), self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        guarded(self.runtime.as_ref(), self.inner.set(key, value)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        guarded(self.runtime.as_ref(), self.inner.remove(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VisualboardError;
    use crate::runtime::LiveRuntime;
    use serde_json::json;

    #[tokio::test]
    async fn guarded_store_stops_after_invalidation() {
        let runtime = LiveRuntime::new();
        let inner = Arc::new(MemoryStore::new());
        let store = GuardedStore::new(inner.clone(), Arc::new(runtime.clone()));

        store.set("k", json!(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));

        runtime.invalidate();
        let err = store.set("k", json!(2)).await.unwrap_err();
        assert!(matches!(err, VisualboardError::ContextInvalidated));
        assert_eq!(inner.get("k").await.unwrap(), Some(json!(1)));
    }
}
