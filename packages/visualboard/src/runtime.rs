//! Extension runtime liveness.
//!
//! A page can outlive the extension that injected into it: after an
//! extension reload every privileged handle held by the old content script
//! is permanently dead. Every privileged call goes through [`guarded`], which
//! checks liveness once up front and normalizes invalidation failures.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, VisualboardError};

/// Signatures the browser uses when the extension context is gone for good.
const CONTEXT_INVALIDATED_SIGNATURES: &[&str] = &[
    "extension context invalidated",
    "context invalidated",
];

/// Signatures of a single failed delivery; the context itself survives.
const CHANNEL_CLOSED_SIGNATURES: &[&str] = &[
    "message port closed",
    "receiving end does not exist",
    "could not establish connection",
    "message channel closed",
];

pub fn is_context_invalidated_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONTEXT_INVALIDATED_SIGNATURES
        .iter()
        .any(|sig| lower.contains(sig))
}

pub fn is_channel_closed_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    CHANNEL_CLOSED_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Handle to the privileged extension runtime.
pub trait RuntimeHandle: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// In-process runtime handle: alive until [`LiveRuntime::invalidate`] is
/// called, after which every clone reports dead.
#[derive(Debug, Clone)]
pub struct LiveRuntime {
    alive: Arc<AtomicBool>,
}

impl LiveRuntime {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates an extension reload under a live page.
    pub fn invalidate(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::warn!("Extension runtime invalidated");
        }
    }
}

impl Default for LiveRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeHandle for LiveRuntime {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Run a privileged operation. Fails fast with `ContextInvalidated` when the
/// runtime is dead, and maps invalidation-shaped failures to the same variant.
pub async fn guarded<R, F, T>(runtime: &R, op: F) -> Result<T>
where
    R: RuntimeHandle + ?Sized,
    F: Future<Output = Result<T>>,
{
    if !runtime.is_alive() {
        return Err(VisualboardError::ContextInvalidated);
    }
    match op.await {
        Err(e) if e.is_context_invalidated() => Err(VisualboardError::ContextInvalidated),
        other => other,
    }
}
