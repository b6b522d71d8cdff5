//! Shared encoder handle
//!
//! The encoder is shared-read, exclusive-write. Promotion builds a complete
//! new encoder first, then replaces the inner `Arc` inside a short exclusive
//! section; in-flight embeds keep their clone and finish on the old weights.

use std::sync::{Arc, RwLock};

use super::ImageEncoder;

/// Atomically swappable handle to the active encoder
#[derive(Clone)]
pub struct EmbedderHandle {
    inner: Arc<RwLock<Arc<dyn ImageEncoder>>>,
}

impl EmbedderHandle {
    /// Wrap an encoder in a shared handle
    pub fn new(encoder: Arc<dyn ImageEncoder>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(encoder)),
        }
    }

    /// Clone the current encoder reference
    ///
    /// Callers hold the clone across their forward pass; a concurrent swap
    /// does not affect them.
    pub fn current(&self) -> Arc<dyn ImageEncoder> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the active encoder
    pub fn swap(&self, encoder: Arc<dyn ImageEncoder>) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let old = guard.version().to_string();
        tracing::info!(from = %old, to = %encoder.version(), "encoder handle swapped");
        *guard = encoder;
    }

    /// Version tag of the active encoder
    pub fn version(&self) -> String {
        self.current().version().to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================
