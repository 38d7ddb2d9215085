//! Shared primitives for the Ohana infrastructure crates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod logging;

// ============================================================================
// Resource Health
// ============================================================================

/// Shared "unhealthy" bit for a pooled resource.
///
/// Transport listeners and failing operations flip the flag; the owning
/// pool's validation step reads it before lending the resource again.
/// Clones share the same underlying bit.
#[derive(Debug, Clone, Default)]
pub struct HealthFlag {
    unhealthy: Arc<AtomicBool>,
}

impl HealthFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::SeqCst);
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_unhealthy()
    }
}
