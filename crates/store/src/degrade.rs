//! Log-once bookkeeping for components that degrade on store failures.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Emits a `warn!` for the first store failure a component sees, then
/// drops to `debug!` so a dead store does not flood the logs.
#[derive(Debug)]
pub struct DegradeLog {
    component: &'static str,
    warned: AtomicBool,
}

impl DegradeLog {
    pub const fn new(component: &'static str) -> Self {
        Self {
            component,
            warned: AtomicBool::new(false),
        }
    }

    pub fn report(&self, operation: &str, error: &dyn std::fmt::Display) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                component = self.component,
                operation,
                error = %error,
                "Store unavailable, continuing without it"
            );
        } else {
            debug!(component = self.component, operation, error = %error, "Store call skipped");
        }
    }

    /// Whether a failure has been reported at least once.
    pub fn has_degraded(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }
}
