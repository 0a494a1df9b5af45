//! Key-value and notes backends for loomi.

pub mod degrade;
pub mod glob;
pub mod in_memory;
pub mod noop;
pub mod notes;
pub mod pool;

pub use degrade::DegradeLog;
pub use glob::{glob_escape, glob_match};
pub use in_memory::InMemoryKv;
pub use noop::NoopKv;
pub use notes::InMemoryNotes;
pub use pool::{PoolClass, PoolManager, PoolSizes, PooledClient};

use loomi_core::kv::KvStore;
use std::sync::Arc;

/// Build a key-value backend by configured name. Unknown names fall back to
/// the no-op backend.
pub fn kv_from_name(name: &str) -> Arc<dyn KvStore> {
    match name {
        "memory" => Arc::new(InMemoryKv::new()),
        "none" => Arc::new(NoopKv),
        other => {
            tracing::warn!(backend = other, "Unknown store backend, disabling persistence");
            Arc::new(NoopKv)
        }
    }
}
