//! # loomi core
//!
//! Domain types, traits, and error definitions for the loomi agent runtime.
//! This crate has **no framework dependencies** beyond async plumbing. It
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here: the streaming model client,
//! the key-value store, the notes backend, the event sink. Implementations
//! live in their own crates, and tests pass in fakes.

pub mod action;
pub mod error;
pub mod event;
pub mod kv;
pub mod message;
pub mod notes;
pub mod provider;
pub mod request;

// Re-export key types at crate root for ergonomics
pub use action::ActionKind;
pub use error::{Error, ProviderError, Result, StoreError};
pub use event::{ContentKind, EventSink, EventType, StreamEvent};
pub use kv::KvStore;
pub use message::{Message, Role};
pub use notes::{Note, NotesBackend};
pub use provider::{
    CallContext, ChunkHandler, ModelClient, ModelRequest, StreamChunk, Usage, safe_stream_call,
};
pub use request::{ActionItem, AgentRequest, SessionKey};
