//! Persistence backends for the offline sync core.
//!
//! This module provides a trait-based interface for the durable stores the
//! core writes to (the action queue and the read cache) and a backend
//! way to select a backend from configuration.
//!
//! # Design Principles
//! - Whole-blob writes: each store is rewritten in full on every mutation
//! - Async operations: all I/O is async
//! - Unified error semantics: consistent error types across backends

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use provider::{load_json, store_json, validate_key, StorageBackend};
pub use registry::{open_backend, BackendKind};
