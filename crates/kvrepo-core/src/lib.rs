//! Typed data-access layer over a Redis-compatible store.
//!
//! A [`Repository`] owns a round-robin [`ConnectionPool`], a shared
//! [`ScriptCache`], and a [`RetryPolicy`]. Single-shot operations go
//! straight through it; [`TransactionBatch`] groups operations into one
//! atomic submission with a [`DeferredResult`] per operation.
//!
//! # Modules
//!
//! - [`repository`] -- Typed single-shot operations
//! - [`batch`] -- Transaction batches and deferred results
//! - [`script`] -- Slot-name rewriting and the reload-on-eviction script cache
//! - [`pool`] -- Round-robin connection pool
//! - [`retry`] -- Bounded retry with linear backoff
//! - [`config`] -- YAML configuration with environment overrides
//! - [`replies`] -- Reply decoders shared by repositories and batches
//! - [`error`] -- [`RepoError`] and retry classification

pub mod batch;
pub mod config;
pub mod error;
pub mod pool;
pub mod replies;
pub mod repository;
pub mod retry;
pub mod script;

pub use batch::{BatchState, DeferredResult, TransactionBatch};
pub use config::{ConfigError, RepoConfig};
pub use error::RepoError;
pub use pool::{ConnectionPool, ConnectionSlot};
pub use repository::Repository;
pub use retry::{NO_RETRIES, RetryPolicy};
pub use script::{PreparedScript, ScriptCache, ScriptHandle};
