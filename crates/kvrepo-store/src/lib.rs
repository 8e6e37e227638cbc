//! Store boundary for the kvrepo data-access layer.
//!
//! Everything above this crate works in terms of [`Command`]s and
//! [`Reply`](kvrepo_types::Reply)s over a [`Connection`]. Below it sit two
//! backends: a `fred` client per connection for a real Redis-compatible
//! server, and [`MemoryStore`], an in-process implementation with the same
//! observable semantics for tests and local runs.
//!
//! # Modules
//!
//! - [`command`] -- The closed command vocabulary and its wire rendering
//! - [`connection`] -- [`Connection`] enum dispatch, [`Endpoint`], the remote backend
//! - [`memory`] -- [`MemoryStore`] and its connections
//! - [`error`] -- [`StoreError`] and transient/fatal classification

pub mod command;
pub mod connection;
pub mod error;
pub mod memory;

pub use command::{Command, Limit, Precondition};
pub use connection::{Connection, Endpoint, RemoteConnection, Timeouts};
pub use error::StoreError;
pub use memory::{MemoryConnection, MemoryStore, ScriptCall, ScriptHandler, script_sha};
