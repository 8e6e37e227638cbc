//! Connections to the store.
//!
//! [`Connection`] dispatches over the two backends with an enum rather than a
//! trait object, so the async methods stay plain `async fn`s:
//!
//! - [`RemoteConnection`] wraps one `fred` client (one physical connection)
//!   and bounds every call by the command timeout.
//! - [`MemoryConnection`] talks to an in-process [`MemoryStore`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fred::prelude::*;
use fred::types::{ClusterHash, CustomCommand, Resp3Frame};
use kvrepo_types::Reply;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::{Command, Precondition};
use crate::error::StoreError;
use crate::memory::{MemoryConnection, MemoryStore};

/// Where connections are opened.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A Redis-compatible server, e.g. `redis://localhost:6379/0`.
    Url(String),
    /// An in-process store shared by every connection opened on it.
    Memory(MemoryStore),
}

impl Endpoint {
    /// Short description for logs; never includes credentials.
    pub fn describe(&self) -> &str {
        match self {
            Self::Url(url) => url
                .split_once('@')
                .map_or(url.as_str(), |(_, host)| host),
            Self::Memory(_) => "memory",
        }
    }
}

/// Per-connection time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Limit for establishing the connection.
    pub connect: Duration,
    /// Limit for each command or transaction.
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Remote backend
// =============================================================================

/// One connection to a remote server.
///
/// Single commands share the connection freely. A transaction holds it
/// exclusively from `WATCH` to `EXEC`, so no other command can be queued
/// inside it or reset its watches.
#[derive(Clone)]
pub struct RemoteConnection {
    client: Client,
    command_timeout: Duration,
    gate: Arc<RwLock<()>>,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

fn custom_command(command: &Command) -> CustomCommand {
    CustomCommand::new_static(command.name(), ClusterHash::FirstKey, false)
}

fn control(name: &'static str) -> CustomCommand {
    CustomCommand::new_static(name, ClusterHash::FirstKey, false)
}

fn wire_args(command: &Command) -> Vec<Value> {
    command
        .args()
        .into_iter()
        .map(|arg| Value::Bytes(Bytes::from(arg)))
        .collect()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Convert a raw response frame into a [`Reply`].
///
/// Error frames nested in an array stay in place as [`Reply::Error`], which
/// keeps per-command failures inside an `EXEC` reply.
pub fn reply_from_frame(frame: Resp3Frame) -> Reply {
    match frame {
        Resp3Frame::Null | Resp3Frame::Hello { .. } => Reply::Nil,
        Resp3Frame::Number { data, .. } => Reply::Integer(data),
        Resp3Frame::Double { data, .. } => Reply::Double(data),
        Resp3Frame::Boolean { data, .. } => Reply::Integer(i64::from(data)),
        Resp3Frame::SimpleString { data, .. } => Reply::Status(lossy(&data)),
        Resp3Frame::SimpleError { data, .. } => Reply::Error(String::from(&*data)),
        Resp3Frame::BlobError { data, .. } => Reply::Error(lossy(&data)),
        Resp3Frame::BlobString { data, .. }
        | Resp3Frame::BigNumber { data, .. }
        | Resp3Frame::VerbatimString { data, .. }
        | Resp3Frame::ChunkedString(data) => Reply::Bulk(data.to_vec()),
        Resp3Frame::Array { data, .. } | Resp3Frame::Push { data, .. } => {
            Reply::Array(data.into_iter().map(reply_from_frame).collect())
        }
        Resp3Frame::Set { data, .. } => Reply::Array(data.into_iter().map(reply_from_frame).collect()),
        Resp3Frame::Map { data, .. } => Reply::Array(
            data.into_iter()
                .flat_map(|(key, value)| [reply_from_frame(key), reply_from_frame(value)])
                .collect(),
        ),
    }
}

impl RemoteConnection {
    /// Connect one client to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] if the URL is invalid, the server is
    /// unreachable, or the connect timeout elapses.
    pub async fn connect(url: &str, timeouts: Timeouts) -> Result<Self, StoreError> {
        let config = Config::from_url(url)
            .map_err(|e| StoreError::Connect(format!("invalid store URL: {e}")))?;
        let client = Builder::from_config(config)
            .build()
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        let failure = match timeout(timeouts.connect, client.init()).await {
            Ok(Ok(_handle)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_elapsed) => Some(format!("timed out after {}ms", timeouts.connect.as_millis())),
        };
        if let Some(reason) = failure {
            warn!(reason = %reason, "Store connection failed");
            return Err(StoreError::Connect(reason));
        }

        debug!(
            command_timeout_ms = timeouts.command.as_millis(),
            "Connected to store"
        );
        Ok(Self {
            client,
            command_timeout: timeouts.command,
            gate: Arc::new(RwLock::new(())),
        })
    }

    async fn send(&self, command: CustomCommand, args: Vec<Value>) -> Result<Resp3Frame, StoreError> {
        let call = self.client.custom_raw(command, args);
        Ok(timeout(self.command_timeout, call).await??)
    }

    async fn call(&self, command: &Command) -> Result<Reply, StoreError> {
        match reply_from_frame(self.send(custom_command(command), wire_args(command)).await?) {
            Reply::Error(message) => Err(StoreError::from_reply(&message)),
            reply => Ok(reply),
        }
    }

    /// Run one command.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] when the command timeout elapses,
    /// otherwise the classified client or server error.
    pub async fn execute(&self, command: &Command) -> Result<Reply, StoreError> {
        let _shared = self.gate.read().await;
        self.call(command).await
    }

    /// Submit `commands` inside `MULTI`/`EXEC`, guarded by `preconditions`.
    ///
    /// The preconditions are watched and re-read first; if any no longer
    /// holds, nothing is queued and `Ok(None)` is returned. `Ok(None)` is
    /// also returned when a watched key changes before `EXEC`.
    ///
    /// # Errors
    ///
    /// Failures before `EXEC` is sent keep their classification, so a
    /// timeout there is transient. A rejected transaction is
    /// [`StoreError::Aborted`]; an `EXEC` without a reply is
    /// [`StoreError::Unconfirmed`]. Neither is transient.
    pub async fn submit(
        &self,
        preconditions: &[Precondition],
        commands: &[Command],
    ) -> Result<Option<Vec<Reply>>, StoreError> {
        let _exclusive = self.gate.write().await;
        if !preconditions.is_empty() && !self.watch(preconditions).await? {
            return Ok(None);
        }
        self.queue(commands).await?;

        let frame = match self.send(control("EXEC"), Vec::new()).await {
            Ok(frame) => frame,
            Err(StoreError::Timeout) => {
                return Err(StoreError::Unconfirmed("no reply to EXEC".to_owned()));
            }
            Err(StoreError::Io(message)) => return Err(StoreError::Unconfirmed(message)),
            Err(StoreError::Server(message)) => return Err(StoreError::Aborted(message)),
            Err(err) => return Err(err),
        };
        match reply_from_frame(frame) {
            Reply::Nil => {
                debug!(operations = commands.len(), "Watched key changed; EXEC discarded");
                Ok(None)
            }
            Reply::Array(replies) => Ok(Some(replies)),
            Reply::Error(message) => Err(StoreError::Aborted(message)),
            other => Err(StoreError::Protocol(format!("unexpected EXEC reply: {other:?}"))),
        }
    }

    /// `WATCH` the precondition keys and check them. Returns `false`, with
    /// the watches released, when one no longer holds.
    async fn watch(&self, preconditions: &[Precondition]) -> Result<bool, StoreError> {
        let keys = preconditions.iter().map(|p| p.key().to_owned()).collect();
        self.call(&Command::Watch { keys }).await?;

        let held = self.check(preconditions).await;
        if !matches!(held, Ok(true)) {
            self.release(&Command::Unwatch).await;
        }
        held
    }

    async fn check(&self, preconditions: &[Precondition]) -> Result<bool, StoreError> {
        for precondition in preconditions {
            if !precondition.holds(self.call(&precondition.read()).await)? {
                debug!(key = precondition.key(), "Precondition no longer holds");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Best-effort reset of transaction state after a failed submission.
    async fn release(&self, command: &Command) {
        if let Err(err) = self.call(command).await {
            warn!(command = command.name(), error = %err, "Releasing transaction state failed");
        }
    }

    /// Send `MULTI` and the commands in one pipeline.
    async fn queue(&self, commands: &[Command]) -> Result<(), StoreError> {
        let pipeline = self.client.pipeline();
        let _: () = pipeline.custom(control("MULTI"), Vec::<Value>::new()).await?;
        for command in commands {
            let _: () = pipeline
                .custom(custom_command(command), wire_args(command))
                .await?;
        }
        let rejected = match timeout(self.command_timeout, pipeline.try_all::<Value>()).await {
            Ok(results) => results.into_iter().find_map(Result::err).map(StoreError::from),
            Err(elapsed) => Some(StoreError::from(elapsed)),
        };
        let Some(err) = rejected else {
            return Ok(());
        };

        if let Err(discard) = self.send(control("DISCARD"), Vec::new()).await {
            debug!(error = %discard, "DISCARD failed");
            self.release(&Command::Unwatch).await;
        }
        Err(match err {
            StoreError::Server(message) => StoreError::Aborted(message),
            other => other,
        })
    }

    /// Close the client.
    ///
    /// # Errors
    ///
    /// Returns the classified client error if `QUIT` fails.
    pub async fn quit(&self) -> Result<(), StoreError> {
        timeout(self.command_timeout, self.client.quit()).await??;
        Ok(())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// A connection to either backend.
#[derive(Debug)]
pub enum Connection {
    /// A `fred` client.
    Remote(RemoteConnection),
    /// An in-process store connection.
    Memory(MemoryConnection),
}

impl Connection {
    /// Open a connection to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] if a remote connection cannot be
    /// established. Memory connections always succeed.
    pub async fn open(endpoint: &Endpoint, timeouts: Timeouts) -> Result<Self, StoreError> {
        match endpoint {
            Endpoint::Url(url) => Ok(Self::Remote(RemoteConnection::connect(url, timeouts).await?)),
            Endpoint::Memory(store) => Ok(Self::Memory(store.connect())),
        }
    }

    /// Run one command. Error replies become [`StoreError`]s.
    ///
    /// # Errors
    ///
    /// See [`StoreError`] for the classification.
    pub async fn execute(&self, command: &Command) -> Result<Reply, StoreError> {
        match self {
            Self::Remote(conn) => conn.execute(command).await,
            Self::Memory(conn) => conn.execute(command),
        }
    }

    /// Apply `commands` atomically if every precondition still holds.
    /// `Ok(None)` means one did not and nothing was applied.
    ///
    /// Watching, checking and `EXEC` run as one exclusive step on this
    /// connection, so every submission carries its own watches.
    ///
    /// # Errors
    ///
    /// See [`StoreError`] for the classification.
    pub async fn submit(
        &self,
        preconditions: &[Precondition],
        commands: &[Command],
    ) -> Result<Option<Vec<Reply>>, StoreError> {
        match self {
            Self::Remote(conn) => conn.submit(preconditions, commands).await,
            Self::Memory(conn) => conn.submit(preconditions, commands).await,
        }
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if closing fails.
    pub async fn quit(&self) -> Result<(), StoreError> {
        match self {
            Self::Remote(conn) => conn.quit().await,
            Self::Memory(conn) => conn.quit(),
        }
    }
}
