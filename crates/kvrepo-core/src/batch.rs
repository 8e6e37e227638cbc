//! Transaction batches with deferred, typed results.
//!
//! A [`TransactionBatch`] records operations against one pooled connection
//! and submits them together inside `MULTI`/`EXEC`. Every record call hands
//! back a [`DeferredResult`] bound to the operation's position; it becomes
//! readable once [`TransactionBatch::execute`] has committed.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start()--> Recording --execute()--> Executed
//!                       ^                        |
//!                       +-------start()----------+
//! ```
//!
//! Recording is only valid in `Recording`; `execute` runs once per `start`.
//! Restarting discards the previous results: handles from the earlier round
//! report [`RepoError::ResultDiscarded`].
//!
//! Results are decoded after `EXEC` in one pass over the replies, each with
//! the decoder stored when its operation was recorded.
//!
//! Watched keys are held by the batch, not the connection. Each submission
//! attempt re-watches them and compares them with the values seen by
//! [`TransactionBatch::watch`] while it holds the connection exclusively, so
//! neither a retry nor another batch on the same pool slot can drop them.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use kvrepo_store::{Command, Limit, Precondition};
use kvrepo_types::{
    Aggregation, CodecError, KeySpace, Reply, ScoreRange, ScriptArgs, SetOperation, SortOrder,
    When, WireCodec,
};
use tracing::{debug, warn};

use crate::error::RepoError;
use crate::pool::{ConnectionPool, ConnectionSlot};
use crate::replies::{self, Decoder};
use crate::retry::RetryPolicy;
use crate::script::ScriptCache;

/// Where a batch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    /// Created, not started.
    Idle,
    /// Accepting operations.
    Recording,
    /// Submitted; results are readable if the commit succeeded.
    Executed,
}

// =============================================================================
// Deferred results
// =============================================================================

#[derive(Debug)]
enum SlotState {
    Pending,
    Ready(Arc<Vec<Reply>>),
    Discarded,
}

type ResultSlot = Arc<RwLock<SlotState>>;

fn read_slot(slot: &RwLock<SlotState>) -> RwLockReadGuard<'_, SlotState> {
    slot.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_slot(slot: &RwLock<SlotState>) -> RwLockWriteGuard<'_, SlotState> {
    slot.write().unwrap_or_else(PoisonError::into_inner)
}

/// The result of one recorded operation, readable after the batch executes.
pub struct DeferredResult<T> {
    slot: ResultSlot,
    position: usize,
    decode: Decoder<T>,
}

impl<T> fmt::Debug for DeferredResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredResult")
            .field("position", &self.position)
            .field("type", &type_name::<T>())
            .finish_non_exhaustive()
    }
}

impl<T> DeferredResult<T> {
    /// Position of the operation in its batch.
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Returns `true` once the owning batch has committed.
    pub fn is_ready(&self) -> bool {
        matches!(*read_slot(&self.slot), SlotState::Ready(_))
    }

    /// Decode the result.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::ResultPending`] before the batch has committed,
    /// [`RepoError::ResultDiscarded`] if the batch was restarted or failed to
    /// commit, and [`RepoError::Decode`] if the reply is not a `T`.
    pub fn into_value(self) -> Result<T, RepoError> {
        let state = read_slot(&self.slot);
        match &*state {
            SlotState::Pending => Err(RepoError::ResultPending),
            SlotState::Discarded => Err(RepoError::ResultDiscarded),
            SlotState::Ready(replies) => {
                let reply = replies.get(self.position).ok_or_else(|| {
                    RepoError::Decode(CodecError::TypeMismatch {
                        expected: type_name::<T>().to_owned(),
                        found: "nothing",
                    })
                })?;
                (self.decode)(reply)
            }
        }
    }
}

// =============================================================================
// Recorded operations
// =============================================================================

type ErasedDecoder = Box<dyn Fn(&Reply) -> Result<Box<dyn Any + Send>, RepoError> + Send + Sync>;

struct Recorded {
    command: Command,
    result_type: &'static str,
    decode: ErasedDecoder,
}

impl Recorded {
    fn new<T: Send + 'static>(command: Command, decode: Decoder<T>) -> Self {
        Self {
            command,
            result_type: type_name::<T>(),
            decode: Box::new(move |reply: &Reply| {
                decode(reply).map(|value| Box::new(value) as Box<dyn Any + Send>)
            }),
        }
    }
}

impl fmt::Debug for Recorded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorded")
            .field("command", &self.command.name())
            .field("result_type", &self.result_type)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Batch
// =============================================================================

/// An ordered set of operations committed atomically on one connection.
///
/// A batch belongs to one caller; it is not meant to be shared while
/// recording.
#[derive(Debug)]
pub struct TransactionBatch {
    pool: ConnectionPool,
    scripts: Arc<ScriptCache>,
    keyspace: KeySpace,
    retry: RetryPolicy,
    attempts: u32,
    state: BatchState,
    slot: Option<Arc<ConnectionSlot>>,
    preconditions: Vec<Precondition>,
    ops: Vec<Recorded>,
    results: ResultSlot,
}

impl TransactionBatch {
    /// An idle batch. `attempts` is the retry budget for [`Self::execute`].
    pub fn new(
        pool: ConnectionPool,
        scripts: Arc<ScriptCache>,
        keyspace: KeySpace,
        retry: RetryPolicy,
        attempts: u32,
    ) -> Self {
        Self {
            pool,
            scripts,
            keyspace,
            retry,
            attempts,
            state: BatchState::Idle,
            slot: None,
            preconditions: Vec::new(),
            ops: Vec::new(),
            results: Arc::new(RwLock::new(SlotState::Pending)),
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> BatchState {
        self.state
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Pool index of the connection this round uses.
    pub fn connection_index(&self) -> Option<usize> {
        self.slot.as_ref().map(|slot| slot.index())
    }

    fn require(&self, expected: BatchState) -> Result<(), RepoError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RepoError::InvalidState {
                expected,
                found: self.state,
            })
        }
    }

    fn current_slot(&self) -> Result<Arc<ConnectionSlot>, RepoError> {
        self.slot.clone().ok_or(RepoError::InvalidState {
            expected: BatchState::Recording,
            found: self.state,
        })
    }

    /// Begin a new round: acquire a connection and clear the operation list
    /// and watched keys.
    ///
    /// Results handed out by an earlier round are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::PoolShutDown`] if the pool is closed.
    pub fn start(&mut self) -> Result<(), RepoError> {
        let slot = self.pool.acquire()?;
        *write_slot(&self.results) = SlotState::Discarded;
        self.results = Arc::new(RwLock::new(SlotState::Pending));
        self.ops.clear();
        self.preconditions.clear();
        debug!(connection = slot.index(), "Transaction started");
        self.slot = Some(slot);
        self.state = BatchState::Recording;
        Ok(())
    }

    /// Submit every recorded operation atomically.
    ///
    /// The submission is retried on transient failures up to the batch's
    /// attempt budget; every attempt checks the watched keys again. An empty
    /// batch commits trivially.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::CommitFailed`] if a watched key changed; nothing
    /// was applied in that case. A transaction the store aborted, or whose
    /// `EXEC` went unanswered, is reported without retrying.
    /// Returns [`RepoError::InvalidState`] outside `Recording`.
    pub async fn execute(&mut self) -> Result<(), RepoError> {
        self.require(BatchState::Recording)?;
        let slot = self.current_slot()?;
        let commands: Vec<Command> = self.ops.iter().map(|op| op.command.clone()).collect();
        let preconditions = std::mem::take(&mut self.preconditions);
        debug!(
            connection = slot.index(),
            operations = commands.len(),
            watched = preconditions.len(),
            "Executing transaction"
        );

        let connection = slot.connection();
        let commands = commands.as_slice();
        let guards = preconditions.as_slice();
        let outcome = self
            .retry
            .run(self.attempts, || async move {
                Ok(connection.submit(guards, commands).await?)
            })
            .await;
        self.state = BatchState::Executed;

        match outcome {
            Ok(Some(replies)) => {
                *write_slot(&self.results) = SlotState::Ready(Arc::new(replies));
                Ok(())
            }
            Ok(None) => {
                *write_slot(&self.results) = SlotState::Discarded;
                warn!(
                    connection = slot.index(),
                    operations = commands.len(),
                    "Transaction not committed"
                );
                Err(RepoError::CommitFailed)
            }
            Err(err) => {
                *write_slot(&self.results) = SlotState::Discarded;
                Err(err)
            }
        }
    }

    /// Execute, then decode every result as a `T`, in recording order.
    ///
    /// # Errors
    ///
    /// Everything [`Self::execute`] returns, plus [`RepoError::Decode`] with
    /// [`CodecError::TypeMismatch`] if any operation's result is not a `T`.
    pub async fn execute_and_wait_typed<T: Any>(&mut self) -> Result<Vec<T>, RepoError> {
        self.execute().await?;
        let replies = match &*read_slot(&self.results) {
            SlotState::Ready(replies) => Arc::clone(replies),
            SlotState::Pending => return Err(RepoError::ResultPending),
            SlotState::Discarded => return Err(RepoError::ResultDiscarded),
        };

        self.ops
            .iter()
            .zip(replies.iter())
            .map(|(op, reply)| match (op.decode)(reply)?.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => Err(RepoError::Decode(CodecError::TypeMismatch {
                    expected: type_name::<T>().to_owned(),
                    found: op.result_type,
                })),
            })
            .collect()
    }

    fn record<T: Send + 'static>(
        &mut self,
        command: Command,
        decode: Decoder<T>,
    ) -> Result<DeferredResult<T>, RepoError> {
        self.require(BatchState::Recording)?;
        let position = self.ops.len();
        self.ops.push(Recorded::new(command, decode));
        Ok(DeferredResult {
            slot: Arc::clone(&self.results),
            position,
            decode,
        })
    }

    // -------------------------------------------------------------------------
    // Optimistic preconditions
    // -------------------------------------------------------------------------

    /// Make the commit conditional on the string at `key` keeping its
    /// current value.
    ///
    /// The value is read now. [`Self::execute`] watches the key and reads it
    /// again on every attempt; if it differs, or changes before `EXEC`, the
    /// commit fails with [`RepoError::CommitFailed`]. A missing key must
    /// stay missing.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::InvalidState`] outside `Recording`, or the store
    /// error from the read, e.g. for a key that does not hold a string.
    pub async fn watch(&mut self, key: &str) -> Result<(), RepoError> {
        self.require(BatchState::Recording)?;
        let slot = self.current_slot()?;
        let key = self.keyspace.key(key);
        let current = slot
            .connection()
            .execute(&Command::Get { key: key.clone() })
            .await?;
        debug!(key = %key, "Watching key");
        self.preconditions.push(Precondition::new(key, current));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Strings
    // -------------------------------------------------------------------------

    /// Record `SET`. Resolves to `true` when written.
    pub fn set<V: WireCodec>(
        &mut self,
        key: &str,
        value: &V,
        expiry: Option<Duration>,
    ) -> Result<DeferredResult<bool>, RepoError> {
        self.set_when(key, value, expiry, When::Always)
    }

    /// Record a conditional `SET`. Resolves to `false` if the condition
    /// failed.
    pub fn set_when<V: WireCodec>(
        &mut self,
        key: &str,
        value: &V,
        expiry: Option<Duration>,
        when: When,
    ) -> Result<DeferredResult<bool>, RepoError> {
        let command = Command::Set {
            key: self.keyspace.key(key),
            value: value.encode(),
            expiry,
            when,
        };
        self.record(command, replies::acknowledged)
    }

    /// Record `GET`. Resolves to `None` for a missing key.
    pub fn get<T: WireCodec>(&mut self, key: &str) -> Result<DeferredResult<Option<T>>, RepoError> {
        let command = Command::Get {
            key: self.keyspace.key(key),
        };
        self.record(command, replies::optional::<T>)
    }

    /// Record `DEL` of one key. Resolves to `true` if it existed.
    pub fn delete(&mut self, key: &str) -> Result<DeferredResult<bool>, RepoError> {
        let command = Command::Del {
            keys: vec![self.keyspace.key(key)],
        };
        self.record(command, replies::positive)
    }

    /// Record `DEL` of several keys. Resolves to the number removed.
    pub fn delete_many(&mut self, keys: &[&str]) -> Result<DeferredResult<i64>, RepoError> {
        let command = Command::Del {
            keys: self.keyspace.keys(keys.iter().copied()),
        };
        self.record(command, replies::required::<i64>)
    }

    /// Record `APPEND`. Resolves to the new length.
    pub fn set_or_append(&mut self, key: &str, value: &str) -> Result<DeferredResult<i64>, RepoError> {
        let command = Command::Append {
            key: self.keyspace.key(key),
            value: value.into(),
        };
        self.record(command, replies::required::<i64>)
    }

    /// Record `INCRBY`. Resolves to the new value.
    pub fn increment(&mut self, key: &str, delta: i64) -> Result<DeferredResult<i64>, RepoError> {
        let command = Command::IncrBy {
            key: self.keyspace.key(key),
            delta,
        };
        self.record(command, replies::required::<i64>)
    }

    /// Record `DECRBY`. Resolves to the new value.
    pub fn decrement(&mut self, key: &str, delta: i64) -> Result<DeferredResult<i64>, RepoError> {
        let command = Command::DecrBy {
            key: self.keyspace.key(key),
            delta,
        };
        self.record(command, replies::required::<i64>)
    }

    /// Record `INCRBYFLOAT`. Resolves to the new value.
    pub fn increment_float(&mut self, key: &str, delta: f64) -> Result<DeferredResult<f64>, RepoError> {
        let command = Command::IncrByFloat {
            key: self.keyspace.key(key),
            delta,
        };
        self.record(command, replies::required::<f64>)
    }

    /// Record `INCRBYFLOAT` with `-delta`. Resolves to the new value.
    pub fn decrement_float(&mut self, key: &str, delta: f64) -> Result<DeferredResult<f64>, RepoError> {
        self.increment_float(key, -delta)
    }

    /// Record `GETSET`. Resolves to the previous value.
    pub fn atomic_exchange<V: WireCodec>(
        &mut self,
        key: &str,
        value: &V,
    ) -> Result<DeferredResult<Option<V>>, RepoError> {
        let command = Command::GetSet {
            key: self.keyspace.key(key),
            value: value.encode(),
        };
        self.record(command, replies::optional::<V>)
    }

    // -------------------------------------------------------------------------
    // Expiry
    // -------------------------------------------------------------------------

    /// Record `PTTL`. Resolves to `None` for a missing key or no expiry.
    pub fn get_time_to_live(&mut self, key: &str) -> Result<DeferredResult<Option<Duration>>, RepoError> {
        let command = Command::PTtl {
            key: self.keyspace.key(key),
        };
        self.record(command, replies::time_to_live)
    }

    /// Record `PEXPIRE`, or `PERSIST` when `expiry` is `None`. Resolves to
    /// `true` if the key's expiry changed.
    pub fn set_time_to_live(
        &mut self,
        key: &str,
        expiry: Option<Duration>,
    ) -> Result<DeferredResult<bool>, RepoError> {
        let key = self.keyspace.key(key);
        let command = match expiry {
            Some(ttl) => Command::PExpire { key, ttl },
            None => Command::Persist { key },
        };
        self.record(command, replies::positive)
    }

    // -------------------------------------------------------------------------
    // Sorted sets
    // -------------------------------------------------------------------------

    /// Record `ZADD`, subject to `when`. Resolves to `true` if the member
    /// was new.
    pub fn sorted_set_add<V: WireCodec>(
        &mut self,
        key: &str,
        value: &V,
        score: f64,
        when: When,
    ) -> Result<DeferredResult<bool>, RepoError> {
        let command = Command::ZAdd {
            key: self.keyspace.key(key),
            members: vec![(score, value.encode())],
            when,
        };
        self.record(command, replies::positive)
    }

    /// Record `ZUNIONSTORE`/`ZINTERSTORE`/`ZDIFFSTORE`. Resolves to the
    /// size of the destination set.
    pub fn sorted_set_combine_and_store(
        &mut self,
        destination: &str,
        sources: &[&str],
        weights: Option<Vec<f64>>,
        operation: SetOperation,
        aggregate: Aggregation,
    ) -> Result<DeferredResult<i64>, RepoError> {
        let command = Command::ZCombineStore {
            operation,
            destination: self.keyspace.key(destination),
            keys: self.keyspace.keys(sources.iter().copied()),
            weights,
            aggregate,
        };
        self.record(command, replies::required::<i64>)
    }

    /// Record a rank range read (`stop = -1` reads to the end).
    pub fn sorted_set_range_by_rank<T: WireCodec>(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
        order: SortOrder,
    ) -> Result<DeferredResult<Vec<T>>, RepoError> {
        let command = Command::ZRange {
            key: self.keyspace.key(key),
            start,
            stop,
            order,
        };
        self.record(command, replies::array::<T>)
    }

    /// Record a score range read. `skip = 0, take = -1` reads everything.
    pub fn sorted_set_range_by_score<T: WireCodec>(
        &mut self,
        key: &str,
        range: ScoreRange,
        order: SortOrder,
        skip: i64,
        take: i64,
    ) -> Result<DeferredResult<Vec<T>>, RepoError> {
        let command = Command::ZRangeByScore {
            key: self.keyspace.key(key),
            range,
            order,
            limit: score_limit(skip, take),
        };
        self.record(command, replies::array::<T>)
    }

    /// Record `ZRANK`/`ZREVRANK`. Resolves to `None` for a non-member.
    pub fn sorted_set_rank<V: WireCodec>(
        &mut self,
        key: &str,
        member: &V,
        order: SortOrder,
    ) -> Result<DeferredResult<Option<i64>>, RepoError> {
        let command = Command::ZRank {
            key: self.keyspace.key(key),
            member: member.encode(),
            order,
        };
        self.record(command, replies::optional::<i64>)
    }

    /// Record `ZREMRANGEBYRANK`. Resolves to the number removed.
    pub fn sorted_set_remove_range_by_rank(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<DeferredResult<i64>, RepoError> {
        let command = Command::ZRemRangeByRank {
            key: self.keyspace.key(key),
            start,
            stop,
        };
        self.record(command, replies::required::<i64>)
    }

    /// Record `ZREMRANGEBYSCORE`. Resolves to the number removed.
    pub fn sorted_set_remove_range_by_score(
        &mut self,
        key: &str,
        range: ScoreRange,
    ) -> Result<DeferredResult<i64>, RepoError> {
        let command = Command::ZRemRangeByScore {
            key: self.keyspace.key(key),
            range,
        };
        self.record(command, replies::required::<i64>)
    }

    // -------------------------------------------------------------------------
    // Scripts
    // -------------------------------------------------------------------------

    /// Record a script invocation.
    ///
    /// The script is loaded (or taken from the cache) now, so the `EVALSHA`
    /// can be queued with its handle. An eviction between now and `EXEC`
    /// surfaces as this result's decode error.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::InvalidState`] outside `Recording`,
    /// [`RepoError::InvalidArgument`] for unset key slots, or the store
    /// error from loading the script.
    pub async fn run_script<T: WireCodec>(
        &mut self,
        source: &str,
        args: &ScriptArgs,
    ) -> Result<DeferredResult<Option<T>>, RepoError> {
        self.require(BatchState::Recording)?;
        let slot = self.current_slot()?;
        let handle = self.scripts.get_or_load(slot.connection(), source).await?;
        let command = handle.invocation(args)?;
        self.record(command, replies::optional::<T>)
    }
}

/// `LIMIT` for score range reads; omitted for the read-everything default.
pub(crate) const fn score_limit(skip: i64, take: i64) -> Option<Limit> {
    if skip == 0 && take < 0 {
        None
    } else {
        Some(Limit {
            offset: skip,
            count: take,
        })
    }
}
