//! Typed single-shot operations.
//!
//! Every method on [`Repository`] is one store call (two for
//! [`Repository::set_time_to_live`] and the distributed lock) on the next
//! pooled connection, wrapped in the repository's [`RetryPolicy`].
//!
//! Reads and overwrites use the configured `default_retries` budget.
//! Operations whose effect compounds when repeated (appends, increments,
//! exchanges, list pushes) run exactly once, since a retry after an
//! ambiguous failure could apply them twice.

use std::sync::Arc;
use std::time::Duration;

use kvrepo_store::{Command, Endpoint};
use kvrepo_types::{
    Aggregation, KeySpace, Reply, ScoreRange, ScriptArgs, SetOperation, SortOrder, When,
    WireCodec,
};
use tracing::debug;

use crate::batch::{TransactionBatch, score_limit};
use crate::config::RepoConfig;
use crate::error::RepoError;
use crate::pool::ConnectionPool;
use crate::replies::{self, Decoder};
use crate::retry::{NO_RETRIES, RetryPolicy};
use crate::script::ScriptCache;

/// Typed access to one namespace of the store.
///
/// Cloning is cheap and shares the pool and the script cache.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: ConnectionPool,
    scripts: Arc<ScriptCache>,
    keyspace: KeySpace,
    retry: RetryPolicy,
    default_retries: u32,
    transaction_retries: u32,
}

impl Repository {
    /// Validate `config` and connect to the endpoint it names.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Config`] for an invalid configuration, or
    /// [`RepoError::Connect`] if a pool connection cannot be established.
    pub async fn connect(config: &RepoConfig) -> Result<Self, RepoError> {
        Self::connect_to(&config.endpoint(), config).await
    }

    /// Like [`Self::connect`], with an explicit endpoint (e.g. a shared
    /// [`MemoryStore`](kvrepo_store::MemoryStore)).
    ///
    /// # Errors
    ///
    /// See [`Self::connect`].
    pub async fn connect_to(endpoint: &Endpoint, config: &RepoConfig) -> Result<Self, RepoError> {
        config.validate()?;
        let pool =
            ConnectionPool::connect(endpoint, config.total_connections, config.timeouts()).await?;
        Ok(Self::from_pool(pool, config))
    }

    /// A repository over an existing pool.
    pub fn from_pool(pool: ConnectionPool, config: &RepoConfig) -> Self {
        Self {
            pool,
            scripts: Arc::new(ScriptCache::new()),
            keyspace: config.keyspace(),
            retry: config.retry_policy(),
            default_retries: config.default_retries,
            transaction_retries: config.transaction_retries,
        }
    }

    /// The connection pool.
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The key namespace.
    pub const fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    /// The script cache.
    pub fn scripts(&self) -> &ScriptCache {
        &self.scripts
    }

    /// Full store key for `key`.
    pub fn key(&self, key: &str) -> String {
        self.keyspace.key(key)
    }

    /// Close every pooled connection.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::shutdown`].
    pub async fn close(&self) -> Result<(), RepoError> {
        self.pool.shutdown().await
    }

    async fn run<T>(
        &self,
        attempts: u32,
        command: Command,
        decode: Decoder<T>,
    ) -> Result<T, RepoError> {
        let command = &command;
        self.retry
            .run(attempts, || async move {
                let slot = self.pool.acquire()?;
                let reply = slot.connection().execute(command).await?;
                decode(&reply)
            })
            .await
    }

    // =========================================================================
    // Strings
    // =========================================================================

    /// Read `key`.
    ///
    /// `Ok(None)` means the key does not exist. For nullable types,
    /// `Ok(Some(None))` means the key holds the null marker.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Decode`] if the stored value is not a `T`.
    pub async fn try_get<T: WireCodec>(&self, key: &str) -> Result<Option<T>, RepoError> {
        let command = Command::Get { key: self.key(key) };
        self.run(self.default_retries, command, replies::optional::<T>)
            .await
    }

    /// Write `key`, optionally expiring after `expiry`.
    pub async fn set<V: WireCodec>(
        &self,
        key: &str,
        value: &V,
        expiry: Option<Duration>,
    ) -> Result<(), RepoError> {
        self.set_when(key, value, expiry, When::Always).await?;
        Ok(())
    }

    /// Write `key` if `when` holds. Returns `false` if it did not.
    pub async fn set_when<V: WireCodec>(
        &self,
        key: &str,
        value: &V,
        expiry: Option<Duration>,
        when: When,
    ) -> Result<bool, RepoError> {
        let command = Command::Set {
            key: self.key(key),
            value: value.encode(),
            expiry,
            when,
        };
        self.run(self.default_retries, command, replies::acknowledged)
            .await
    }

    /// Remove `key`. Returns `true` if it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, RepoError> {
        let command = Command::Del {
            keys: vec![self.key(key)],
        };
        self.run(self.default_retries, command, replies::positive)
            .await
    }

    /// Remove several keys. Returns how many existed.
    pub async fn delete_many(&self, keys: &[&str]) -> Result<i64, RepoError> {
        let command = Command::Del {
            keys: self.keyspace.keys(keys.iter().copied()),
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Append to the string at `key`, creating it if missing. Returns the
    /// new length. Runs once.
    pub async fn set_or_append(&self, key: &str, value: &str) -> Result<i64, RepoError> {
        let command = Command::Append {
            key: self.key(key),
            value: value.into(),
        };
        self.run(NO_RETRIES, command, replies::required::<i64>)
            .await
    }

    /// Add `delta` to the integer at `key`. Runs once.
    pub async fn increment(&self, key: &str, delta: i64) -> Result<i64, RepoError> {
        let command = Command::IncrBy {
            key: self.key(key),
            delta,
        };
        self.run(NO_RETRIES, command, replies::required::<i64>)
            .await
    }

    /// Subtract `delta` from the integer at `key`. Runs once.
    pub async fn decrement(&self, key: &str, delta: i64) -> Result<i64, RepoError> {
        let command = Command::DecrBy {
            key: self.key(key),
            delta,
        };
        self.run(NO_RETRIES, command, replies::required::<i64>)
            .await
    }

    /// Add `delta` to the number at `key`. Runs once.
    pub async fn increment_float(&self, key: &str, delta: f64) -> Result<f64, RepoError> {
        let command = Command::IncrByFloat {
            key: self.key(key),
            delta,
        };
        self.run(NO_RETRIES, command, replies::required::<f64>)
            .await
    }

    /// Subtract `delta` from the number at `key`. Runs once.
    pub async fn decrement_float(&self, key: &str, delta: f64) -> Result<f64, RepoError> {
        self.increment_float(key, -delta).await
    }

    /// Replace the value at `key`, returning the previous one. Runs once.
    pub async fn atomic_exchange<V: WireCodec>(
        &self,
        key: &str,
        value: &V,
    ) -> Result<Option<V>, RepoError> {
        let command = Command::GetSet {
            key: self.key(key),
            value: value.encode(),
        };
        self.run(NO_RETRIES, command, replies::optional::<V>)
            .await
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Remaining time to live. `None` for a missing key or no expiry.
    pub async fn get_time_to_live(&self, key: &str) -> Result<Option<Duration>, RepoError> {
        let command = Command::PTtl { key: self.key(key) };
        self.run(self.default_retries, command, replies::time_to_live)
            .await
    }

    /// Set or clear the expiry of an existing key.
    ///
    /// Missing keys are left alone. Clearing (`None`) only touches keys that
    /// currently expire. Returns `true` if the expiry changed.
    pub async fn set_time_to_live(
        &self,
        key: &str,
        expiry: Option<Duration>,
    ) -> Result<bool, RepoError> {
        let full_key = self.key(key);
        let exists = self
            .run(
                self.default_retries,
                Command::Exists {
                    key: full_key.clone(),
                },
                replies::positive,
            )
            .await?;
        if !exists {
            return Ok(false);
        }

        let command = match expiry {
            Some(ttl) => Command::PExpire { key: full_key, ttl },
            None => {
                if self.get_time_to_live(key).await?.is_none() {
                    return Ok(false);
                }
                Command::Persist { key: full_key }
            }
        };
        self.run(self.default_retries, command, replies::positive)
            .await
    }

    // =========================================================================
    // Locks and keys
    // =========================================================================

    /// Take the lock `lock_name` for `locker`, held for `ttl`.
    ///
    /// Returns `true` if the lock was free, or is already held by `locker`.
    pub async fn try_get_distributed_lock(
        &self,
        lock_name: &str,
        locker: &str,
        ttl: Duration,
    ) -> Result<bool, RepoError> {
        let acquired = self
            .set_when(lock_name, &locker.to_owned(), Some(ttl), When::NotExists)
            .await?;
        if acquired {
            debug!(lock = lock_name, locker, "Lock acquired");
            return Ok(true);
        }
        let holder = self.try_get::<String>(lock_name).await?;
        Ok(holder.as_deref() == Some(locker))
    }

    /// Keys in this namespace matching the glob `pattern` (all keys when
    /// `None`), with the namespace prefix removed.
    ///
    /// Scans the whole keyspace; meant for tooling and tests.
    pub async fn get_keys(&self, pattern: Option<&str>) -> Result<Vec<String>, RepoError> {
        let command = Command::Keys {
            pattern: self.key(pattern.unwrap_or("*")),
        };
        let keys = self
            .run(self.default_retries, command, replies::array::<String>)
            .await?;
        Ok(keys
            .iter()
            .map(|key| self.keyspace.strip(key).to_owned())
            .collect())
    }

    // =========================================================================
    // Lists
    // =========================================================================

    /// Append `value` to the list at `key`. Returns the new length. Runs once.
    pub async fn add_to_list(&self, key: &str, value: &str) -> Result<i64, RepoError> {
        self.add_range_to_list(key, &[value]).await
    }

    /// Append `values` to the list at `key`. Returns the new length. Runs once.
    pub async fn add_range_to_list(&self, key: &str, values: &[&str]) -> Result<i64, RepoError> {
        let command = Command::RPush {
            key: self.key(key),
            values: values.iter().map(|value| (*value).into()).collect(),
        };
        self.run(NO_RETRIES, command, replies::required::<i64>)
            .await
    }

    /// Elements `start..=stop` of the list at `key`; negative indexes count
    /// from the end, so `(0, -1)` is the whole list.
    pub async fn get_list(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, RepoError> {
        let command = Command::LRange {
            key: self.key(key),
            start,
            stop,
        };
        self.run(self.default_retries, command, replies::array::<String>)
            .await
    }

    // =========================================================================
    // Sets
    // =========================================================================

    /// Add one member. Returns `true` if it was new.
    pub async fn set_add<V: WireCodec>(&self, key: &str, value: &V) -> Result<bool, RepoError> {
        self.set_add_many(key, std::slice::from_ref(value))
            .await
            .map(|added| added > 0)
    }

    /// Add several members. Returns how many were new.
    pub async fn set_add_many<V: WireCodec>(&self, key: &str, values: &[V]) -> Result<i64, RepoError> {
        let command = Command::SAdd {
            key: self.key(key),
            members: values.iter().map(WireCodec::encode).collect(),
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Remove one member. Returns `true` if it was present.
    pub async fn set_remove<V: WireCodec>(&self, key: &str, value: &V) -> Result<bool, RepoError> {
        self.set_remove_many(key, std::slice::from_ref(value))
            .await
            .map(|removed| removed > 0)
    }

    /// Remove several members. Returns how many were present.
    pub async fn set_remove_many<V: WireCodec>(
        &self,
        key: &str,
        values: &[V],
    ) -> Result<i64, RepoError> {
        let command = Command::SRem {
            key: self.key(key),
            members: values.iter().map(WireCodec::encode).collect(),
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Number of members.
    pub async fn set_length(&self, key: &str) -> Result<i64, RepoError> {
        let command = Command::SCard { key: self.key(key) };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Every member, decoded as `T`.
    pub async fn set_members<T: WireCodec>(&self, key: &str) -> Result<Vec<T>, RepoError> {
        let command = Command::SMembers { key: self.key(key) };
        self.run(self.default_retries, command, replies::array::<T>)
            .await
    }

    /// Returns `true` if `member` is in the set.
    pub async fn set_contains<V: WireCodec>(&self, key: &str, member: &V) -> Result<bool, RepoError> {
        let command = Command::SIsMember {
            key: self.key(key),
            member: member.encode(),
        };
        self.run(self.default_retries, command, replies::positive)
            .await
    }

    async fn combine_sets(
        &self,
        operation: SetOperation,
        keys: &[&str],
    ) -> Result<Vec<String>, RepoError> {
        let command = Command::SetCombine {
            operation,
            keys: self.keyspace.keys(keys.iter().copied()),
        };
        self.run(self.default_retries, command, replies::array::<String>)
            .await
    }

    async fn combine_sets_and_store(
        &self,
        operation: SetOperation,
        destination: &str,
        keys: &[&str],
    ) -> Result<i64, RepoError> {
        let command = Command::SetCombineStore {
            operation,
            destination: self.key(destination),
            keys: self.keyspace.keys(keys.iter().copied()),
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Members of any of the sets.
    pub async fn union_sets(&self, keys: &[&str]) -> Result<Vec<String>, RepoError> {
        self.combine_sets(SetOperation::Union, keys).await
    }

    /// Members of all of the sets.
    pub async fn intersect_sets(&self, keys: &[&str]) -> Result<Vec<String>, RepoError> {
        self.combine_sets(SetOperation::Intersect, keys).await
    }

    /// Members of the first set that are in none of the others.
    pub async fn sets_difference(&self, keys: &[&str]) -> Result<Vec<String>, RepoError> {
        self.combine_sets(SetOperation::Difference, keys).await
    }

    /// Store the union at `destination`. Returns its size.
    pub async fn union_sets_and_store(&self, destination: &str, keys: &[&str]) -> Result<i64, RepoError> {
        self.combine_sets_and_store(SetOperation::Union, destination, keys)
            .await
    }

    /// Store the intersection at `destination`. Returns its size.
    pub async fn intersect_sets_and_store(
        &self,
        destination: &str,
        keys: &[&str],
    ) -> Result<i64, RepoError> {
        self.combine_sets_and_store(SetOperation::Intersect, destination, keys)
            .await
    }

    /// Store the difference at `destination`. Returns its size.
    pub async fn sets_difference_and_store(
        &self,
        destination: &str,
        keys: &[&str],
    ) -> Result<i64, RepoError> {
        self.combine_sets_and_store(SetOperation::Difference, destination, keys)
            .await
    }

    // =========================================================================
    // Sorted sets
    // =========================================================================

    /// Add or rescore one member, subject to `when` (`NX`/`XX`). Returns
    /// `true` if it was new.
    pub async fn sorted_set_add<V: WireCodec>(
        &self,
        key: &str,
        value: &V,
        score: f64,
        when: When,
    ) -> Result<bool, RepoError> {
        let command = Command::ZAdd {
            key: self.key(key),
            members: vec![(score, value.encode())],
            when,
        };
        self.run(self.default_retries, command, replies::positive)
            .await
    }

    /// Add or rescore several `(member, score)` pairs, each subject to
    /// `when`. Returns how many were new.
    pub async fn sorted_set_add_many<V: WireCodec>(
        &self,
        key: &str,
        members: &[(V, f64)],
        when: When,
    ) -> Result<i64, RepoError> {
        let command = Command::ZAdd {
            key: self.key(key),
            members: members
                .iter()
                .map(|(value, score)| (*score, value.encode()))
                .collect(),
            when,
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Members ranked `start..=stop` in `order`.
    pub async fn sorted_set_range_by_rank<T: WireCodec>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        order: SortOrder,
    ) -> Result<Vec<T>, RepoError> {
        let command = Command::ZRange {
            key: self.key(key),
            start,
            stop,
            order,
        };
        self.run(self.default_retries, command, replies::array::<T>)
            .await
    }

    /// Members scored within `range`, paged by `skip`/`take` (`take < 0`
    /// reads to the end).
    pub async fn sorted_set_range_by_score<T: WireCodec>(
        &self,
        key: &str,
        range: ScoreRange,
        order: SortOrder,
        skip: i64,
        take: i64,
    ) -> Result<Vec<T>, RepoError> {
        let command = Command::ZRangeByScore {
            key: self.key(key),
            range,
            order,
            limit: score_limit(skip, take),
        };
        self.run(self.default_retries, command, replies::array::<T>)
            .await
    }

    /// Rank of `member` in `order`, or `None` if absent.
    pub async fn sorted_set_rank<V: WireCodec>(
        &self,
        key: &str,
        member: &V,
        order: SortOrder,
    ) -> Result<Option<i64>, RepoError> {
        let command = Command::ZRank {
            key: self.key(key),
            member: member.encode(),
            order,
        };
        self.run(self.default_retries, command, replies::optional::<i64>)
            .await
    }

    /// Remove members ranked `start..=stop`. Returns how many were removed.
    pub async fn sorted_set_remove_range_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<i64, RepoError> {
        let command = Command::ZRemRangeByRank {
            key: self.key(key),
            start,
            stop,
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Remove members scored within `range`. Returns how many were removed.
    pub async fn sorted_set_remove_range_by_score(
        &self,
        key: &str,
        range: ScoreRange,
    ) -> Result<i64, RepoError> {
        let command = Command::ZRemRangeByScore {
            key: self.key(key),
            range,
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    /// Combine sorted sets into `destination`. Returns its size.
    pub async fn sorted_set_combine_and_store(
        &self,
        destination: &str,
        sources: &[&str],
        weights: Option<Vec<f64>>,
        operation: SetOperation,
        aggregate: Aggregation,
    ) -> Result<i64, RepoError> {
        let command = Command::ZCombineStore {
            operation,
            destination: self.key(destination),
            keys: self.keyspace.keys(sources.iter().copied()),
            weights,
            aggregate,
        };
        self.run(self.default_retries, command, replies::required::<i64>)
            .await
    }

    // =========================================================================
    // Scripts
    // =========================================================================

    /// Empty script slots whose keys land in this namespace.
    pub fn create_script_args(&self) -> ScriptArgs {
        ScriptArgs::new(self.keyspace.clone())
    }

    async fn eval(&self, source: &str, args: &ScriptArgs) -> Result<Reply, RepoError> {
        self.retry
            .run(self.default_retries, || async move {
                let slot = self.pool.acquire()?;
                self.scripts.eval(slot.connection(), source, args).await
            })
            .await
    }

    /// Run a script for its effects.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::ScriptEvicted`] if the server loses the script
    /// again right after it was reloaded, and store errors otherwise.
    pub async fn run_script(&self, source: &str, args: &ScriptArgs) -> Result<(), RepoError> {
        self.eval(source, args).await?;
        Ok(())
    }

    /// Run a script and decode its result as a `T`.
    pub async fn run_script_as<T: WireCodec>(
        &self,
        source: &str,
        args: &ScriptArgs,
    ) -> Result<Option<T>, RepoError> {
        let reply = self.eval(source, args).await?;
        replies::optional::<T>(&reply)
    }

    /// Run a script returning an array and decode each element as a `T`.
    pub async fn run_script_array<T: WireCodec>(
        &self,
        source: &str,
        args: &ScriptArgs,
    ) -> Result<Vec<T>, RepoError> {
        let reply = self.eval(source, args).await?;
        replies::array::<T>(&reply)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// A started [`TransactionBatch`] on the next pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::PoolShutDown`] after [`Self::close`].
    pub fn begin_transaction(&self) -> Result<TransactionBatch, RepoError> {
        let mut batch = TransactionBatch::new(
            self.pool.clone(),
            Arc::clone(&self.scripts),
            self.keyspace.clone(),
            self.retry,
            self.transaction_retries,
        );
        batch.start()?;
        Ok(batch)
    }
}
