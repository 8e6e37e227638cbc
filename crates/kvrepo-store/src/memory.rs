//! # In-process store
//!
//! A single-process stand-in for a Redis-compatible server, used by tests and
//! by `memory://` configurations. It implements the [`Command`] vocabulary
//! with the server's observable semantics:
//!
//! - strings, lists, sets and sorted sets, with `WRONGTYPE` errors
//! - millisecond expiry, checked on access
//! - optimistic `WATCH` through per-key versions
//! - atomic `MULTI`/`EXEC` (the whole batch runs under one lock)
//! - a script registry keyed by SHA-256 handles, with `SCRIPT FLUSH`
//!
//! Lua is not interpreted. A script body is given behaviour by registering a
//! native handler for that exact body with [`MemoryStore::register_script`].
//! Loading an unregistered body succeeds; evaluating it is an error reply.
//!
//! ## Structure
//!
//! ```text
//! MemoryStore (Clone, shared)
//!   └── Arc<Mutex<Database>>
//!         ├── entries:  key -> Entry { data, expires_at }
//!         ├── versions: key -> last write stamp (WATCH)
//!         ├── scripts:  sha -> body, body -> handler
//!         └── faults:   injected failures for tests
//! MemoryConnection (one per pool slot)
//!   └── watched keys + versions seen at WATCH time
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kvrepo_types::{
    Aggregation, Reply, ScoreRange, SetOperation, WireValue, format_double,
};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::command::{Command, Limit, Precondition};
use crate::error::StoreError;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";
const NOT_A_FLOAT: &str = "ERR value is not a valid float";
const OVERFLOW: &str = "ERR increment or decrement would overflow";
const NAN_OR_INFINITY: &str = "ERR increment would produce NaN or Infinity";
const NO_SCRIPT: &str = "NOSCRIPT No matching script. Please use EVAL.";
const NO_HANDLER: &str = "ERR no native handler registered for this script body";

/// Native behaviour for one script body.
pub type ScriptHandler = Arc<dyn Fn(&mut ScriptCall<'_>) -> Reply + Send + Sync>;

// =============================================================================
// Data model
// =============================================================================

#[derive(Debug, Clone)]
enum Data {
    Str(Vec<u8>),
    List(Vec<Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
    SortedSet(BTreeMap<Vec<u8>, f64>),
}

impl Data {
    fn is_empty_collection(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::List(items) => items.is_empty(),
            Self::Set(members) => members.is_empty(),
            Self::SortedSet(members) => members.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug, Clone)]
struct Fault {
    command: &'static str,
    remaining: u32,
    error: StoreError,
}

#[derive(Default)]
struct Database {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    clock: u64,
    scripts: HashMap<String, String>,
    handlers: HashMap<String, ScriptHandler>,
    script_loads: u64,
    faults: Vec<Fault>,
}

fn error(message: &str) -> Reply {
    Reply::Error(message.to_owned())
}

fn count(n: usize) -> Reply {
    Reply::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn flag(value: bool) -> Reply {
    Reply::Integer(i64::from(value))
}

fn bulk_array<'a>(items: impl IntoIterator<Item = &'a Vec<u8>>) -> Reply {
    Reply::Array(items.into_iter().map(|item| Reply::Bulk(item.clone())).collect())
}

/// Hex-encoded SHA-256 of a script body, the handle `SCRIPT LOAD` returns.
pub fn script_sha(body: &str) -> String {
    Sha256::digest(body.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Resolve an inclusive `start..=stop` range with negative indexes counting
/// from the end, as `LRANGE`/`ZRANGE` do.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 {
        len.saturating_add(start).max(0)
    } else {
        start
    };
    let stop = if stop < 0 {
        len.saturating_add(stop)
    } else {
        stop.min(len.saturating_sub(1))
    };
    if start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

fn within(range: &ScoreRange, score: f64) -> bool {
    let min = range.min_bound();
    let max = range.max_bound();
    let above = if min.exclusive {
        score > min.value
    } else {
        score >= min.value
    };
    let below = if max.exclusive {
        score < max.value
    } else {
        score <= max.value
    };
    above && below
}

fn sorted(members: &BTreeMap<Vec<u8>, f64>) -> Vec<(&Vec<u8>, f64)> {
    let mut ordered: Vec<(&Vec<u8>, f64)> =
        members.iter().map(|(member, score)| (member, *score)).collect();
    ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    ordered
}

fn aggregate(mode: Aggregation, current: f64, incoming: f64) -> f64 {
    match mode {
        Aggregation::Sum => current + incoming,
        Aggregation::Min => current.min(incoming),
        Aggregation::Max => current.max(incoming),
    }
}

/// Glob matching as `KEYS` understands it: `*`, `?` and `\` escapes.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0_usize;
    let mut t = 0_usize;
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p = p.saturating_add(1);
                continue;
            }
            Some(b'\\') if pattern.get(p.saturating_add(1)) == text.get(t) => {
                p = p.saturating_add(2);
                t = t.saturating_add(1);
                continue;
            }
            Some(&c) if c != b'\\' && (c == b'?' || Some(&c) == text.get(t)) => {
                p = p.saturating_add(1);
                t = t.saturating_add(1);
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, matched)) => {
                let matched = matched.saturating_add(1);
                backtrack = Some((star, matched));
                p = star.saturating_add(1);
                t = matched;
            }
            None => return false,
        }
    }
    pattern
        .get(p..)
        .is_some_and(|rest| rest.iter().all(|&c| c == b'*'))
}

// =============================================================================
// Command interpretation
// =============================================================================

impl Database {
    fn touch(&mut self, key: &str) {
        self.clock = self.clock.saturating_add(1);
        self.versions.insert(key.to_owned(), self.clock);
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn expire(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&Entry> {
        self.expire(key);
        self.entries.get(key)
    }

    fn live_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.expire(key);
        self.entries.get_mut(key)
    }

    fn remove_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.data.is_empty_collection())
        {
            self.entries.remove(key);
        }
    }

    fn take_fault(&mut self, command: &str) -> Result<(), StoreError> {
        let Some(fault) = self
            .faults
            .iter_mut()
            .find(|fault| fault.command == command && fault.remaining > 0)
        else {
            return Ok(());
        };
        fault.remaining = fault.remaining.saturating_sub(1);
        let err = fault.error.clone();
        self.faults.retain(|fault| fault.remaining > 0);
        Err(err)
    }

    // -------------------------------------------------------------------------
    // Typed views
    // -------------------------------------------------------------------------

    fn string(&mut self, key: &str) -> Result<Option<Vec<u8>>, Reply> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Str(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(error(WRONGTYPE)),
        }
    }

    fn integer(&mut self, key: &str) -> Result<i64, Reply> {
        match self.string(key)? {
            None => Ok(0),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or_else(|| error(NOT_AN_INTEGER)),
        }
    }

    fn float(&mut self, key: &str) -> Result<f64, Reply> {
        match self.string(key)? {
            None => Ok(0.0),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<f64>().ok())
                .ok_or_else(|| error(NOT_A_FLOAT)),
        }
    }

    /// Overwrite a string value, keeping any existing expiry.
    fn store_string(&mut self, key: &str, bytes: Vec<u8>) {
        let expires_at = self.live(key).and_then(|entry| entry.expires_at);
        self.entries.insert(
            key.to_owned(),
            Entry {
                data: Data::Str(bytes),
                expires_at,
            },
        );
        self.touch(key);
    }

    fn list(&mut self, key: &str) -> Result<Vec<Vec<u8>>, Reply> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                data: Data::List(items),
                ..
            }) => Ok(items.clone()),
            Some(_) => Err(error(WRONGTYPE)),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut Vec<Vec<u8>>, Reply> {
        self.expire(key);
        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Data::List(Vec::new())));
        match &mut entry.data {
            Data::List(items) => Ok(items),
            _ => Err(error(WRONGTYPE)),
        }
    }

    fn set(&mut self, key: &str) -> Result<BTreeSet<Vec<u8>>, Reply> {
        match self.live(key) {
            None => Ok(BTreeSet::new()),
            Some(Entry {
                data: Data::Set(members),
                ..
            }) => Ok(members.clone()),
            Some(_) => Err(error(WRONGTYPE)),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<Vec<u8>>, Reply> {
        self.expire(key);
        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Data::Set(BTreeSet::new())));
        match &mut entry.data {
            Data::Set(members) => Ok(members),
            _ => Err(error(WRONGTYPE)),
        }
    }

    /// A sorted set by value. Plain sets read as sorted sets with score 1.
    fn sorted_set(&mut self, key: &str) -> Result<BTreeMap<Vec<u8>, f64>, Reply> {
        match self.live(key) {
            None => Ok(BTreeMap::new()),
            Some(Entry {
                data: Data::SortedSet(members),
                ..
            }) => Ok(members.clone()),
            Some(Entry {
                data: Data::Set(members),
                ..
            }) => Ok(members.iter().map(|member| (member.clone(), 1.0)).collect()),
            Some(_) => Err(error(WRONGTYPE)),
        }
    }

    fn sorted_set_mut(&mut self, key: &str) -> Result<&mut BTreeMap<Vec<u8>, f64>, Reply> {
        self.expire(key);
        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Data::SortedSet(BTreeMap::new())));
        match &mut entry.data {
            Data::SortedSet(members) => Ok(members),
            _ => Err(error(WRONGTYPE)),
        }
    }

    fn replace(&mut self, key: &str, data: Data) {
        if data.is_empty_collection() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_owned(), Entry::new(data));
        }
        self.touch(key);
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn apply(&mut self, command: &Command) -> Reply {
        self.try_apply(command).unwrap_or_else(|reply| reply)
    }

    #[allow(clippy::too_many_lines)]
    fn try_apply(&mut self, command: &Command) -> Result<Reply, Reply> {
        match command {
            Command::Get { key } => Ok(self.string(key)?.map_or(Reply::Nil, Reply::Bulk)),
            Command::Set {
                key,
                value,
                expiry,
                when,
            } => {
                self.expire(key);
                if !when.permits(self.entries.contains_key(key.as_str())) {
                    return Ok(Reply::Nil);
                }
                let expires_at = expiry.and_then(|ttl| Instant::now().checked_add(ttl));
                self.entries.insert(
                    key.clone(),
                    Entry {
                        data: Data::Str(value.to_bytes()),
                        expires_at,
                    },
                );
                self.touch(key);
                Ok(Reply::ok())
            }
            Command::GetSet { key, value } => {
                let previous = self.string(key)?;
                self.entries
                    .insert(key.clone(), Entry::new(Data::Str(value.to_bytes())));
                self.touch(key);
                Ok(previous.map_or(Reply::Nil, Reply::Bulk))
            }
            Command::Del { keys } => {
                let mut removed = 0_usize;
                for key in keys {
                    self.expire(key);
                    if self.entries.remove(key.as_str()).is_some() {
                        removed = removed.saturating_add(1);
                        self.touch(key);
                    }
                }
                Ok(count(removed))
            }
            Command::Exists { key } => Ok(flag(self.live(key).is_some())),
            Command::Append { key, value } => {
                let mut bytes = self.string(key)?.unwrap_or_default();
                bytes.extend(value.to_bytes());
                let len = bytes.len();
                self.store_string(key, bytes);
                Ok(count(len))
            }
            Command::IncrBy { key, delta } => {
                let next = self
                    .integer(key)?
                    .checked_add(*delta)
                    .ok_or_else(|| error(OVERFLOW))?;
                self.store_string(key, next.to_string().into_bytes());
                Ok(Reply::Integer(next))
            }
            Command::DecrBy { key, delta } => {
                let next = self
                    .integer(key)?
                    .checked_sub(*delta)
                    .ok_or_else(|| error(OVERFLOW))?;
                self.store_string(key, next.to_string().into_bytes());
                Ok(Reply::Integer(next))
            }
            Command::IncrByFloat { key, delta } => {
                let next = self.float(key)? + delta;
                if !next.is_finite() {
                    return Err(error(NAN_OR_INFINITY));
                }
                let rendered = format_double(next).into_bytes();
                self.store_string(key, rendered.clone());
                Ok(Reply::Bulk(rendered))
            }
            Command::PExpire { key, ttl } => {
                if self.live(key).is_none() {
                    return Ok(flag(false));
                }
                if ttl.is_zero() {
                    self.entries.remove(key.as_str());
                } else if let Some(entry) = self.entries.get_mut(key.as_str()) {
                    entry.expires_at = Instant::now().checked_add(*ttl);
                }
                self.touch(key);
                Ok(flag(true))
            }
            Command::Persist { key } => {
                let cleared = self
                    .live_mut(key)
                    .and_then(|entry| entry.expires_at.take())
                    .is_some();
                if cleared {
                    self.touch(key);
                }
                Ok(flag(cleared))
            }
            Command::PTtl { key } => {
                let now = Instant::now();
                Ok(Reply::Integer(match self.live(key) {
                    None => -2,
                    Some(Entry {
                        expires_at: None, ..
                    }) => -1,
                    Some(Entry {
                        expires_at: Some(deadline),
                        ..
                    }) => i64::try_from(deadline.saturating_duration_since(now).as_millis())
                        .unwrap_or(i64::MAX),
                }))
            }
            Command::Keys { pattern } => {
                let now = Instant::now();
                self.entries.retain(|_, entry| !entry.is_expired(now));
                let mut keys: Vec<&String> = self
                    .entries
                    .keys()
                    .filter(|key| glob_match(pattern.as_bytes(), key.as_bytes()))
                    .collect();
                keys.sort();
                Ok(Reply::Array(
                    keys.into_iter()
                        .map(|key| Reply::Bulk(key.as_bytes().to_vec()))
                        .collect(),
                ))
            }
            Command::RPush { key, values } => {
                let items = self.list_mut(key)?;
                items.extend(values.iter().map(WireValue::to_bytes));
                let len = items.len();
                self.touch(key);
                Ok(count(len))
            }
            Command::LRange { key, start, stop } => {
                let items = self.list(key)?;
                let window = resolve_range(items.len(), *start, *stop)
                    .and_then(|(first, last)| items.get(first..=last))
                    .unwrap_or_default();
                Ok(bulk_array(window))
            }
            Command::SAdd { key, members } => {
                let set = self.set_mut(key)?;
                let added = members
                    .iter()
                    .filter(|member| set.insert(member.to_bytes()))
                    .count();
                self.remove_if_empty(key);
                if added > 0 {
                    self.touch(key);
                }
                Ok(count(added))
            }
            Command::SRem { key, members } => {
                if self.live(key).is_none() {
                    return Ok(count(0));
                }
                let set = self.set_mut(key)?;
                let removed = members
                    .iter()
                    .filter(|member| set.remove(&member.to_bytes()))
                    .count();
                self.remove_if_empty(key);
                if removed > 0 {
                    self.touch(key);
                }
                Ok(count(removed))
            }
            Command::SCard { key } => Ok(count(self.set(key)?.len())),
            Command::SMembers { key } => Ok(bulk_array(&self.set(key)?)),
            Command::SIsMember { key, member } => {
                Ok(flag(self.set(key)?.contains(&member.to_bytes())))
            }
            Command::SetCombine { operation, keys } => {
                Ok(bulk_array(&self.combine_sets(*operation, keys)?))
            }
            Command::SetCombineStore {
                operation,
                destination,
                keys,
            } => {
                let result = self.combine_sets(*operation, keys)?;
                let len = result.len();
                self.replace(destination, Data::Set(result));
                Ok(count(len))
            }
            Command::ZAdd { key, members, when } => {
                let set = self.sorted_set_mut(key)?;
                let mut added = 0_usize;
                for (score, member) in members {
                    let member = member.to_bytes();
                    if when.permits(set.contains_key(&member)) && set.insert(member, *score).is_none() {
                        added = added.saturating_add(1);
                    }
                }
                self.remove_if_empty(key);
                self.touch(key);
                Ok(count(added))
            }
            Command::ZRange {
                key,
                start,
                stop,
                order,
            } => {
                let members = self.sorted_set(key)?;
                let mut ordered = sorted(&members);
                if order.is_descending() {
                    ordered.reverse();
                }
                let window = resolve_range(ordered.len(), *start, *stop)
                    .and_then(|(first, last)| ordered.get(first..=last))
                    .unwrap_or_default();
                Ok(bulk_array(window.iter().map(|(member, _)| *member)))
            }
            Command::ZRangeByScore {
                key,
                range,
                order,
                limit,
            } => {
                let members = self.sorted_set(key)?;
                let mut ordered: Vec<&Vec<u8>> = sorted(&members)
                    .into_iter()
                    .filter(|(_, score)| within(range, *score))
                    .map(|(member, _)| member)
                    .collect();
                if order.is_descending() {
                    ordered.reverse();
                }
                let (skip, take) = match limit {
                    None => (0, usize::MAX),
                    Some(Limit { offset, count }) => (
                        usize::try_from(*offset).unwrap_or(0),
                        usize::try_from(*count).unwrap_or(usize::MAX),
                    ),
                };
                Ok(bulk_array(ordered.into_iter().skip(skip).take(take)))
            }
            Command::ZRank { key, member, order } => {
                let members = self.sorted_set(key)?;
                let mut ordered = sorted(&members);
                if order.is_descending() {
                    ordered.reverse();
                }
                let wanted = member.to_bytes();
                Ok(ordered
                    .iter()
                    .position(|(candidate, _)| **candidate == wanted)
                    .map_or(Reply::Nil, count))
            }
            Command::ZRemRangeByRank { key, start, stop } => {
                let members = self.sorted_set(key)?;
                let ordered = sorted(&members);
                let doomed: Vec<Vec<u8>> = resolve_range(ordered.len(), *start, *stop)
                    .and_then(|(first, last)| ordered.get(first..=last))
                    .unwrap_or_default()
                    .iter()
                    .map(|(member, _)| (*member).clone())
                    .collect();
                self.remove_sorted_members(key, &doomed)
            }
            Command::ZRemRangeByScore { key, range } => {
                let members = self.sorted_set(key)?;
                let doomed: Vec<Vec<u8>> = members
                    .iter()
                    .filter(|(_, score)| within(range, **score))
                    .map(|(member, _)| member.clone())
                    .collect();
                self.remove_sorted_members(key, &doomed)
            }
            Command::ZCombineStore {
                operation,
                destination,
                keys,
                weights,
                aggregate: mode,
            } => {
                let inputs = keys
                    .iter()
                    .map(|key| self.sorted_set(key))
                    .collect::<Result<Vec<_>, _>>()?;
                let result = combine_sorted_sets(*operation, &inputs, weights.as_deref(), *mode);
                let len = result.len();
                self.replace(destination, Data::SortedSet(result));
                Ok(count(len))
            }
            Command::Watch { .. } | Command::Unwatch => Ok(Reply::ok()),
            Command::ScriptFlush => {
                self.scripts.clear();
                Ok(Reply::ok())
            }
            Command::ScriptLoad { body } => {
                let sha = script_sha(body);
                self.scripts.insert(sha.clone(), body.clone());
                self.script_loads = self.script_loads.saturating_add(1);
                Ok(Reply::Bulk(sha.into_bytes()))
            }
            Command::EvalSha { sha, keys, args } => {
                let body = self.scripts.get(sha).ok_or_else(|| error(NO_SCRIPT))?;
                let handler = self
                    .handlers
                    .get(body)
                    .cloned()
                    .ok_or_else(|| error(NO_HANDLER))?;
                let mut call = ScriptCall {
                    keys: keys.clone(),
                    args: args.iter().map(WireValue::to_bytes).collect(),
                    db: self,
                };
                Ok(handler(&mut call))
            }
        }
    }

    fn combine_sets(
        &mut self,
        operation: SetOperation,
        keys: &[String],
    ) -> Result<BTreeSet<Vec<u8>>, Reply> {
        let mut inputs = keys
            .iter()
            .map(|key| self.set(key))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();
        let first = inputs.next().unwrap_or_default();
        Ok(inputs.fold(first, |mut acc, next| {
            match operation {
                SetOperation::Union => acc.extend(next),
                SetOperation::Intersect => acc.retain(|member| next.contains(member)),
                SetOperation::Difference => acc.retain(|member| !next.contains(member)),
            }
            acc
        }))
    }

    fn remove_sorted_members(&mut self, key: &str, doomed: &[Vec<u8>]) -> Result<Reply, Reply> {
        if doomed.is_empty() {
            return Ok(count(0));
        }
        let set = self.sorted_set_mut(key)?;
        for member in doomed {
            set.remove(member);
        }
        self.remove_if_empty(key);
        self.touch(key);
        Ok(count(doomed.len()))
    }
}

fn combine_sorted_sets(
    operation: SetOperation,
    inputs: &[BTreeMap<Vec<u8>, f64>],
    weights: Option<&[f64]>,
    mode: Aggregation,
) -> BTreeMap<Vec<u8>, f64> {
    let weight = |index: usize| {
        weights
            .and_then(|weights| weights.get(index))
            .copied()
            .unwrap_or(1.0)
    };
    let Some((first, rest)) = inputs.split_first() else {
        return BTreeMap::new();
    };
    match operation {
        SetOperation::Difference => first
            .iter()
            .filter(|(member, _)| rest.iter().all(|other| !other.contains_key(*member)))
            .map(|(member, score)| (member.clone(), *score))
            .collect(),
        SetOperation::Union => {
            let mut out = BTreeMap::new();
            for (index, input) in inputs.iter().enumerate() {
                let w = weight(index);
                for (member, score) in input {
                    let weighted = score * w;
                    out.entry(member.clone())
                        .and_modify(|current| *current = aggregate(mode, *current, weighted))
                        .or_insert(weighted);
                }
            }
            out
        }
        SetOperation::Intersect => first
            .iter()
            .filter(|(member, _)| rest.iter().all(|other| other.contains_key(*member)))
            .map(|(member, score)| {
                let combined = rest
                    .iter()
                    .enumerate()
                    .filter_map(|(index, other)| {
                        other
                            .get(member)
                            .map(|s| s * weight(index.saturating_add(1)))
                    })
                    .fold(score * weight(0), |acc, s| aggregate(mode, acc, s));
                (member.clone(), combined)
            })
            .collect(),
    }
}

// =============================================================================
// Scripts
// =============================================================================

/// The view a native script handler gets of one `EVALSHA` invocation.
///
/// Commands issued through [`ScriptCall::call`] run inside the same critical
/// section as the invocation, so a handler is atomic like a server script.
pub struct ScriptCall<'a> {
    keys: Vec<String>,
    args: Vec<Vec<u8>>,
    db: &'a mut Database,
}

impl ScriptCall<'_> {
    /// The `KEYS` table.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The `ARGV` table.
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// `KEYS[index]`, 1-based like Lua.
    pub fn key(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|position| self.keys.get(position))
            .map(String::as_str)
    }

    /// `ARGV[index]`, 1-based like Lua.
    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        index
            .checked_sub(1)
            .and_then(|position| self.args.get(position))
            .map(Vec::as_slice)
    }

    /// `redis.call`: run a command against the store.
    pub fn call(&mut self, command: &Command) -> Reply {
        self.db.apply(command)
    }
}

// =============================================================================
// Store handle
// =============================================================================

/// Shared in-process store. Cloning yields another handle to the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Database>>,
    connections: Arc<AtomicU64>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("connections", &self.connections_opened())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new connection to this store.
    pub fn connect(&self) -> MemoryConnection {
        self.connections.fetch_add(1, Ordering::Relaxed);
        MemoryConnection {
            store: self.clone(),
            watched: Mutex::new(HashMap::new()),
            submissions: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// How many connections have been opened.
    pub fn connections_opened(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Give a script body native behaviour. `body` must match the text sent
    /// with `SCRIPT LOAD` exactly.
    pub fn register_script<F>(&self, body: impl Into<String>, handler: F)
    where
        F: Fn(&mut ScriptCall<'_>) -> Reply + Send + Sync + 'static,
    {
        self.lock().handlers.insert(body.into(), Arc::new(handler));
    }

    /// How many `SCRIPT LOAD` calls the store has served.
    pub fn script_load_count(&self) -> u64 {
        self.lock().script_loads
    }

    /// How many scripts are currently loaded.
    pub fn loaded_scripts(&self) -> usize {
        self.lock().scripts.len()
    }

    /// Evict every loaded script, as `SCRIPT FLUSH` does.
    pub fn flush_scripts(&self) {
        self.lock().scripts.clear();
    }

    /// Make the next `times` calls of `command` fail with `error`.
    ///
    /// `command` is a wire name such as `"GET"` or `"EVALSHA"`; use `"EXEC"`
    /// to fail transaction submissions.
    pub fn fail_next(&self, command: &'static str, times: u32, error: StoreError) {
        self.lock().faults.push(Fault {
            command,
            remaining: times,
            error,
        });
    }

    /// Run one command outside any connection.
    pub fn apply(&self, command: &Command) -> Reply {
        self.lock().apply(command)
    }
}

/// One connection to a [`MemoryStore`].
///
/// Like a server connection, it owns its `WATCH` state: keys watched here
/// only guard transactions submitted through this connection.
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
    watched: Mutex<HashMap<String, u64>>,
    submissions: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn watched(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one command.
    ///
    /// # Errors
    ///
    /// Error replies are classified into [`StoreError`]; a closed
    /// connection returns [`StoreError::Closed`].
    pub fn execute(&self, command: &Command) -> Result<Reply, StoreError> {
        self.ensure_open()?;
        let mut db = self.store.lock();
        db.take_fault(command.name())?;
        match command {
            Command::Watch { keys } => {
                let mut watched = self.watched();
                for key in keys {
                    db.expire(key);
                    watched.insert(key.clone(), db.version(key));
                }
                Ok(Reply::ok())
            }
            Command::Unwatch => {
                self.watched().clear();
                Ok(Reply::ok())
            }
            other => match db.apply(other) {
                Reply::Error(message) => Err(StoreError::from_reply(&message)),
                reply => Ok(reply),
            },
        }
    }

    /// Apply `commands` atomically.
    ///
    /// Returns `Ok(None)` when a key watched on this connection changed
    /// since it was watched; nothing is applied in that case. Watches are
    /// cleared either way. Per-command failures are [`Reply::Error`] entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] on a closed connection.
    pub fn exec_transaction(&self, commands: &[Command]) -> Result<Option<Vec<Reply>>, StoreError> {
        self.ensure_open()?;
        let watched = std::mem::take(&mut *self.watched());
        let mut db = self.store.lock();
        db.take_fault("EXEC")?;
        if watched
            .iter()
            .any(|(key, version)| db.version(key) != *version)
        {
            return Ok(None);
        }
        Ok(Some(commands.iter().map(|command| db.apply(command)).collect()))
    }

    fn check(&self, preconditions: &[Precondition]) -> Result<bool, StoreError> {
        for precondition in preconditions {
            if !precondition.holds(self.execute(&precondition.read()))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply `commands` atomically if every precondition still holds.
    ///
    /// Watches, checks and commits as one step per connection; concurrent
    /// submissions on the same connection wait their turn.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] on a closed connection, or an injected
    /// fault.
    pub async fn submit(
        &self,
        preconditions: &[Precondition],
        commands: &[Command],
    ) -> Result<Option<Vec<Reply>>, StoreError> {
        let _exclusive = self.submissions.lock().await;
        if !preconditions.is_empty() {
            let keys = preconditions.iter().map(|p| p.key().to_owned()).collect();
            self.execute(&Command::Watch { keys })?;
            let held = self.check(preconditions);
            if !matches!(held, Ok(true)) {
                self.watched().clear();
                return held.map(|_| None);
            }
        }
        self.exec_transaction(commands)
    }

    /// Close the connection. Later calls fail with [`StoreError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] if it was already closed.
    pub fn quit(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}
