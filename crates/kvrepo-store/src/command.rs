//! The closed set of commands the data-access layer issues.
//!
//! A [`Command`] is fully resolved: keys are already namespaced and values
//! already encoded. Backends either render it to the wire
//! ([`Command::name`] + [`Command::args`]) or interpret it directly.

use std::time::Duration;

use kvrepo_types::{
    Aggregation, Reply, ScoreRange, SetOperation, SortOrder, When, WireValue, format_double,
};

use crate::error::StoreError;

/// Offset and count for range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    /// Elements to skip.
    pub offset: i64,
    /// Elements to return; negative means all remaining.
    pub count: i64,
}

/// A string key that must still hold a recorded value when a transaction is
/// submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    key: String,
    value: Reply,
}

impl Precondition {
    /// Expect `key` to still read as `value`; [`Reply::Nil`] for a key that
    /// must stay absent.
    pub const fn new(key: String, value: Reply) -> Self {
        Self { key, value }
    }

    /// The namespaced key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The read that observes the key.
    pub fn read(&self) -> Command {
        Command::Get {
            key: self.key.clone(),
        }
    }

    /// Compare a fresh read with the recorded value.
    ///
    /// A rejected read (`WRONGTYPE`) means the key no longer holds a string,
    /// so the precondition fails rather than erroring.
    ///
    /// # Errors
    ///
    /// Returns the read's error when it did not reach the server.
    pub fn holds(&self, current: Result<Reply, StoreError>) -> Result<bool, StoreError> {
        match current {
            Ok(reply) => Ok(reply == self.value),
            Err(StoreError::Server(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// One store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `GET key`
    Get {
        /// Target key.
        key: String,
    },
    /// `SET key value [PX ms] [NX|XX]`
    Set {
        /// Target key.
        key: String,
        /// Encoded value.
        value: WireValue,
        /// Optional time to live.
        expiry: Option<Duration>,
        /// Existence precondition.
        when: When,
    },
    /// `GETSET key value`
    GetSet {
        /// Target key.
        key: String,
        /// New value.
        value: WireValue,
    },
    /// `DEL key [key ...]`
    Del {
        /// Keys to remove.
        keys: Vec<String>,
    },
    /// `EXISTS key`
    Exists {
        /// Target key.
        key: String,
    },
    /// `APPEND key value`
    Append {
        /// Target key.
        key: String,
        /// Suffix to append.
        value: WireValue,
    },
    /// `INCRBY key delta`
    IncrBy {
        /// Target key.
        key: String,
        /// Amount to add.
        delta: i64,
    },
    /// `DECRBY key delta`
    DecrBy {
        /// Target key.
        key: String,
        /// Amount to subtract.
        delta: i64,
    },
    /// `INCRBYFLOAT key delta`
    IncrByFloat {
        /// Target key.
        key: String,
        /// Amount to add (negative to subtract).
        delta: f64,
    },
    /// `PEXPIRE key ms`
    PExpire {
        /// Target key.
        key: String,
        /// New time to live.
        ttl: Duration,
    },
    /// `PERSIST key`
    Persist {
        /// Target key.
        key: String,
    },
    /// `PTTL key`
    PTtl {
        /// Target key.
        key: String,
    },
    /// `KEYS pattern`
    Keys {
        /// Glob pattern.
        pattern: String,
    },
    /// `RPUSH key value [value ...]`
    RPush {
        /// Target list.
        key: String,
        /// Values to append.
        values: Vec<WireValue>,
    },
    /// `LRANGE key start stop`
    LRange {
        /// Target list.
        key: String,
        /// First index (negative counts from the end).
        start: i64,
        /// Last index, inclusive.
        stop: i64,
    },
    /// `SADD key member [member ...]`
    SAdd {
        /// Target set.
        key: String,
        /// Members to add.
        members: Vec<WireValue>,
    },
    /// `SREM key member [member ...]`
    SRem {
        /// Target set.
        key: String,
        /// Members to remove.
        members: Vec<WireValue>,
    },
    /// `SCARD key`
    SCard {
        /// Target set.
        key: String,
    },
    /// `SMEMBERS key`
    SMembers {
        /// Target set.
        key: String,
    },
    /// `SISMEMBER key member`
    SIsMember {
        /// Target set.
        key: String,
        /// Member to test.
        member: WireValue,
    },
    /// `SUNION`/`SINTER`/`SDIFF key [key ...]`
    SetCombine {
        /// Set algebra to apply.
        operation: SetOperation,
        /// Input sets, in order.
        keys: Vec<String>,
    },
    /// `SUNIONSTORE`/`SINTERSTORE`/`SDIFFSTORE destination key [key ...]`
    SetCombineStore {
        /// Set algebra to apply.
        operation: SetOperation,
        /// Where the result is stored.
        destination: String,
        /// Input sets, in order.
        keys: Vec<String>,
    },
    /// `ZADD key [NX|XX] score member [score member ...]`
    ZAdd {
        /// Target sorted set.
        key: String,
        /// Score and member pairs.
        members: Vec<(f64, WireValue)>,
        /// Per-member existence precondition.
        when: When,
    },
    /// `ZRANGE`/`ZREVRANGE key start stop`
    ZRange {
        /// Target sorted set.
        key: String,
        /// First rank.
        start: i64,
        /// Last rank, inclusive.
        stop: i64,
        /// Read direction.
        order: SortOrder,
    },
    /// `ZRANGEBYSCORE`/`ZREVRANGEBYSCORE key min max [LIMIT offset count]`
    ZRangeByScore {
        /// Target sorted set.
        key: String,
        /// Score window.
        range: ScoreRange,
        /// Read direction.
        order: SortOrder,
        /// Optional paging.
        limit: Option<Limit>,
    },
    /// `ZRANK`/`ZREVRANK key member`
    ZRank {
        /// Target sorted set.
        key: String,
        /// Member to locate.
        member: WireValue,
        /// Rank direction.
        order: SortOrder,
    },
    /// `ZREMRANGEBYRANK key start stop`
    ZRemRangeByRank {
        /// Target sorted set.
        key: String,
        /// First rank.
        start: i64,
        /// Last rank, inclusive.
        stop: i64,
    },
    /// `ZREMRANGEBYSCORE key min max`
    ZRemRangeByScore {
        /// Target sorted set.
        key: String,
        /// Score window.
        range: ScoreRange,
    },
    /// `ZUNIONSTORE`/`ZINTERSTORE`/`ZDIFFSTORE destination numkeys key ... [WEIGHTS ...] [AGGREGATE ...]`
    ZCombineStore {
        /// Set algebra to apply.
        operation: SetOperation,
        /// Where the result is stored.
        destination: String,
        /// Input sorted sets, in order.
        keys: Vec<String>,
        /// Per-input score multipliers; ignored for differences.
        weights: Option<Vec<f64>>,
        /// Score combination; ignored for differences.
        aggregate: Aggregation,
    },
    /// `WATCH key [key ...]`
    Watch {
        /// Keys whose modification aborts the next transaction.
        keys: Vec<String>,
    },
    /// `UNWATCH`
    Unwatch,
    /// `SCRIPT LOAD body`
    ScriptLoad {
        /// Script source as sent to the server.
        body: String,
    },
    /// `SCRIPT FLUSH`
    ScriptFlush,
    /// `EVALSHA sha numkeys key ... arg ...`
    EvalSha {
        /// Handle returned by `SCRIPT LOAD`.
        sha: String,
        /// `KEYS` table.
        keys: Vec<String>,
        /// `ARGV` table.
        args: Vec<WireValue>,
    },
}

fn millis(duration: Duration) -> Vec<u8> {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .to_string()
        .into_bytes()
}

fn text(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}

fn number(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

fn score_window(range: &ScoreRange, order: SortOrder) -> [Vec<u8>; 2] {
    let min = range.min_bound().render().into_bytes();
    let max = range.max_bound().render().into_bytes();
    if order.is_descending() {
        [max, min]
    } else {
        [min, max]
    }
}

impl Command {
    /// The command name as sent on the wire.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::GetSet { .. } => "GETSET",
            Self::Del { .. } => "DEL",
            Self::Exists { .. } => "EXISTS",
            Self::Append { .. } => "APPEND",
            Self::IncrBy { .. } => "INCRBY",
            Self::DecrBy { .. } => "DECRBY",
            Self::IncrByFloat { .. } => "INCRBYFLOAT",
            Self::PExpire { .. } => "PEXPIRE",
            Self::Persist { .. } => "PERSIST",
            Self::PTtl { .. } => "PTTL",
            Self::Keys { .. } => "KEYS",
            Self::RPush { .. } => "RPUSH",
            Self::LRange { .. } => "LRANGE",
            Self::SAdd { .. } => "SADD",
            Self::SRem { .. } => "SREM",
            Self::SCard { .. } => "SCARD",
            Self::SMembers { .. } => "SMEMBERS",
            Self::SIsMember { .. } => "SISMEMBER",
            Self::SetCombine { operation, .. } => operation.set_command(),
            Self::SetCombineStore { operation, .. } => operation.set_store_command(),
            Self::ZAdd { .. } => "ZADD",
            Self::ZRange { order, .. } => {
                if order.is_descending() {
                    "ZREVRANGE"
                } else {
                    "ZRANGE"
                }
            }
            Self::ZRangeByScore { order, .. } => {
                if order.is_descending() {
                    "ZREVRANGEBYSCORE"
                } else {
                    "ZRANGEBYSCORE"
                }
            }
            Self::ZRank { order, .. } => {
                if order.is_descending() {
                    "ZREVRANK"
                } else {
                    "ZRANK"
                }
            }
            Self::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
            Self::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Self::ZCombineStore { operation, .. } => operation.sorted_set_store_command(),
            Self::Watch { .. } => "WATCH",
            Self::Unwatch => "UNWATCH",
            Self::ScriptLoad { .. } | Self::ScriptFlush => "SCRIPT",
            Self::EvalSha { .. } => "EVALSHA",
        }
    }

    /// The binary-safe arguments following the command name.
    #[allow(clippy::too_many_lines)]
    pub fn args(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Get { key }
            | Self::Exists { key }
            | Self::Persist { key }
            | Self::PTtl { key }
            | Self::SCard { key }
            | Self::SMembers { key } => vec![text(key)],
            Self::Set {
                key,
                value,
                expiry,
                when,
            } => {
                let mut args = vec![text(key), value.to_bytes()];
                if let Some(ttl) = expiry {
                    args.push(text("PX"));
                    args.push(millis(*ttl));
                }
                if let Some(flag) = when.condition() {
                    args.push(text(flag));
                }
                args
            }
            Self::GetSet { key, value } | Self::Append { key, value } => {
                vec![text(key), value.to_bytes()]
            }
            Self::Del { keys } | Self::Watch { keys } | Self::SetCombine { keys, .. } => {
                keys.iter().map(|key| text(key)).collect()
            }
            Self::IncrBy { key, delta } | Self::DecrBy { key, delta } => {
                vec![text(key), number(*delta)]
            }
            Self::IncrByFloat { key, delta } => vec![text(key), format_double(*delta).into_bytes()],
            Self::PExpire { key, ttl } => vec![text(key), millis(*ttl)],
            Self::Keys { pattern } => vec![text(pattern)],
            Self::RPush { key, values: members }
            | Self::SAdd { key, members }
            | Self::SRem { key, members } => std::iter::once(text(key))
                .chain(members.iter().map(WireValue::to_bytes))
                .collect(),
            Self::LRange { key, start, stop }
            | Self::ZRemRangeByRank { key, start, stop } => {
                vec![text(key), number(*start), number(*stop)]
            }
            Self::SIsMember { key, member } | Self::ZRank { key, member, .. } => {
                vec![text(key), member.to_bytes()]
            }
            Self::SetCombineStore {
                destination, keys, ..
            } => std::iter::once(destination)
                .chain(keys)
                .map(|key| text(key))
                .collect(),
            Self::ZAdd { key, members, when } => {
                let mut args = vec![text(key)];
                args.extend(when.condition().map(text));
                for (score, member) in members {
                    args.push(format_double(*score).into_bytes());
                    args.push(member.to_bytes());
                }
                args
            }
            Self::ZRange {
                key, start, stop, ..
            } => vec![text(key), number(*start), number(*stop)],
            Self::ZRangeByScore {
                key,
                range,
                order,
                limit,
            } => {
                let mut args = vec![text(key)];
                args.extend(score_window(range, *order));
                if let Some(Limit { offset, count }) = limit {
                    args.push(text("LIMIT"));
                    args.push(number(*offset));
                    args.push(number(*count));
                }
                args
            }
            Self::ZRemRangeByScore { key, range } => {
                let mut args = vec![text(key)];
                args.extend(score_window(range, SortOrder::Ascending));
                args
            }
            Self::ZCombineStore {
                operation,
                destination,
                keys,
                weights,
                aggregate,
            } => {
                let mut args = vec![text(destination), keys.len().to_string().into_bytes()];
                args.extend(keys.iter().map(|key| text(key)));
                if *operation != SetOperation::Difference {
                    if let Some(weights) = weights {
                        args.push(text("WEIGHTS"));
                        args.extend(weights.iter().map(|w| format_double(*w).into_bytes()));
                    }
                    args.push(text("AGGREGATE"));
                    args.push(text(aggregate.token()));
                }
                args
            }
            Self::Unwatch => Vec::new(),
            Self::ScriptLoad { body } => vec![text("LOAD"), text(body)],
            Self::ScriptFlush => vec![text("FLUSH")],
            Self::EvalSha { sha, keys, args } => {
                let mut out = vec![text(sha), keys.len().to_string().into_bytes()];
                out.extend(keys.iter().map(|key| text(key)));
                out.extend(args.iter().map(WireValue::to_bytes));
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kvrepo_types::Exclude;

    use super::*;

    fn rendered(command: &Command) -> Vec<String> {
        std::iter::once(command.name().to_owned())
            .chain(
                command
                    .args()
                    .into_iter()
                    .map(|arg| String::from_utf8_lossy(&arg).into_owned()),
            )
            .collect()
    }

    #[test]
    fn conditional_set_with_expiry() {
        let command = Command::Set {
            key: "k".to_owned(),
            value: WireValue::Integer(-1),
            expiry: Some(Duration::from_millis(1500)),
            when: When::NotExists,
        };
        assert_eq!(rendered(&command), ["SET", "k", "-1", "PX", "1500", "NX"]);
    }

    #[test]
    fn null_marker_is_sent_as_empty_argument() {
        let command = Command::Set {
            key: "k".to_owned(),
            value: WireValue::Null,
            expiry: None,
            when: When::Always,
        };
        assert_eq!(rendered(&command), ["SET", "k", ""]);
    }

    #[test]
    fn zadd_condition_precedes_members() {
        let command = Command::ZAdd {
            key: "z".to_owned(),
            members: vec![(1.5, WireValue::from("a")), (2.0, WireValue::from("b"))],
            when: When::NotExists,
        };
        assert_eq!(rendered(&command), ["ZADD", "z", "NX", "1.5", "a", "2", "b"]);
    }

    #[test]
    fn descending_score_range_swaps_bounds() {
        let command = Command::ZRangeByScore {
            key: "z".to_owned(),
            range: ScoreRange::new(1.0, 5.0).excluding(Exclude::Stop),
            order: SortOrder::Descending,
            limit: Some(Limit { offset: 0, count: 10 }),
        };
        assert_eq!(
            rendered(&command),
            ["ZREVRANGEBYSCORE", "z", "(5", "1", "LIMIT", "0", "10"]
        );
    }

    #[test]
    fn combine_store_renders_weights_and_aggregate() {
        let command = Command::ZCombineStore {
            operation: SetOperation::Union,
            destination: "dst".to_owned(),
            keys: vec!["a".to_owned(), "b".to_owned()],
            weights: Some(vec![1.0, 2.0]),
            aggregate: Aggregation::Max,
        };
        assert_eq!(
            rendered(&command),
            ["ZUNIONSTORE", "dst", "2", "a", "b", "WEIGHTS", "1", "2", "AGGREGATE", "MAX"]
        );

        let command = Command::ZCombineStore {
            operation: SetOperation::Difference,
            destination: "dst".to_owned(),
            keys: vec!["a".to_owned()],
            weights: Some(vec![1.0]),
            aggregate: Aggregation::Sum,
        };
        assert_eq!(rendered(&command), ["ZDIFFSTORE", "dst", "1", "a"]);
    }

    #[test]
    fn preconditions_compare_fresh_reads() {
        let unset = Precondition::new("k".to_owned(), Reply::Nil);
        assert_eq!(unset.read(), Command::Get { key: "k".to_owned() });
        assert_eq!(unset.holds(Ok(Reply::Nil)), Ok(true));
        assert_eq!(unset.holds(Ok(Reply::bulk("v"))), Ok(false));
        assert_eq!(unset.holds(Err(StoreError::Server("WRONGTYPE".to_owned()))), Ok(false));
        assert_eq!(unset.holds(Err(StoreError::Timeout)), Err(StoreError::Timeout));
    }

    #[test]
    fn evalsha_counts_keys() {
        let command = Command::EvalSha {
            sha: "abc".to_owned(),
            keys: vec!["k1".to_owned()],
            args: vec![WireValue::Integer(7878)],
        };
        assert_eq!(rendered(&command), ["EVALSHA", "abc", "1", "k1", "7878"]);
        assert_eq!(rendered(&Command::ScriptFlush), ["SCRIPT", "FLUSH"]);
    }
}
