//! Command option enums and their wire spellings.
//!
//! Each enum maps to its protocol token through a `match`, so there is no
//! lookup table to initialise and nothing shared between callers.

use serde::{Deserialize, Serialize};

use crate::wire::format_double;

/// Existence precondition for `SET` and `ZADD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    /// Set unconditionally.
    #[default]
    Always,
    /// Only set if the key already exists.
    Exists,
    /// Only set if the key does not exist.
    NotExists,
}

impl When {
    /// The `NX`/`XX` flag for this condition, if any.
    pub const fn condition(self) -> Option<&'static str> {
        match self {
            Self::Always => None,
            Self::Exists => Some("XX"),
            Self::NotExists => Some("NX"),
        }
    }

    /// Whether a write may proceed given whether its target exists.
    pub const fn permits(self, exists: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Exists => exists,
            Self::NotExists => !exists,
        }
    }
}

/// Ordering for sorted-set range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Lowest score first.
    #[default]
    Ascending,
    /// Highest score first.
    Descending,
}

impl SortOrder {
    /// Returns `true` for [`SortOrder::Descending`].
    pub const fn is_descending(self) -> bool {
        matches!(self, Self::Descending)
    }
}

/// A set algebra operation over several keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOperation {
    /// Members present in any input.
    Union,
    /// Members present in every input.
    Intersect,
    /// Members of the first input absent from the others.
    Difference,
}

impl SetOperation {
    /// Command for plain sets, returning the members.
    pub const fn set_command(self) -> &'static str {
        match self {
            Self::Union => "SUNION",
            Self::Intersect => "SINTER",
            Self::Difference => "SDIFF",
        }
    }

    /// Command for plain sets, storing the result.
    pub const fn set_store_command(self) -> &'static str {
        match self {
            Self::Union => "SUNIONSTORE",
            Self::Intersect => "SINTERSTORE",
            Self::Difference => "SDIFFSTORE",
        }
    }

    /// Command for sorted sets, storing the result.
    pub const fn sorted_set_store_command(self) -> &'static str {
        match self {
            Self::Union => "ZUNIONSTORE",
            Self::Intersect => "ZINTERSTORE",
            Self::Difference => "ZDIFFSTORE",
        }
    }
}

/// How scores are combined when sorted sets are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Add the scores.
    #[default]
    Sum,
    /// Keep the lowest score.
    Min,
    /// Keep the highest score.
    Max,
}

impl Aggregation {
    /// The `AGGREGATE` argument token.
    pub const fn token(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// Which ends of a score range are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclude {
    /// Both bounds inclusive.
    #[default]
    None,
    /// Start bound exclusive.
    Start,
    /// Stop bound exclusive.
    Stop,
    /// Both bounds exclusive.
    Both,
}

impl Exclude {
    /// Returns `true` if the start bound is exclusive.
    pub const fn start(self) -> bool {
        matches!(self, Self::Start | Self::Both)
    }

    /// Returns `true` if the stop bound is exclusive.
    pub const fn stop(self) -> bool {
        matches!(self, Self::Stop | Self::Both)
    }
}

/// One end of a score range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBound {
    /// The score, possibly infinite.
    pub value: f64,
    /// Whether the bound itself is excluded.
    pub exclusive: bool,
}

impl ScoreBound {
    /// Render the bound as the store expects: `(` prefix when exclusive,
    /// `+inf`/`-inf` for infinities.
    pub fn render(&self) -> String {
        let number = if self.value.is_infinite() && self.value.is_sign_positive() {
            "+inf".to_owned()
        } else {
            format_double(self.value)
        };
        if self.exclusive {
            format!("({number}")
        } else {
            number
        }
    }
}

/// A score window for sorted-set range operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    /// Lower score.
    pub start: f64,
    /// Upper score.
    pub stop: f64,
    /// Exclusivity of the two ends.
    pub exclude: Exclude,
}

impl Default for ScoreRange {
    fn default() -> Self {
        Self::all()
    }
}

impl ScoreRange {
    /// The inclusive range `[start, stop]`.
    pub const fn new(start: f64, stop: f64) -> Self {
        Self {
            start,
            stop,
            exclude: Exclude::None,
        }
    }

    /// Every score.
    pub const fn all() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Replace the exclusivity of the range.
    #[must_use]
    pub const fn excluding(mut self, exclude: Exclude) -> Self {
        self.exclude = exclude;
        self
    }

    /// Lower bound.
    pub const fn min_bound(&self) -> ScoreBound {
        ScoreBound {
            value: self.start,
            exclusive: self.exclude.start(),
        }
    }

    /// Upper bound.
    pub const fn max_bound(&self) -> ScoreBound {
        ScoreBound {
            value: self.stop,
            exclusive: self.exclude.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_set_flags() {
        assert_eq!(When::Always.condition(), None);
        assert_eq!(When::Exists.condition(), Some("XX"));
        assert_eq!(When::NotExists.condition(), Some("NX"));
        assert!(When::Always.permits(false));
        assert!(When::Exists.permits(true) && !When::Exists.permits(false));
        assert!(When::NotExists.permits(false) && !When::NotExists.permits(true));
    }

    #[test]
    fn set_operation_commands() {
        assert_eq!(SetOperation::Union.set_command(), "SUNION");
        assert_eq!(SetOperation::Intersect.set_store_command(), "SINTERSTORE");
        assert_eq!(SetOperation::Difference.sorted_set_store_command(), "ZDIFFSTORE");
        assert_eq!(Aggregation::Max.token(), "MAX");
    }

    #[test]
    fn score_bounds_render() {
        let range = ScoreRange::all();
        assert_eq!(range.min_bound().render(), "-inf");
        assert_eq!(range.max_bound().render(), "+inf");

        let range = ScoreRange::new(1.0, 2.5).excluding(Exclude::Start);
        assert_eq!(range.min_bound().render(), "(1");
        assert_eq!(range.max_bound().render(), "2.5");

        let range = ScoreRange::new(0.0, 9.0).excluding(Exclude::Both);
        assert_eq!(range.max_bound().render(), "(9");
    }

    #[test]
    fn options_deserialize_from_snake_case() {
        let when: When = serde::Deserialize::deserialize(
            serde::de::value::StrDeserializer::<serde::de::value::Error>::new("not_exists"),
        )
        .unwrap_or_default();
        assert_eq!(when, When::NotExists);
    }
}
