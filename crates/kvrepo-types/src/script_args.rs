//! Keys and arguments for server-side scripts.
//!
//! A script names its inputs symbolically: `@Key1`..`@Key10`,
//! `@IntArg1`..`@IntArg20`, `@LongArg1`..`@LongArg20` and
//! `@StringArg1`..`@StringArg20`. [`ScriptArgs`] holds the values for those
//! slots in fixed-size arrays populated by 1-based index. Keys are namespaced
//! when they are assigned.

use std::fmt;

use crate::keyspace::KeySpace;
use crate::wire::WireValue;

/// Number of key slots.
pub const KEY_SLOTS: usize = 10;

/// Number of slots per argument kind.
pub const ARG_SLOTS: usize = 20;

/// The four families of script slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// `@KeyN`
    Key,
    /// `@IntArgN`
    Int,
    /// `@LongArgN`
    Long,
    /// `@StringArgN`
    String,
}

impl SlotKind {
    /// Name prefix used in script source.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Key => "Key",
            Self::Int => "IntArg",
            Self::Long => "LongArg",
            Self::String => "StringArg",
        }
    }

    /// Number of slots of this kind.
    pub const fn capacity(self) -> usize {
        match self {
            Self::Key => KEY_SLOTS,
            Self::Int | Self::Long | Self::String => ARG_SLOTS,
        }
    }
}

/// Errors from addressing a slot that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// The 1-based index is zero or beyond the slot count.
    #[error("{kind:?} slot {index} out of range (1..={max})")]
    SlotOutOfRange {
        /// Slot family.
        kind: SlotKind,
        /// Requested 1-based index.
        index: usize,
        /// Highest valid index.
        max: usize,
    },
}

/// A reference to one slot, as written in script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptParam {
    /// Slot family.
    pub kind: SlotKind,
    /// 1-based index.
    pub index: usize,
}

impl ScriptParam {
    /// Parse a parameter name without its `@` sigil, e.g. `IntArg3`.
    ///
    /// Returns `None` for names that are not slot references or whose index
    /// is outside the slot range.
    pub fn parse(name: &str) -> Option<Self> {
        [SlotKind::Key, SlotKind::Int, SlotKind::Long, SlotKind::String]
            .into_iter()
            .find_map(|kind| {
                let digits = name.strip_prefix(kind.prefix())?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let index = digits.parse::<usize>().ok()?;
                (1..=kind.capacity())
                    .contains(&index)
                    .then_some(Self { kind, index })
            })
    }
}

impl fmt::Display for ScriptParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}", self.kind.prefix(), self.index)
    }
}

/// Values for every script slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptArgs {
    keyspace: KeySpace,
    keys: [Option<String>; KEY_SLOTS],
    ints: [i32; ARG_SLOTS],
    longs: [i64; ARG_SLOTS],
    strings: [Option<String>; ARG_SLOTS],
}

const fn out_of_range(kind: SlotKind, index: usize) -> SlotError {
    SlotError::SlotOutOfRange {
        kind,
        index,
        max: kind.capacity(),
    }
}

fn slot_mut<T>(slots: &mut [T], kind: SlotKind, index: usize) -> Result<&mut T, SlotError> {
    index
        .checked_sub(1)
        .and_then(|position| slots.get_mut(position))
        .ok_or_else(|| out_of_range(kind, index))
}

fn slot<T>(slots: &[T], kind: SlotKind, index: usize) -> Result<&T, SlotError> {
    index
        .checked_sub(1)
        .and_then(|position| slots.get(position))
        .ok_or_else(|| out_of_range(kind, index))
}

impl ScriptArgs {
    /// Empty slots whose keys will be placed in `keyspace`.
    pub fn new(keyspace: KeySpace) -> Self {
        Self {
            keyspace,
            ..Self::default()
        }
    }

    /// Assign key slot `index` (1-based). The key is namespaced.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] for an invalid index.
    pub fn set_key(&mut self, index: usize, key: &str) -> Result<&mut Self, SlotError> {
        let full = self.keyspace.key(key);
        *slot_mut(&mut self.keys, SlotKind::Key, index)? = Some(full);
        Ok(self)
    }

    /// Assign integer slot `index` (1-based).
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] for an invalid index.
    pub fn set_int(&mut self, index: usize, value: i32) -> Result<&mut Self, SlotError> {
        *slot_mut(&mut self.ints, SlotKind::Int, index)? = value;
        Ok(self)
    }

    /// Assign long slot `index` (1-based).
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] for an invalid index.
    pub fn set_long(&mut self, index: usize, value: i64) -> Result<&mut Self, SlotError> {
        *slot_mut(&mut self.longs, SlotKind::Long, index)? = value;
        Ok(self)
    }

    /// Assign string slot `index` (1-based).
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] for an invalid index.
    pub fn set_string(
        &mut self,
        index: usize,
        value: impl Into<String>,
    ) -> Result<&mut Self, SlotError> {
        *slot_mut(&mut self.strings, SlotKind::String, index)? = Some(value.into());
        Ok(self)
    }

    /// Fill key slots in order, starting at `@Key1`.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] if more than [`KEY_SLOTS`] keys
    /// are given.
    pub fn set_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> Result<&mut Self, SlotError> {
        for (position, key) in keys.into_iter().enumerate() {
            self.set_key(position.saturating_add(1), key)?;
        }
        Ok(self)
    }

    /// Fill integer slots in order, starting at `@IntArg1`.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] if more than [`ARG_SLOTS`]
    /// values are given.
    pub fn set_int_args(
        &mut self,
        values: impl IntoIterator<Item = i32>,
    ) -> Result<&mut Self, SlotError> {
        for (position, value) in values.into_iter().enumerate() {
            self.set_int(position.saturating_add(1), value)?;
        }
        Ok(self)
    }

    /// Fill long slots in order, starting at `@LongArg1`.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] if more than [`ARG_SLOTS`]
    /// values are given.
    pub fn set_long_args(
        &mut self,
        values: impl IntoIterator<Item = i64>,
    ) -> Result<&mut Self, SlotError> {
        for (position, value) in values.into_iter().enumerate() {
            self.set_long(position.saturating_add(1), value)?;
        }
        Ok(self)
    }

    /// Fill string slots in order, starting at `@StringArg1`.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] if more than [`ARG_SLOTS`]
    /// values are given.
    pub fn set_string_args<S: Into<String>>(
        &mut self,
        values: impl IntoIterator<Item = S>,
    ) -> Result<&mut Self, SlotError> {
        for (position, value) in values.into_iter().enumerate() {
            self.set_string(position.saturating_add(1), value)?;
        }
        Ok(self)
    }

    /// The namespaced key in slot `index`, if assigned.
    pub fn key(&self, index: usize) -> Option<&str> {
        slot(&self.keys, SlotKind::Key, index).ok()?.as_deref()
    }

    /// Resolve a parameter to the value bound for it.
    ///
    /// Unset integer slots are `0` and unset string slots are empty. An unset
    /// key slot resolves to `None`; what that means is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::SlotOutOfRange`] for an invalid index.
    pub fn resolve(&self, param: ScriptParam) -> Result<Option<WireValue>, SlotError> {
        let ScriptParam { kind, index } = param;
        let value = match kind {
            SlotKind::Key => slot(&self.keys, kind, index)?
                .as_ref()
                .map(|key| WireValue::Bytes(key.as_bytes().to_vec())),
            SlotKind::Int => Some(WireValue::Integer(i64::from(*slot(&self.ints, kind, index)?))),
            SlotKind::Long => Some(WireValue::Integer(*slot(&self.longs, kind, index)?)),
            SlotKind::String => Some(WireValue::Bytes(
                slot(&self.strings, kind, index)?
                    .as_deref()
                    .unwrap_or_default()
                    .as_bytes()
                    .to_vec(),
            )),
        };
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_slot_names() {
        assert_eq!(
            ScriptParam::parse("Key1"),
            Some(ScriptParam { kind: SlotKind::Key, index: 1 })
        );
        assert_eq!(
            ScriptParam::parse("StringArg20"),
            Some(ScriptParam { kind: SlotKind::String, index: 20 })
        );
        assert_eq!(
            ScriptParam::parse("LongArg3"),
            Some(ScriptParam { kind: SlotKind::Long, index: 3 })
        );
        assert_eq!(ScriptParam::parse("Key11"), None);
        assert_eq!(ScriptParam::parse("IntArg0"), None);
        assert_eq!(ScriptParam::parse("IntArg"), None);
        assert_eq!(ScriptParam::parse("Other1"), None);
        assert_eq!(ScriptParam::parse("Key+1"), None);
    }

    #[test]
    fn display_round_trips_the_name() {
        let param = ScriptParam { kind: SlotKind::Int, index: 7 };
        assert_eq!(param.to_string(), "@IntArg7");
    }

    #[test]
    fn keys_are_namespaced_on_assignment() {
        let mut args = ScriptArgs::new(KeySpace::new("ns1"));
        args.set_key(1, "myTest").unwrap().set_int(1, 7878).unwrap();
        assert_eq!(args.key(1), Some("ns=ns1:k=myTest"));
        assert_eq!(args.key(2), None);
        assert_eq!(
            args.resolve(ScriptParam { kind: SlotKind::Int, index: 1 }).unwrap(),
            Some(WireValue::Integer(7878))
        );
    }

    #[test]
    fn unset_slots_resolve_to_defaults() {
        let args = ScriptArgs::default();
        assert_eq!(args.resolve(ScriptParam { kind: SlotKind::Key, index: 3 }).unwrap(), None);
        assert_eq!(
            args.resolve(ScriptParam { kind: SlotKind::String, index: 3 }).unwrap(),
            Some(WireValue::Bytes(Vec::new()))
        );
        assert_eq!(
            args.resolve(ScriptParam { kind: SlotKind::Long, index: 20 }).unwrap(),
            Some(WireValue::Integer(0))
        );
    }

    #[test]
    fn out_of_range_indexes_are_rejected() {
        let mut args = ScriptArgs::default();
        assert_eq!(
            args.set_key(0, "k").unwrap_err(),
            SlotError::SlotOutOfRange { kind: SlotKind::Key, index: 0, max: KEY_SLOTS }
        );
        assert!(args.set_string(21, "x").is_err());
        assert!(args.set_int_args(0..21).is_err());
        assert!(args.set_long_args([1, 2, 3]).is_ok());
        assert!(args.set_string_args(["a", "b"]).is_ok());
        assert!(args.set_keys(["a", "b"]).is_ok());
        assert_eq!(args.key(2), Some("b"));
    }
}
