//! Typed conversion between domain scalars and store wire values.
//!
//! # Supported types
//!
//! The set is closed: `String`, `Vec<u8>`, `bool`, `i32`, `i64`, `f64`, and
//! the nullable forms `Option<bool>`, `Option<i32>`, `Option<i64>`,
//! `Option<f64>`. [`WireCodec`] is sealed, so asking for any other type
//! (a `char`, a struct) is a compile error rather than a silent coercion.
//!
//! # Three decode outcomes
//!
//! [`decode`] returns `Result<Option<T>, CodecError>`:
//!
//! - `Ok(None)`: the key does not exist.
//! - `Ok(Some(v))` where `v` came from the null marker: the key exists and
//!   holds the empty payload. Nullable types decode it as `None`, plain types
//!   as their default.
//! - `Err(_)`: the key exists but its value cannot be read as `T`. A bad value
//!   is never reported as "not found".
//!
//! # Booleans
//!
//! `true` is stored as the integer `-1` and `false` as `0`. Existing data
//! depends on this mapping; decoding treats any non-zero integer as `true`.

use crate::wire::{Reply, WireValue, format_double};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while turning a reply into a domain value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// The stored text is not a valid representation of the requested type.
    #[error("cannot parse {raw:?} as {type_name}: {reason}")]
    Parse {
        /// Requested type.
        type_name: &'static str,
        /// The raw payload, lossily decoded for display.
        raw: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The reply has a different shape than the requested type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Requested type (arrays are rendered as `T[]`).
        expected: String,
        /// Shape or type actually present.
        found: &'static str,
    },

    /// The stored number does not fit the requested integer width.
    #[error("value {value} out of range for {type_name}")]
    OutOfRange {
        /// Requested type.
        type_name: &'static str,
        /// The stored value.
        value: i64,
    },

    /// The store answered this command with an error reply.
    #[error("store error reply: {0}")]
    ErrorReply(String),
}

impl CodecError {
    fn parse(type_name: &'static str, raw: &[u8], reason: &impl std::fmt::Display) -> Self {
        Self::Parse {
            type_name,
            raw: String::from_utf8_lossy(raw).into_owned(),
            reason: reason.to_string(),
        }
    }

    fn mismatch(expected: &str, found: &'static str) -> Self {
        Self::TypeMismatch {
            expected: expected.to_owned(),
            found,
        }
    }
}

// ---------------------------------------------------------------------------
// The codec trait
// ---------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
    pub trait SealedNullable {}

    impl Sealed for String {}
    impl Sealed for Vec<u8> {}
    impl Sealed for bool {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
    impl<T: super::Nullable> Sealed for Option<T> {}

    impl SealedNullable for bool {}
    impl SealedNullable for i32 {}
    impl SealedNullable for i64 {}
    impl SealedNullable for f64 {}
}

/// A scalar type that can be stored in and read back from the store.
///
/// This trait is sealed; see the module docs for the supported set.
pub trait WireCodec: sealed::Sealed + Sized + Send + 'static {
    /// Name used in decode errors.
    const TYPE_NAME: &'static str;

    /// Encode the value for use as a command argument.
    fn encode(&self) -> WireValue;

    /// The value a present key holding the null marker decodes to.
    fn from_null_marker() -> Self;

    /// Parse a bulk or status payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Parse`] when the payload is not a valid
    /// representation of `Self`.
    fn from_text(raw: &[u8]) -> Result<Self, CodecError>;

    /// Convert an integer reply.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OutOfRange`] when the value does not fit.
    fn from_integer(value: i64) -> Result<Self, CodecError>;

    /// Convert a double reply.
    ///
    /// # Errors
    ///
    /// Integer-like types return [`CodecError::TypeMismatch`].
    fn from_double(value: f64) -> Result<Self, CodecError> {
        let _ = value;
        Err(CodecError::mismatch(Self::TYPE_NAME, "double"))
    }
}

/// Scalars that have a nullable form (`Option<Self>` is a [`WireCodec`]).
///
/// `String` is deliberately not nullable: the null marker is the empty
/// payload, which is also the empty string.
pub trait Nullable: WireCodec + sealed::SealedNullable {
    /// Name of the nullable form used in decode errors.
    const NULLABLE_NAME: &'static str;
}

fn text<'a>(type_name: &'static str, raw: &'a [u8]) -> Result<&'a str, CodecError> {
    std::str::from_utf8(raw).map_err(|err| CodecError::parse(type_name, raw, &err))
}

impl WireCodec for String {
    const TYPE_NAME: &'static str = "string";

    fn encode(&self) -> WireValue {
        WireValue::Bytes(self.as_bytes().to_vec())
    }

    fn from_null_marker() -> Self {
        Self::new()
    }

    fn from_text(raw: &[u8]) -> Result<Self, CodecError> {
        text(Self::TYPE_NAME, raw).map(str::to_owned)
    }

    fn from_integer(value: i64) -> Result<Self, CodecError> {
        Ok(value.to_string())
    }

    fn from_double(value: f64) -> Result<Self, CodecError> {
        Ok(format_double(value))
    }
}

impl WireCodec for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn encode(&self) -> WireValue {
        WireValue::Bytes(self.clone())
    }

    fn from_null_marker() -> Self {
        Self::new()
    }

    fn from_text(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(raw.to_vec())
    }

    fn from_integer(value: i64) -> Result<Self, CodecError> {
        Ok(value.to_string().into_bytes())
    }

    fn from_double(value: f64) -> Result<Self, CodecError> {
        Ok(format_double(value).into_bytes())
    }
}

impl WireCodec for bool {
    const TYPE_NAME: &'static str = "bool";

    fn encode(&self) -> WireValue {
        WireValue::Integer(if *self { -1 } else { 0 })
    }

    fn from_null_marker() -> Self {
        false
    }

    fn from_text(raw: &[u8]) -> Result<Self, CodecError> {
        text(Self::TYPE_NAME, raw)?
            .parse::<i64>()
            .map(|value| value != 0)
            .map_err(|err| CodecError::parse(Self::TYPE_NAME, raw, &err))
    }

    fn from_integer(value: i64) -> Result<Self, CodecError> {
        Ok(value != 0)
    }
}

impl WireCodec for i32 {
    const TYPE_NAME: &'static str = "i32";

    fn encode(&self) -> WireValue {
        WireValue::Integer(i64::from(*self))
    }

    fn from_null_marker() -> Self {
        0
    }

    fn from_text(raw: &[u8]) -> Result<Self, CodecError> {
        let wide = text(Self::TYPE_NAME, raw)?
            .parse::<i64>()
            .map_err(|err| CodecError::parse(Self::TYPE_NAME, raw, &err))?;
        Self::from_integer(wide)
    }

    fn from_integer(value: i64) -> Result<Self, CodecError> {
        Self::try_from(value).ok().ok_or(CodecError::OutOfRange {
            type_name: Self::TYPE_NAME,
            value,
        })
    }
}

impl WireCodec for i64 {
    const TYPE_NAME: &'static str = "i64";

    fn encode(&self) -> WireValue {
        WireValue::Integer(*self)
    }

    fn from_null_marker() -> Self {
        0
    }

    fn from_text(raw: &[u8]) -> Result<Self, CodecError> {
        text(Self::TYPE_NAME, raw)?
            .parse::<Self>()
            .map_err(|err| CodecError::parse(Self::TYPE_NAME, raw, &err))
    }

    fn from_integer(value: i64) -> Result<Self, CodecError> {
        Ok(value)
    }
}

impl WireCodec for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn encode(&self) -> WireValue {
        WireValue::Double(*self)
    }

    fn from_null_marker() -> Self {
        0.0
    }

    fn from_text(raw: &[u8]) -> Result<Self, CodecError> {
        text(Self::TYPE_NAME, raw)?
            .parse::<Self>()
            .map_err(|err| CodecError::parse(Self::TYPE_NAME, raw, &err))
    }

    #[allow(clippy::cast_precision_loss)] // integer replies above 2^53 round, as the store does
    fn from_integer(value: i64) -> Result<Self, CodecError> {
        Ok(value as Self)
    }

    fn from_double(value: f64) -> Result<Self, CodecError> {
        Ok(value)
    }
}

impl Nullable for bool {
    const NULLABLE_NAME: &'static str = "bool?";
}

impl Nullable for i32 {
    const NULLABLE_NAME: &'static str = "i32?";
}

impl Nullable for i64 {
    const NULLABLE_NAME: &'static str = "i64?";
}

impl Nullable for f64 {
    const NULLABLE_NAME: &'static str = "f64?";
}

impl<T: Nullable> WireCodec for Option<T> {
    const TYPE_NAME: &'static str = T::NULLABLE_NAME;

    fn encode(&self) -> WireValue {
        self.as_ref().map_or(WireValue::Null, WireCodec::encode)
    }

    fn from_null_marker() -> Self {
        None
    }

    fn from_text(raw: &[u8]) -> Result<Self, CodecError> {
        T::from_text(raw).map(Some)
    }

    fn from_integer(value: i64) -> Result<Self, CodecError> {
        T::from_integer(value).map(Some)
    }

    fn from_double(value: f64) -> Result<Self, CodecError> {
        T::from_double(value).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Decoding replies
// ---------------------------------------------------------------------------

/// Decode a single-value reply.
///
/// `Ok(None)` means the key was not present.
///
/// # Errors
///
/// Returns a [`CodecError`] when the reply is present but is not a `T`, or
/// when the store answered with an error reply.
pub fn decode<T: WireCodec>(reply: &Reply) -> Result<Option<T>, CodecError> {
    match reply {
        Reply::Nil => Ok(None),
        Reply::Bulk(bytes) if bytes.is_empty() => Ok(Some(T::from_null_marker())),
        Reply::Bulk(bytes) => T::from_text(bytes).map(Some),
        Reply::Status(status) => T::from_text(status.as_bytes()).map(Some),
        Reply::Integer(value) => T::from_integer(*value).map(Some),
        Reply::Double(value) => T::from_double(*value).map(Some),
        Reply::Array(_) => Err(CodecError::mismatch(T::TYPE_NAME, "array")),
        Reply::Error(message) => Err(CodecError::ErrorReply(message.clone())),
    }
}

/// Decode an array reply element by element.
///
/// A nil reply (missing key) decodes to an empty vector; a nil element
/// decodes to the null marker value.
///
/// # Errors
///
/// Returns [`CodecError::TypeMismatch`] when the reply is a scalar rather
/// than an array, or the first element error encountered.
pub fn decode_array<T: WireCodec>(reply: &Reply) -> Result<Vec<T>, CodecError> {
    match reply {
        Reply::Nil => Ok(Vec::new()),
        Reply::Array(items) => items
            .iter()
            .map(|item| match item {
                Reply::Nil => Ok(T::from_null_marker()),
                Reply::Array(_) => Err(CodecError::mismatch(T::TYPE_NAME, "array")),
                other => decode::<T>(other).map(|value| value.unwrap_or_else(T::from_null_marker)),
            })
            .collect(),
        Reply::Error(message) => Err(CodecError::ErrorReply(message.clone())),
        other => Err(CodecError::TypeMismatch {
            expected: format!("{}[]", T::TYPE_NAME),
            found: other.kind(),
        }),
    }
}
