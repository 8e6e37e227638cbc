//! Store-facing value representations.
//!
//! [`WireValue`] is what the data-access layer hands to the store as a command
//! argument. [`Reply`] is what the store answers, one per command. Both are
//! deliberately small: the store speaks binary-safe strings, integers,
//! doubles, arrays, and nil, and nothing else crosses this boundary.

use std::fmt;

// ---------------------------------------------------------------------------
// Outbound values
// ---------------------------------------------------------------------------

/// A scalar argument as understood by the store's protocol.
///
/// The [`WireValue::Null`] marker is what the `None` form of a nullable
/// domain type encodes to. On the wire it is an empty payload, which is
/// distinct from the string `"null"` and from numeric zero.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// The absent marker for a nullable value set to `None`.
    Null,
    /// A signed 64-bit integer, rendered in decimal.
    Integer(i64),
    /// A double, rendered in its shortest round-trip decimal form.
    Double(f64),
    /// Raw bytes, sent unmodified.
    Bytes(Vec<u8>),
}

impl WireValue {
    /// Returns `true` for the absent marker.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Render the value into the binary-safe payload sent on the wire.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Null => Vec::new(),
            Self::Integer(value) => value.to_string().into_bytes(),
            Self::Double(value) => format_double(value).into_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }

    /// Borrowing variant of [`WireValue::into_bytes`].
    pub fn to_bytes(&self) -> Vec<u8> {
        self.clone().into_bytes()
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        Self::Bytes(value.into_bytes())
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

/// Format a double the way the store expects numeric arguments.
///
/// Whole numbers have no fractional part (`3`, not `3.0`), infinities are
/// `inf`/`-inf`, everything else uses the shortest representation that parses
/// back to the same bits.
pub fn format_double(value: f64) -> String {
    if value.is_infinite() {
        if value.is_sign_positive() {
            "inf".to_owned()
        } else {
            "-inf".to_owned()
        }
    } else {
        format!("{value}")
    }
}

// ---------------------------------------------------------------------------
// Inbound replies
// ---------------------------------------------------------------------------

/// One reply from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The key (or element) does not exist.
    Nil,
    /// A simple status line such as `OK` or `QUEUED`.
    Status(String),
    /// An integer reply.
    Integer(i64),
    /// A double reply (RESP3 servers and some clients).
    Double(f64),
    /// A binary-safe bulk string.
    Bulk(Vec<u8>),
    /// A nested array of replies.
    Array(Vec<Self>),
    /// An error reply for this one command.
    ///
    /// Inside a committed transaction, an error reply affects only the
    /// command it belongs to; the other commands were still applied.
    Error(String),
}

impl Reply {
    /// The canonical `OK` status reply.
    pub fn ok() -> Self {
        Self::Status("OK".to_owned())
    }

    /// Build a bulk reply from anything byte-like.
    pub fn bulk(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bulk(bytes.into())
    }

    /// Short name of the reply shape, used in decode errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Status(_) => "status",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::Bulk(_) => "bulk",
            Self::Array(_) => "array",
            Self::Error(_) => "error",
        }
    }

    /// Returns `true` for [`Reply::Nil`].
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Returns the message of an error reply.
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "(nil)"),
            Self::Status(status) => write!(f, "{status}"),
            Self::Integer(value) => write!(f, "(integer) {value}"),
            Self::Double(value) => write!(f, "(double) {}", format_double(*value)),
            Self::Bulk(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            Self::Array(items) => write!(f, "(array of {})", items.len()),
            Self::Error(message) => write!(f, "(error) {message}"),
        }
    }
}
