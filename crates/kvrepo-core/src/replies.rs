//! Reply decoders shared by single-shot operations and batches.
//!
//! Each decoder is a plain `fn(&Reply) -> Result<T, RepoError>`, so a batch
//! can store it next to the recorded command and run it after `EXEC`.

use std::time::Duration;

use kvrepo_types::{CodecError, Reply, WireCodec, decode, decode_array};

use crate::error::RepoError;

/// A reply decoder for one recorded operation.
pub type Decoder<T> = fn(&Reply) -> Result<T, RepoError>;

/// Value reads: `None` when the key is absent.
pub fn optional<T: WireCodec>(reply: &Reply) -> Result<Option<T>, RepoError> {
    Ok(decode::<T>(reply)?)
}

/// Replies that always carry a value, such as counters.
pub fn required<T: WireCodec>(reply: &Reply) -> Result<T, RepoError> {
    decode::<T>(reply)?.ok_or_else(|| {
        RepoError::Decode(CodecError::TypeMismatch {
            expected: T::TYPE_NAME.to_owned(),
            found: "nil",
        })
    })
}

/// Multi-value reads. A missing key is an empty vector.
pub fn array<T: WireCodec>(reply: &Reply) -> Result<Vec<T>, RepoError> {
    Ok(decode_array::<T>(reply)?)
}

/// `SET`: `OK` when written, nil when an `NX`/`XX` condition failed.
pub fn acknowledged(reply: &Reply) -> Result<bool, RepoError> {
    match reply {
        Reply::Nil => Ok(false),
        Reply::Error(message) => Err(CodecError::ErrorReply(message.clone()).into()),
        _ => Ok(true),
    }
}

/// Integer replies counting affected elements; `true` when any were.
pub fn positive(reply: &Reply) -> Result<bool, RepoError> {
    Ok(required::<i64>(reply)? > 0)
}

/// `PTTL`: `None` for a missing key or one without an expiry.
pub fn time_to_live(reply: &Reply) -> Result<Option<Duration>, RepoError> {
    let millis = required::<i64>(reply)?;
    Ok(u64::try_from(millis).ok().map(Duration::from_millis))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn set_outcomes() {
        assert!(acknowledged(&Reply::ok()).unwrap());
        assert!(!acknowledged(&Reply::Nil).unwrap());
        assert!(acknowledged(&Reply::Error("WRONGTYPE".to_owned())).is_err());
    }

    #[test]
    fn ttl_sentinels_are_none() {
        assert_eq!(time_to_live(&Reply::Integer(-2)).unwrap(), None);
        assert_eq!(time_to_live(&Reply::Integer(-1)).unwrap(), None);
        assert_eq!(
            time_to_live(&Reply::Integer(1500)).unwrap(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn required_rejects_nil() {
        assert!(matches!(
            required::<i64>(&Reply::Nil),
            Err(RepoError::Decode(CodecError::TypeMismatch { found: "nil", .. }))
        ));
        assert!(positive(&Reply::Integer(2)).unwrap());
        assert!(!positive(&Reply::Integer(0)).unwrap());
    }
}
