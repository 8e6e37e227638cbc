//! Key namespacing.
//!
//! A non-empty namespace prefixes every key as `ns={namespace}:k={key}`, so
//! several logical repositories can share one store database.

/// The namespace applied to every key a repository touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Create a key space. An empty namespace leaves keys untouched.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace itself.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full store key for a caller key.
    pub fn key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_owned()
        } else {
            format!("ns={}:k={key}", self.namespace)
        }
    }

    /// Full store keys for several caller keys.
    pub fn keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        keys.into_iter().map(|key| self.key(key)).collect()
    }

    /// Caller key for a full store key. Keys outside the namespace are
    /// returned unchanged.
    pub fn strip<'a>(&self, full: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            return full;
        }
        full.strip_prefix("ns=")
            .and_then(|rest| rest.strip_prefix(self.namespace.as_str()))
            .and_then(|rest| rest.strip_prefix(":k="))
            .unwrap_or(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_is_identity() {
        let space = KeySpace::default();
        assert_eq!(space.key("a"), "a");
        assert_eq!(space.strip("a"), "a");
    }

    #[test]
    fn namespace_prefixes_and_strips() {
        let space = KeySpace::new("orders");
        assert_eq!(space.key("42"), "ns=orders:k=42");
        assert_eq!(space.key("*"), "ns=orders:k=*");
        assert_eq!(space.strip("ns=orders:k=42"), "42");
        assert_eq!(space.strip("ns=other:k=42"), "ns=other:k=42");
        assert_eq!(space.keys(["a", "b"]), vec!["ns=orders:k=a", "ns=orders:k=b"]);
    }
}
