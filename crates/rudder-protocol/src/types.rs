//! Typed reply values.
//!
//! The [`Reply`] enum is what a Connection hands back after decoding a
//! server response. Bulk payloads use `Bytes` so replies can be cloned
//! and re-routed (retries, redirects) without copying the body.

use bytes::Bytes;

/// A single decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status line, e.g. `OK`.
    Status(String),

    /// Error line, e.g. `MOVED 3000 10.0.0.7:6379`.
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe bulk string.
    Bulk(Bytes),

    /// Ordered array of replies.
    Array(Vec<Reply>),

    /// Null reply.
    Null,
}

impl Reply {
    /// Returns `true` if this reply is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    /// Returns the error text if this is an error reply.
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Reply::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the integer value if this is an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the element list if this is an array reply.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the bulk payload as UTF-8 text, if this is a bulk reply
    /// holding valid UTF-8. Status replies also qualify: several servers
    /// answer `SENTINEL` queries with status strings where others use
    /// bulk strings.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Bulk(b) => std::str::from_utf8(b).ok(),
            Reply::Status(s) => Some(s),
            _ => None,
        }
    }
}
