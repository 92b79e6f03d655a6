//! Core identifier types for SheetGuard.
//!
//! These types provide type-safe wrappers around identifiers, preventing
//! accidental misuse of different ID kinds (a snapshot id is never a
//! transaction id, even though both are `u64` underneath).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a `u64`-backed identifier with the usual helpers.
macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Invalid identifier, used as a sentinel value.
            pub const INVALID: Self = Self(0);

            /// First valid identifier.
            pub const FIRST: Self = Self(1);

            /// Creates a new identifier from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Returns the next identifier.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                Self(self.0.saturating_add(1))
            }

            /// Checks if this is a valid identifier.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != Self::INVALID.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if *self == Self::INVALID {
                    write!(f, concat!(stringify!($name), "(INVALID)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(id: u64) -> Self {
                Self::new(id)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

numeric_id!(
    /// Transaction identifier.
    ///
    /// Transaction IDs are monotonically increasing within one process and
    /// are restored from the state store on restart so they never repeat.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sheetguard_common::types::TxnId;
    ///
    /// let txn = TxnId::new(1);
    /// assert!(txn.is_valid());
    /// assert_eq!(txn.to_string(), "txn-1");
    /// ```
    TxnId,
    "txn"
);

numeric_id!(
    /// Operation identifier, assigned to every mutation that reaches the
    /// executor. History entries, idempotency keys and diff sampling seeds
    /// are all derived from it.
    OpId,
    "op"
);

numeric_id!(
    /// Snapshot identifier.
    SnapshotId,
    "snap"
);

numeric_id!(
    /// Conflict identifier.
    ConflictId,
    "conflict"
);

/// Document identifier - the remote spreadsheet's id.
///
/// Document ids are opaque strings chosen by the document store.
///
/// # Example
///
/// ```rust
/// use sheetguard_common::types::DocumentId;
///
/// let doc = DocumentId::new("S1");
/// assert_eq!(doc.as_str(), "S1");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a new document id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Caller session identifier, used to tell local writes from remote ones
/// during conflict detection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new session id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Document version token reported by the document store.
///
/// Versions are opaque to callers but totally ordered. When the executor
/// reports non-monotonic versions, ordering comparisons are not trusted and
/// conflict detection falls back to checksums.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentVersion(u64);

impl DocumentVersion {
    /// The version of a document that has never been observed.
    pub const ZERO: Self = Self(0);

    /// Creates a version from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following version.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Debug for DocumentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for DocumentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
