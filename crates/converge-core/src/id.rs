//! Strongly-typed identifiers for converge entities.
//!
//! Stack, traversal, template and engine identifiers are ULIDs:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! Resource identifiers are numeric because the persisted dependency graph
//! stores them as JSON numbers.
//!
//! # Example
//!
//! ```rust
//! use converge_core::id::{StackId, TraversalId};
//!
//! let stack = StackId::generate();
//! let traversal = TraversalId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: StackId = traversal;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
                chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!(concat!("invalid ", $label, " '{}': {}"), s, e),
                    })
            }
        }
    };
}

ulid_id!(
    /// A unique identifier for a stack.
    ///
    /// A stack is one instance of a template application; it owns its
    /// resources, templates and sync points.
    StackId,
    "stack ID"
);

ulid_id!(
    /// An opaque token identifying one convergence run over a stack.
    ///
    /// Every callback carries the traversal it belongs to; callbacks whose
    /// traversal is no longer the stack's current one are discarded.
    TraversalId,
    "traversal ID"
);

ulid_id!(
    /// A unique identifier for a stored raw template.
    TemplateId,
    "template ID"
);

ulid_id!(
    /// Identity of one engine process, used as the owner of stack locks.
    EngineId,
    "engine ID"
);

/// A numeric identifier for a persisted resource row.
///
/// The same logical resource may be represented by several rows over time
/// (one per replacement), each with its own `ResourceId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Creates a resource ID from its numeric value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid resource ID '{s}': {e}"),
        })
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
