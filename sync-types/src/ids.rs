//! Identity and ordering types for objsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// Declares a UUID-backed identifier newtype.
///
/// All of these are UUID v4 values, displayed in hyphenated form and
/// serialized transparently so persisted rows stay readable.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Create an identifier from raw bytes.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                uuid::Uuid::from_slice(bytes).ok().map(Self)
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| SyncError::InvalidId {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Identifies an object (a logical group of related files).
    ///
    /// Generated by the device that first uploads the object.
    FileGroupId,
    "file group"
);

uuid_id!(
    /// Identifies a single file within an object.
    FileId,
    "file"
);

uuid_id!(
    /// Identifies the sharing group that owns an object.
    SharingGroupId,
    "sharing group"
);

uuid_id!(
    /// Identifies a persisted transfer tracker row.
    TrackerId,
    "tracker"
);

uuid_id!(
    /// Identifies one upload batch as seen by the server.
    BatchId,
    "batch"
);

/// Server-assigned version of a file.
///
/// Version 0 is the first upload ("v0"); every accepted change increments
/// it by one. Versions never decrease.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FileVersion(u32);

impl FileVersion {
    /// Create a version with the given value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// The first version of any file.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The version following this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// True for the first version of a file.
    pub fn is_v0(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileVersion({})", self.0)
    }
}

/// Handle of a server-side asynchronous job (a versioned upload batch or a
/// deletion) that the client polls until it completes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeferredId(u64);

impl DeferredId {
    /// Create a deferred id with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeferredId({})", self.0)
    }
}
