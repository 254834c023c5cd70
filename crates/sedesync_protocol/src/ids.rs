//! Identifier newtypes.
//!
//! All identifiers are UUIDs. A `GlobalId` is assigned when a record is
//! created and stays the same at every site; a `SiteId` names a site for
//! its whole life; a `ConflictId` names one open conflict.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The all-zero identifier, never generated by [`Self::new`].
            #[must_use]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Returns the raw 16 bytes.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| ProtocolError::InvalidId(s.to_string()))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a site ("sede").
    SiteId
);

uuid_id!(
    /// Identifier of a syncable record, unique within its table across all sites.
    GlobalId
);

uuid_id!(
    /// Identifier of an entry in the conflict registry.
    ConflictId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(GlobalId::new(), GlobalId::new());
        assert_ne!(SiteId::new(), SiteId::new());
    }

    #[test]
    fn parse_and_display_agree() {
        let id = ConflictId::new();
        let parsed: ConflictId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "not-a-uuid".parse::<SiteId>().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidId(_)));
    }
}
