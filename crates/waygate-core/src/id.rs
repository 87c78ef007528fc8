//! Identifiers for sessions, runs, and capsules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of lowercase hex digits in a capsule hash.
pub const CAPSULE_HASH_LEN: usize = 16;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a string form.
            ///
            /// # Errors
            ///
            /// Returns [`IdError::InvalidUuid`] if the string is not a UUID.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| IdError::InvalidUuid(s.to_string()))
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
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_id! {
    /// Identifies one browser-executor session.
    SessionId
}

uuid_id! {
    /// Identifies one invocation of a capsule.
    RunId
}

/// Content address of a capsule: the first [`CAPSULE_HASH_LEN`] lowercase
/// hex digits of the SHA-256 over the canonical unsigned manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapsuleHash(String);

impl CapsuleHash {
    /// Wrap an already-computed hash string.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::InvalidCapsuleHash`] unless the input is exactly
    /// [`CAPSULE_HASH_LEN`] lowercase hex digits.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let valid = s.len() == CAPSULE_HASH_LEN
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(IdError::InvalidCapsuleHash(s.to_string()))
        }
    }

    /// The hash as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapsuleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CapsuleHash {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CapsuleHash {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<CapsuleHash> for String {
    fn from(h: CapsuleHash) -> Self {
        h.0
    }
}

/// Errors produced when parsing identifiers.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// The string was not a valid UUID.
    #[error("invalid identifier: {0}")]
    InvalidUuid(String),

    /// The string was not a valid capsule hash.
    #[error("invalid capsule hash: {0}")]
    InvalidCapsuleHash(String),
}
