//! Value Objects - Immutable domain primitives with validation
//!
//! Identifiers are UUID newtypes so a subscriber id can never be passed where
//! a package id is expected. Logins are validated once at the edge and then
//! carried as [`Login`].

use crate::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Parse from the canonical textual form
            pub fn parse(raw: &str) -> DomainResult<Self> {
                Uuid::parse_str(raw.trim())
                    .map(Self)
                    .map_err(|e| DomainError::InvalidId(format!("{}: {}", raw, e)))
            }

            /// Inner UUID
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
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
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_id!(
    /// Subscriber (customer) identifier
    SubscriberId
);
uuid_id!(
    /// Bandwidth package identifier
    PackageId
);
uuid_id!(
    /// Owning tenant (agency) identifier
    TenantId
);
uuid_id!(
    /// Access station identifier
    StationId
);
uuid_id!(
    /// Payment transaction identifier
    TransactionId
);

/// Subscriber login name as presented by the NAS
///
/// # Invariants
/// - Non-empty, at most 253 characters
/// - No whitespace or control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Login(String);

impl Login {
    /// Maximum accepted length, the RADIUS User-Name attribute limit
    pub const MAX_LEN: usize = 253;

    /// Validate a raw login
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::InvalidLogin("cannot be empty".into()));
        }
        if raw.len() > Self::MAX_LEN {
            return Err(DomainError::InvalidLogin(format!("max {} characters", Self::MAX_LEN)));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DomainError::InvalidLogin(format!("{:?} contains whitespace", raw)));
        }
        Ok(Self(raw))
    }

    /// Get inner value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Login {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Login> for String {
    fn from(login: Login) -> Self {
        login.0
    }
}

/// Stored subscriber credential
///
/// Never printed: `Debug` is redacted so a subscriber can be logged whole.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wrap a plaintext secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Compare against a presented secret without early exit on mismatch
    pub fn matches(&self, presented: &str) -> bool {
        let stored = self.0.as_bytes();
        let presented = presented.as_bytes();
        if stored.len() != presented.len() {
            return false;
        }
        stored
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Plaintext value, for the control:Cleartext-Password attribute
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

/// Outcome of a point lookup
///
/// Keeps "no such record" apart from "the key could never name a record";
/// store failures travel separately as `Err(RepositoryError)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// Record exists
    Found(T),
    /// Key is well formed but nothing matches
    NotFound,
    /// Key is malformed
    InvalidId(String),
}

impl<T> Lookup<T> {
    /// Convert to an `Option`, discarding the miss reason
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound | Lookup::InvalidId(_) => None,
        }
    }

    /// Whether a record was found
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    /// Map the found value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::InvalidId(reason) => Lookup::InvalidId(reason),
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Lookup::NotFound, Lookup::Found)
    }
}
