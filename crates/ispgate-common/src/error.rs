//! Error types shared by every ispgate crate

use thiserror::Error;

/// Validation failure of a domain value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed identifier
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Malformed subscriber login
    #[error("invalid login: {0}")]
    InvalidLogin(String),

    /// Package fails its own invariants
    #[error("invalid package: {0}")]
    InvalidPackage(String),

    /// Unknown enumeration value
    #[error("unknown {kind}: {value}")]
    UnknownVariant {
        /// Enumeration name
        kind: &'static str,
        /// Offending value
        value: String,
    },
}

/// Result type for domain validation
pub type DomainResult<T> = Result<T, DomainError>;
