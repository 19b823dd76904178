//! ispgate common - shared types for the ISP access and billing engines
//!
//! This crate provides:
//! - The domain model read by RADIUS authorization and mutated by
//!   accounting and payment reconciliation
//! - Repository traits for the single authoritative store
//! - [`MemoryStore`], the in-process implementation of every repository
//! - Error handling

#![warn(clippy::all)]

pub mod domain;
pub mod error;
pub mod memory;

pub use domain::*;
pub use error::*;
pub use memory::{MemoryStore, StoreSeed};
