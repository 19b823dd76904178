//! ispgate domain model
//!
//! - **Value Objects**: ids, [`Login`], [`Credential`], [`Lookup`]
//! - **Entities**: subscribers, packages, tenants, accounting and payment records
//! - **Repositories**: async traits over the authoritative store

pub mod value_objects;
pub mod model;
pub mod repositories;

pub use value_objects::*;
pub use model::*;
pub use repositories::*;
