//! API Routes

pub mod health;
pub mod mpesa;
pub mod payments;
pub mod radius;
