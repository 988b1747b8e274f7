//! `rentaldesk-core`: shared building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): tenant
//! and actor identifiers, the domain error model and a clock abstraction.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{TenantId, UserId};
