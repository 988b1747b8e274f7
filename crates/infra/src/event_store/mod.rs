//! Durable record store for business events.
//!
//! The bus treats the store as the single source of truth: claims, outcomes
//! and maintenance all go through `EventRecordStore`, so several processes can
//! share one table.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{EventPage, EventQuery, EventStatus, Pagination};
pub use r#trait::{
    ClaimRequest, EventRecordStore, EventUpdate, StoreCounts, StoreError, dispatch_order,
    lease_deadline,
};
