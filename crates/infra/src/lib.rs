//! Infrastructure layer: record stores and the running event bus.

pub mod event_bus;
pub mod event_store;

#[cfg(test)]
mod integration_tests;

pub use event_bus::{BusConfig, BusError, BusStats, DispatchReport, EventBus, PublishResult};
pub use event_store::{EventRecordStore, InMemoryEventStore, PostgresEventStore, StoreError};
