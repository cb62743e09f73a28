//! Delivery persistence.

pub mod postgres;
pub mod store;

pub use postgres::PostgresDeliveryStore;
pub use store::{DeliveryStore, DeliveryStoreError, InMemoryDeliveryStore};

#[cfg(test)]
pub(crate) use store::StaleReads;
