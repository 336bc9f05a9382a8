//! Durable store adapters.
//!
//! The directory talks to its durable registry only through these traits.
//! A connection is opened per call and released when dropped, on every exit
//! path. No transaction spanning several calls is assumed.
//!
//! Two adapters ship with the crate:
//! - [`MemoryStore`]: in-process tables, for embedding and tests
//! - [`LogStore`]: append-only, checksummed log files shared between processes

mod log;
mod memory;

pub use log::LogStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{Filter, SubscriptionRecord};

/// Source of scoped store connections.
pub trait SubscriptionStore: Send + Sync {
    /// Acquire a connection. Dropping it releases any resource it holds.
    fn open_connection(&self) -> Result<Box<dyn StoreConnection + '_>>;
}

/// Operations the directory needs from one connection.
pub trait StoreConnection {
    /// Number of rows in `table` matching `filter`.
    fn count(&mut self, table: &str, filter: &Filter) -> Result<u64>;

    /// Add one row.
    fn insert(&mut self, table: &str, record: &SubscriptionRecord) -> Result<()>;

    /// Remove every row matching `filter`, returning how many were removed.
    fn delete(&mut self, table: &str, filter: &Filter) -> Result<u64>;

    /// Rows in `table` matching `filter`.
    fn query(&mut self, table: &str, filter: &Filter) -> Result<Vec<SubscriptionRecord>> {
        let mut rows = self.query_all(table)?;
        rows.retain(|r| filter.matches(r));
        Ok(rows)
    }

    /// Full scan of `table`. A missing table reads as empty.
    fn query_all(&mut self, table: &str) -> Result<Vec<SubscriptionRecord>>;
}

impl<S: SubscriptionStore + ?Sized> SubscriptionStore for std::sync::Arc<S> {
    fn open_connection(&self) -> Result<Box<dyn StoreConnection + '_>> {
        (**self).open_connection()
    }
}
