//! # Switchboard
//!
//! A subscription directory: records which subscribers want which message
//! types, persists that durably, and answers "who wants message type T?"
//! from an in-memory view kept fresh by periodic full rebuilds.
//!
//! ## Core Concepts
//!
//! - **Store**: the durable source of truth, reached through scoped connections
//! - **Snapshot**: an immutable message type -> subscribers view built from one full read
//! - **Directory**: writes through to the store, patches the live view, serves lookups
//! - **Scheduler**: rebuilds the view on a timer so other writers' changes show up
//!
//! ## Example
//!
//! ```ignore
//! use switchboard::{AcceptAll, Address, DirectoryConfig, LogStore, SubscriptionDirectory};
//! use std::sync::Arc;
//!
//! let store = LogStore::open_or_create("./subscriptions")?;
//! let directory = Arc::new(SubscriptionDirectory::new(
//!     store,
//!     Arc::new(AcceptAll),
//!     DirectoryConfig::default(),
//! )?);
//! let _refresher = directory.spawn_refresher()?;
//!
//! let node = Address::parse("tcp://node1:9000")?;
//! directory.subscribe(&node, &"OrderCreated".into())?;
//!
//! assert_eq!(
//!     directory.subscriber_addresses_for_message(&"OrderCreated".into()),
//!     vec![node],
//! );
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod types;

// Re-exports
pub use config::{DirectoryConfig, DEFAULT_REFRESH_INTERVAL};
pub use directory::{DirectoryStats, RefreshReport, SubscriptionDirectory};
pub use error::{DirectoryError, Result};
pub use resolver::{AcceptAll, Resolution, TypeDescriptor, TypeRegistry, TypeResolver};
pub use scheduler::{
    IntervalTicker, ManualTicker, RefreshOutcome, RefreshScheduler, TickHandle, Ticker,
};
pub use snapshot::{BuildReport, Patch, Snapshot};
pub use store::{LogStore, MemoryStore, StoreConnection, SubscriptionStore};
pub use types::*;
