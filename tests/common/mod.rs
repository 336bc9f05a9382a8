//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use switchboard::{
    AcceptAll, Address, DirectoryConfig, DirectoryError, Filter, MemoryStore, Result,
    StoreConnection, SubscriptionDirectory, SubscriptionRecord, SubscriptionStore,
};

pub const TABLE: &str = "subscriptions";

/// How a [`FlakyStore`] misbehaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Fault {
    None = 0,
    /// Connections cannot be opened.
    Unreachable = 1,
    /// Connections open, but inserts and deletes fail.
    RejectWrites = 2,
    /// Connections open, but full scans fail. Filtered queries still work.
    RejectScans = 3,
}

/// A [`MemoryStore`] that fails on demand.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fault: Arc<AtomicU8>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fault: Arc::new(AtomicU8::new(Fault::None as u8)),
        }
    }

    pub fn set_fault(&self, fault: Fault) {
        self.fault.store(fault as u8, Ordering::SeqCst);
    }

    fn fault(&self) -> u8 {
        self.fault.load(Ordering::SeqCst)
    }
}

impl SubscriptionStore for FlakyStore {
    fn open_connection(&self) -> Result<Box<dyn StoreConnection + '_>> {
        if self.fault() == Fault::Unreachable as u8 {
            return Err(DirectoryError::Storage("connection refused".into()));
        }
        Ok(Box::new(FlakyConnection {
            inner: self.inner.open_connection()?,
            fault: self.fault(),
        }))
    }
}

struct FlakyConnection<'a> {
    inner: Box<dyn StoreConnection + 'a>,
    fault: u8,
}

impl StoreConnection for FlakyConnection<'_> {
    fn count(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        self.inner.count(table, filter)
    }

    fn insert(&mut self, table: &str, record: &SubscriptionRecord) -> Result<()> {
        if self.fault == Fault::RejectWrites as u8 {
            return Err(DirectoryError::Storage("insert rejected".into()));
        }
        self.inner.insert(table, record)
    }

    fn delete(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        if self.fault == Fault::RejectWrites as u8 {
            return Err(DirectoryError::Storage("delete rejected".into()));
        }
        self.inner.delete(table, filter)
    }

    fn query(&mut self, table: &str, filter: &Filter) -> Result<Vec<SubscriptionRecord>> {
        self.inner.query(table, filter)
    }

    fn query_all(&mut self, table: &str) -> Result<Vec<SubscriptionRecord>> {
        if self.fault == Fault::RejectScans as u8 {
            return Err(DirectoryError::Storage("scan timed out".into()));
        }
        self.inner.query_all(table)
    }
}

/// Install a process-wide fmt subscriber writing through the test harness.
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .compact()
        .try_init();
}

/// Log lines captured by [`capture_logs`].
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a subscriber on this thread that records everything it logs.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, CapturedLogs) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs)
}

pub fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
}

pub fn memory_directory(store: MemoryStore) -> SubscriptionDirectory<MemoryStore> {
    SubscriptionDirectory::new(store, Arc::new(AcceptAll), DirectoryConfig::default()).unwrap()
}

/// Insert a row the way another process would, bypassing any directory.
pub fn insert_external(store: &impl SubscriptionStore, address: &str, message_type: &str) {
    let record = SubscriptionRecord {
        id: switchboard::SubscriptionId::new(),
        subscriber_address: address.to_string(),
        message_type: message_type.to_string(),
    };
    store
        .open_connection()
        .unwrap()
        .insert(TABLE, &record)
        .unwrap();
}

/// Count rows for a pair directly in the store.
pub fn stored_count(store: &impl SubscriptionStore, address: &str, message_type: &str) -> u64 {
    let filter = Filter {
        subscriber_address: Some(address.to_string()),
        message_type: Some(message_type.to_string()),
    };
    store.open_connection().unwrap().count(TABLE, &filter).unwrap()
}
