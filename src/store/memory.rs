//! In-process subscription store.

use crate::error::Result;
use crate::store::{StoreConnection, SubscriptionStore};
use crate::types::{Filter, SubscriptionRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Shared {
    tables: RwLock<HashMap<String, Vec<SubscriptionRecord>>>,
    /// Connections currently open.
    open: AtomicUsize,
}

/// Store keeping its tables in memory.
///
/// Clones share the same tables, so a clone can act as a second writer
/// alongside the directory that owns the original.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .tables
            .read()
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Copy of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<SubscriptionRecord> {
        self.shared
            .tables
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

impl SubscriptionStore for MemoryStore {
    fn open_connection(&self) -> Result<Box<dyn StoreConnection + '_>> {
        self.shared.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: &self.shared,
        }))
    }
}

struct MemoryConnection<'a> {
    shared: &'a Shared,
}

impl StoreConnection for MemoryConnection<'_> {
    fn count(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        let tables = self.shared.tables.read();
        let count = tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    fn insert(&mut self, table: &str, record: &SubscriptionRecord) -> Result<()> {
        self.shared
            .tables
            .write()
            .entry(table.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn delete(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        let mut tables = self.shared.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !filter.matches(r));
        Ok((before - rows.len()) as u64)
    }

    fn query(&mut self, table: &str, filter: &Filter) -> Result<Vec<SubscriptionRecord>> {
        Ok(self
            .shared
            .tables
            .read()
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    fn query_all(&mut self, table: &str) -> Result<Vec<SubscriptionRecord>> {
        Ok(self
            .shared
            .tables
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default())
    }
}

impl Drop for MemoryConnection<'_> {
    fn drop(&mut self) {
        self.shared.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, MessageType};

    fn record(address: &str, message_type: &str) -> SubscriptionRecord {
        SubscriptionRecord::new(&Address::parse(address).unwrap(), &MessageType::from(message_type))
    }

    #[test]
    fn test_insert_count_delete() {
        let store = MemoryStore::new();
        let mut conn = store.open_connection().unwrap();

        conn.insert("subs", &record("a", "T1")).unwrap();
        conn.insert("subs", &record("a", "T2")).unwrap();
        conn.insert("subs", &record("b", "T1")).unwrap();

        let a = Address::parse("a").unwrap();
        assert_eq!(conn.count("subs", &Filter::address(&a)).unwrap(), 2);
        assert_eq!(conn.count("subs", &Filter::all()).unwrap(), 3);
        assert_eq!(conn.count("other", &Filter::all()).unwrap(), 0);

        let rows = conn.query("subs", &Filter::address(&a)).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.subscriber_address == "a"));
        assert!(conn.query("other", &Filter::all()).unwrap().is_empty());

        assert_eq!(conn.delete("subs", &Filter::address(&a)).unwrap(), 2);
        assert_eq!(conn.query_all("subs").unwrap().len(), 1);
        assert_eq!(conn.delete("missing", &Filter::all()).unwrap(), 0);
    }

    #[test]
    fn test_connections_are_released() {
        let store = MemoryStore::new();
        {
            let _c1 = store.open_connection().unwrap();
            let _c2 = store.open_connection().unwrap();
            assert_eq!(store.open_connections(), 2);
        }
        assert_eq!(store.open_connections(), 0);
    }

    #[test]
    fn test_clones_share_tables() {
        let store = MemoryStore::new();
        let external = store.clone();

        external
            .open_connection()
            .unwrap()
            .insert("subs", &record("a", "T"))
            .unwrap();

        assert_eq!(store.row_count("subs"), 1);
        assert_eq!(store.rows("subs")[0].subscriber_address, "a");
    }
}
