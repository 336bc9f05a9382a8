//! Immutable message type -> subscribers view.
//!
//! A [`Snapshot`] is built in one pass from a full read of the durable store.
//! Once published behind an `Arc` it is never mutated; incremental writes are
//! applied to a private copy with [`Snapshot::apply`] which then replaces the
//! published one.

use crate::error::{DirectoryError, Result};
use crate::resolver::TypeResolver;
use crate::types::{Address, MessageType, SubscriptionRecord};
use std::collections::{BTreeSet, HashMap};

/// An incremental change to the view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Patch {
    Subscribe {
        address: Address,
        message_type: MessageType,
    },
    Unsubscribe {
        address: Address,
        message_type: MessageType,
    },
    Clear {
        address: Address,
    },
}

/// Counters from one build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Rows read from the store.
    pub records: usize,
    /// Rows left out because their message type did not resolve.
    pub skipped: usize,
}

/// Mapping from canonical message type to the set of subscribed addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    subscribers: HashMap<MessageType, BTreeSet<Address>>,
}

impl Snapshot {
    /// An empty view.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a view from a full read of the store.
    ///
    /// A record whose address does not parse means the store itself is not a
    /// valid source, so the whole build fails. A record whose type does not
    /// resolve is skipped.
    pub fn build<I>(records: I, resolver: &dyn TypeResolver) -> Result<(Self, BuildReport)>
    where
        I: IntoIterator<Item = SubscriptionRecord>,
    {
        let mut snapshot = Snapshot::empty();
        let mut report = BuildReport::default();

        for record in records {
            report.records += 1;

            let address = Address::parse(&record.subscriber_address).map_err(|_| {
                DirectoryError::Corruption(format!(
                    "record {} has malformed subscriber address {:?}",
                    record.id, record.subscriber_address
                ))
            })?;

            let message_type = MessageType::from(record.message_type);
            match resolver.resolve(&message_type).descriptor() {
                Some(descriptor) => snapshot.insert(descriptor.canonical, address),
                None => {
                    tracing::trace!(
                        record = %record.id,
                        message_type = %message_type,
                        "skipping record with unresolvable message type"
                    );
                    report.skipped += 1;
                }
            }
        }

        Ok((snapshot, report))
    }

    /// Apply an incremental change. Message types in patches are canonical.
    pub fn apply(&mut self, patch: &Patch) {
        match patch {
            Patch::Subscribe {
                address,
                message_type,
            } => self.insert(message_type.clone(), address.clone()),
            Patch::Unsubscribe {
                address,
                message_type,
            } => {
                if let Some(set) = self.subscribers.get_mut(message_type) {
                    set.remove(address);
                    if set.is_empty() {
                        self.subscribers.remove(message_type);
                    }
                }
            }
            Patch::Clear { address } => {
                self.subscribers.retain(|_, set| {
                    set.remove(address);
                    !set.is_empty()
                });
            }
        }
    }

    /// Subscribers of a canonical message type, in sorted order.
    pub fn subscribers(&self, message_type: &MessageType) -> Vec<Address> {
        self.subscribers
            .get(message_type)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, message_type: &MessageType, address: &Address) -> bool {
        self.subscribers
            .get(message_type)
            .map(|set| set.contains(address))
            .unwrap_or(false)
    }

    /// Message types the address is subscribed to, in sorted order.
    pub fn types_for(&self, address: &Address) -> Vec<MessageType> {
        let mut types: Vec<_> = self
            .subscribers
            .iter()
            .filter(|(_, set)| set.contains(address))
            .map(|(t, _)| t.clone())
            .collect();
        types.sort();
        types
    }

    /// Message types with at least one subscriber, in sorted order.
    pub fn message_types(&self) -> Vec<MessageType> {
        let mut types: Vec<_> = self.subscribers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of (message type, address) pairs.
    pub fn len(&self) -> usize {
        self.subscribers.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn insert(&mut self, message_type: MessageType, address: Address) {
        self.subscribers.entry(message_type).or_default().insert(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{AcceptAll, TypeRegistry};

    fn record(address: &str, message_type: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            id: crate::types::SubscriptionId::new(),
            subscriber_address: address.to_string(),
            message_type: message_type.to_string(),
        }
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_build_groups_by_type() {
        let records = vec![
            record("tcp://b:1", "OrderCreated"),
            record("tcp://a:1", "OrderCreated"),
            record("tcp://a:1", "OrderShipped"),
        ];
        let (snapshot, report) = Snapshot::build(records, &AcceptAll).unwrap();

        assert_eq!(report, BuildReport { records: 3, skipped: 0 });
        assert_eq!(
            snapshot.subscribers(&"OrderCreated".into()),
            vec![addr("tcp://a:1"), addr("tcp://b:1")]
        );
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot.types_for(&addr("tcp://a:1")),
            vec![MessageType::from("OrderCreated"), MessageType::from("OrderShipped")]
        );
    }

    #[test]
    fn test_build_deduplicates_rows() {
        let records = vec![record("a", "T"), record("a", "T")];
        let (snapshot, report) = Snapshot::build(records, &AcceptAll).unwrap();

        assert_eq!(report.records, 2);
        assert_eq!(snapshot.subscribers(&"T".into()), vec![addr("a")]);
    }

    #[test]
    fn test_build_skips_unresolvable() {
        let registry = TypeRegistry::with_types(["Known"]);
        let records = vec![record("a", "Known"), record("a", "Gone")];
        let (snapshot, report) = Snapshot::build(records, &registry).unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(snapshot.message_types(), vec![MessageType::from("Known")]);
        assert!(snapshot.subscribers(&"Gone".into()).is_empty());
    }

    #[test]
    fn test_build_collapses_aliases() {
        let registry = TypeRegistry::new();
        registry.alias("T.v1".into(), "T".into());
        let records = vec![record("a", "T.v1"), record("b", "T")];
        let (snapshot, _) = Snapshot::build(records, &registry).unwrap();

        assert_eq!(snapshot.subscribers(&"T".into()), vec![addr("a"), addr("b")]);
    }

    #[test]
    fn test_build_fails_on_malformed_address() {
        let records = vec![record("a", "T"), record("", "T")];
        let result = Snapshot::build(records, &AcceptAll);
        assert!(matches!(result, Err(DirectoryError::Corruption(_))));
    }

    #[test]
    fn test_apply_patches() {
        let mut snapshot = Snapshot::empty();
        snapshot.apply(&Patch::Subscribe {
            address: addr("a"),
            message_type: "T1".into(),
        });
        snapshot.apply(&Patch::Subscribe {
            address: addr("a"),
            message_type: "T2".into(),
        });
        snapshot.apply(&Patch::Subscribe {
            address: addr("b"),
            message_type: "T1".into(),
        });
        assert_eq!(snapshot.len(), 3);

        snapshot.apply(&Patch::Unsubscribe {
            address: addr("b"),
            message_type: "T1".into(),
        });
        assert!(!snapshot.contains(&"T1".into(), &addr("b")));

        snapshot.apply(&Patch::Clear { address: addr("a") });
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let mut snapshot = Snapshot::empty();
        snapshot.apply(&Patch::Unsubscribe {
            address: addr("a"),
            message_type: "T".into(),
        });
        snapshot.apply(&Patch::Clear { address: addr("a") });
        assert!(snapshot.is_empty());
    }
}
