//! Subscription directory.
//!
//! Writes go to the durable store first and are then patched into the active
//! snapshot. Reads are answered from the active snapshot alone. A rebuild
//! replaces the active snapshot wholesale with one built from a full store read.
//!
//! Both update paths meet at the `active` lock:
//! - a patch copies the snapshot if a reader still holds it, applies itself,
//!   and, while a rebuild is in flight, is journaled
//! - a rebuild opens the journal before it reads the store and replays it onto
//!   the new snapshot before installing, so writes that land between its read
//!   and its install are not lost
//!
//! Readers hold the lock only long enough to clone an `Arc`.

use crate::config::DirectoryConfig;
use crate::error::{DirectoryError, Result};
use crate::resolver::TypeResolver;
use crate::scheduler::{IntervalTicker, RefreshOutcome, RefreshScheduler, Ticker};
use crate::snapshot::{BuildReport, Patch, Snapshot};
use crate::store::{StoreConnection, SubscriptionStore};
use crate::types::{Address, Filter, MessageType, SubscriptionRecord, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The published view plus the journal of an in-flight rebuild.
struct Active {
    snapshot: Arc<Snapshot>,
    /// `Some` while a rebuild is between its store read and its install.
    journal: Option<Vec<Patch>>,
}

/// Summary of one successful rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshReport {
    /// Generation of the installed snapshot.
    pub generation: u64,
    /// Rows read from the store.
    pub records: usize,
    /// Rows left out because their message type did not resolve.
    pub skipped: usize,
    /// Incremental writes replayed onto the new snapshot.
    pub replayed: usize,
    /// (message type, address) pairs in the installed snapshot.
    pub subscriptions: usize,
}

/// Refresh health counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Snapshots installed by rebuilds, including the one at start-up.
    pub generation: u64,
    pub refreshes: u64,
    pub failed_refreshes: u64,
    /// Failures since the last successful rebuild.
    pub consecutive_failures: u64,
    pub last_refresh: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// Durable subscription directory with an in-memory lookup view.
pub struct SubscriptionDirectory<S: SubscriptionStore> {
    store: S,
    resolver: Arc<dyn TypeResolver>,
    config: DirectoryConfig,

    active: RwLock<Active>,

    /// Held across store I/O and patch so this directory's writes reach the
    /// store and the view in the same order.
    write_lock: Mutex<()>,

    /// Serializes rebuilds.
    rebuild_lock: Mutex<()>,

    stats: Mutex<DirectoryStats>,

    /// Never sent on; refresher threads watch `dropped` disconnect when this goes away.
    _alive: Sender<()>,
    dropped: Receiver<()>,
}

impl<S: SubscriptionStore> SubscriptionDirectory<S> {
    /// Create a directory and populate its view from the store.
    ///
    /// A failed initial rebuild is logged and leaves an empty view; the next
    /// scheduled refresh retries. Use [`SubscriptionDirectory::open`] to fail instead.
    pub fn new(store: S, resolver: Arc<dyn TypeResolver>, config: DirectoryConfig) -> Result<Self> {
        let directory = Self::unpopulated(store, resolver, config)?;
        if let Err(e) = directory.refresh() {
            tracing::warn!(error = %e, "initial subscription refresh failed, starting empty");
        }
        Ok(directory)
    }

    /// Create a directory, failing if the store cannot be read.
    pub fn open(store: S, resolver: Arc<dyn TypeResolver>, config: DirectoryConfig) -> Result<Self> {
        let directory = Self::unpopulated(store, resolver, config)?;
        directory.refresh()?;
        Ok(directory)
    }

    fn unpopulated(store: S, resolver: Arc<dyn TypeResolver>, config: DirectoryConfig) -> Result<Self> {
        config.validate()?;
        let (alive, dropped) = bounded(0);
        Ok(Self {
            store,
            resolver,
            config,
            active: RwLock::new(Active {
                snapshot: Arc::new(Snapshot::empty()),
                journal: None,
            }),
            write_lock: Mutex::new(()),
            rebuild_lock: Mutex::new(()),
            stats: Mutex::new(DirectoryStats::default()),
            _alive: alive,
            dropped,
        })
    }

    // --- Writes ---

    /// Subscribe `address` to `message_type`.
    ///
    /// Idempotent: an existing (address, type) row is not written again.
    pub fn subscribe(&self, address: &Address, message_type: &MessageType) -> Result<()> {
        let _lock = self.write_lock.lock();

        {
            let mut conn = self.store.open_connection()?;
            let table = self.table();
            let existing = conn.count(table, &Filter::pair(address, message_type))?;
            if existing == 0 {
                conn.insert(table, &SubscriptionRecord::new(address, message_type))?;
                tracing::debug!(
                    address = %address,
                    message_type = %message_type,
                    "subscriber subscribed to message"
                );
            }
        }

        // Unresolvable types are stored but, as in a rebuild, kept out of the view.
        if let Some(descriptor) = self.resolver.resolve(message_type).descriptor() {
            self.patch(Patch::Subscribe {
                address: address.clone(),
                message_type: descriptor.canonical,
            });
        } else {
            tracing::debug!(
                message_type = %message_type,
                "stored subscription for unresolvable message type"
            );
        }
        Ok(())
    }

    /// Remove the subscription of `address` to `message_type`. No-op if absent.
    ///
    /// Rows of `address` stored under an alias of the same type are removed
    /// too; otherwise the next rebuild would bring the subscription back.
    pub fn unsubscribe(&self, address: &Address, message_type: &MessageType) -> Result<()> {
        let _lock = self.write_lock.lock();
        let canonical = self
            .resolver
            .resolve(message_type)
            .descriptor()
            .map(|descriptor| descriptor.canonical);

        {
            let mut conn = self.store.open_connection()?;
            let table = self.table();
            let mut removed = conn.delete(table, &Filter::pair(address, message_type))?;

            if let Some(canonical) = &canonical {
                for stored in self.stored_aliases(conn.as_mut(), address, canonical)? {
                    removed += conn.delete(table, &Filter::pair(address, &stored))?;
                }
            }

            tracing::debug!(
                address = %address,
                message_type = %message_type,
                removed,
                "subscriber unsubscribed from message"
            );
        }

        if let Some(canonical) = canonical {
            self.patch(Patch::Unsubscribe {
                address: address.clone(),
                message_type: canonical,
            });
        }
        Ok(())
    }

    /// Remove every subscription of `address`. No-op if it has none.
    pub fn clear_address_subscriptions(&self, address: &Address) -> Result<()> {
        let _lock = self.write_lock.lock();

        {
            let mut conn = self.store.open_connection()?;
            let removed = conn.delete(self.table(), &Filter::address(address))?;
            tracing::debug!(address = %address, removed, "cleared subscriptions of subscriber");
        }

        self.patch(Patch::Clear {
            address: address.clone(),
        });
        Ok(())
    }

    // --- Reads ---

    /// Addresses subscribed to `message_type`, in sorted order.
    ///
    /// Answered from the active snapshot only; never fails. Unknown or
    /// unresolvable types have no subscribers.
    pub fn subscriber_addresses_for_message(&self, message_type: &MessageType) -> Vec<Address> {
        match self.resolver.resolve(message_type).descriptor() {
            Some(descriptor) => self.snapshot().subscribers(&descriptor.canonical),
            None => Vec::new(),
        }
    }

    /// The active snapshot. Stays consistent however long the caller keeps it.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.active.read().snapshot)
    }

    pub fn stats(&self) -> DirectoryStats {
        self.stats.lock().clone()
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // --- Rebuild ---

    /// Rebuild the view from a full store read and install it.
    ///
    /// On failure the active snapshot is left untouched.
    pub fn refresh(&self) -> Result<RefreshReport> {
        let _rebuild = self.rebuild_lock.lock();

        self.active.write().journal = Some(Vec::new());

        let built = self.read_and_build();

        let mut active = self.active.write();
        let journal = active.journal.take().unwrap_or_default();

        let (mut snapshot, build) = match built {
            Ok(built) => built,
            Err(e) => {
                drop(active);
                self.record_failure(&e);
                return Err(e);
            }
        };

        for patch in &journal {
            snapshot.apply(patch);
        }
        let subscriptions = snapshot.len();
        active.snapshot = Arc::new(snapshot);
        drop(active);

        let generation = {
            let mut stats = self.stats.lock();
            stats.generation += 1;
            stats.refreshes += 1;
            stats.consecutive_failures = 0;
            stats.last_refresh = Some(Timestamp::now());
            stats.last_error = None;
            stats.generation
        };

        let report = RefreshReport {
            generation,
            records: build.records,
            skipped: build.skipped,
            replayed: journal.len(),
            subscriptions,
        };
        tracing::debug!(
            generation,
            records = report.records,
            skipped = report.skipped,
            replayed = report.replayed,
            subscriptions,
            "installed subscription snapshot"
        );
        Ok(report)
    }

    fn read_and_build(&self) -> Result<(Snapshot, BuildReport)> {
        let records = {
            let mut conn = self.store.open_connection()?;
            conn.query_all(self.table())?
        };
        Snapshot::build(records, self.resolver.as_ref())
    }

    /// Identifiers `address` still has rows under that resolve to `canonical`.
    fn stored_aliases(
        &self,
        conn: &mut dyn StoreConnection,
        address: &Address,
        canonical: &MessageType,
    ) -> Result<BTreeSet<MessageType>> {
        let rows = conn.query(self.table(), &Filter::address(address))?;
        Ok(rows
            .into_iter()
            .map(|row| MessageType::from(row.message_type))
            .filter(|stored| {
                self.resolver
                    .resolve(stored)
                    .descriptor()
                    .is_some_and(|descriptor| &descriptor.canonical == canonical)
            })
            .collect())
    }

    fn record_failure(&self, error: &DirectoryError) {
        let mut stats = self.stats.lock();
        stats.failed_refreshes += 1;
        stats.consecutive_failures += 1;
        stats.last_error = Some(error.to_string());
    }

    fn patch(&self, patch: Patch) {
        let mut active = self.active.write();
        Arc::make_mut(&mut active.snapshot).apply(&patch);
        if let Some(journal) = active.journal.as_mut() {
            journal.push(patch);
        }
    }

    fn table(&self) -> &str {
        &self.config.table
    }
}

impl<S: SubscriptionStore + 'static> SubscriptionDirectory<S> {
    /// Start background refreshes on the configured interval.
    pub fn spawn_refresher(self: &Arc<Self>) -> Result<RefreshScheduler> {
        self.spawn_refresher_with(IntervalTicker::new(self.config.refresh_interval), None)
    }

    /// Start background refreshes driven by `ticker`, reporting each outcome to `observer`.
    ///
    /// The refresher stops when the returned handle is shut down or dropped,
    /// or when this directory is dropped.
    pub fn spawn_refresher_with<T: Ticker>(
        self: &Arc<Self>,
        ticker: T,
        observer: Option<Sender<RefreshOutcome>>,
    ) -> Result<RefreshScheduler> {
        RefreshScheduler::spawn(Arc::downgrade(self), self.dropped.clone(), ticker, observer)
    }

    /// Like [`spawn_refresher_with`](Self::spawn_refresher_with), with an observer
    /// channel bounded by `observer_capacity`.
    pub fn spawn_observed_refresher<T: Ticker>(
        self: &Arc<Self>,
        ticker: T,
    ) -> Result<(RefreshScheduler, Receiver<RefreshOutcome>)> {
        let (tx, rx) = bounded(self.config.observer_capacity);
        let scheduler = self.spawn_refresher_with(ticker, Some(tx))?;
        Ok((scheduler, rx))
    }
}
