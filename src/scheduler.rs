//! Periodic rebuilds of the directory view.
//!
//! A [`RefreshScheduler`] owns one background thread that waits on a
//! [`Ticker`] and runs [`SubscriptionDirectory::refresh`] on every tick.
//! Rebuilds run one at a time on that thread; a tick that arrives while a
//! rebuild is running waits for it rather than interrupting it. Failures are
//! logged and reported to the observer, never propagated.
//!
//! # Example
//!
//! ```ignore
//! let directory = Arc::new(SubscriptionDirectory::new(store, resolver, config)?);
//!
//! // Wall-clock refreshes every `config.refresh_interval`
//! let refresher = directory.spawn_refresher()?;
//!
//! // Or deterministic refreshes for tests
//! let (ticker, ticks) = ManualTicker::new();
//! let (refresher, outcomes) = directory.spawn_observed_refresher(ticker)?;
//! ticks.tick();
//! let outcome = outcomes.recv()?;
//! ```

use crate::directory::{RefreshReport, SubscriptionDirectory};
use crate::error::Result;
use crate::store::SubscriptionStore;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Source of refresh ticks.
pub trait Ticker: Send + 'static {
    /// Channel yielding one message per scheduled refresh. The scheduler
    /// stops when it disconnects.
    fn into_receiver(self) -> Receiver<Instant>;
}

/// Ticks on a fixed wall-clock period.
#[derive(Clone, Copy, Debug)]
pub struct IntervalTicker {
    period: Duration,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Ticker for IntervalTicker {
    fn into_receiver(self) -> Receiver<Instant> {
        crossbeam_channel::tick(self.period)
    }
}

/// Ticks only when its [`TickHandle`] says so.
pub struct ManualTicker {
    receiver: Receiver<Instant>,
}

/// Trigger for a [`ManualTicker`]. Dropping every handle stops the scheduler.
#[derive(Clone)]
pub struct TickHandle {
    sender: Sender<Instant>,
}

impl ManualTicker {
    pub fn new() -> (Self, TickHandle) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { receiver }, TickHandle { sender })
    }
}

impl Ticker for ManualTicker {
    fn into_receiver(self) -> Receiver<Instant> {
        self.receiver
    }
}

impl TickHandle {
    /// Request one refresh. Returns false if the scheduler has stopped.
    pub fn tick(&self) -> bool {
        self.sender.send(Instant::now()).is_ok()
    }
}

/// Result of one scheduled refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Installed(RefreshReport),
    /// The rebuild failed; the previous snapshot is still active.
    Failed(String),
}

/// Handle to the background refresh thread.
///
/// Dropping the handle stops the thread and waits for it to exit.
pub struct RefreshScheduler {
    /// Dropped to signal shutdown.
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub(crate) fn spawn<S, T>(
        directory: Weak<SubscriptionDirectory<S>>,
        directory_dropped: Receiver<()>,
        ticker: T,
        observer: Option<Sender<RefreshOutcome>>,
    ) -> Result<Self>
    where
        S: SubscriptionStore + 'static,
        T: Ticker,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ticks = ticker.into_receiver();

        let thread = thread::Builder::new()
            .name("switchboard-refresh".into())
            .spawn(move || run(directory, ticks, shutdown_rx, directory_dropped, observer))?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Whether the background thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Stop the thread and wait for it. An in-flight rebuild completes first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("subscription refresher panicked");
            }
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<S: SubscriptionStore>(
    directory: Weak<SubscriptionDirectory<S>>,
    ticks: Receiver<Instant>,
    shutdown: Receiver<()>,
    directory_dropped: Receiver<()>,
    observer: Option<Sender<RefreshOutcome>>,
) {
    tracing::info!("subscription refresher started");

    loop {
        select! {
            recv(ticks) -> tick => {
                if tick.is_err() {
                    tracing::debug!("ticker closed");
                    break;
                }
            }
            recv(shutdown) -> _ => break,
            recv(directory_dropped) -> _ => break,
        }

        // Only hold the directory for the duration of one rebuild.
        let Some(dir) = directory.upgrade() else {
            break;
        };

        let outcome = match dir.refresh() {
            Ok(report) => RefreshOutcome::Installed(report),
            Err(e) => {
                let consecutive = dir.stats().consecutive_failures;
                tracing::warn!(
                    error = %e,
                    consecutive_failures = consecutive,
                    "subscription refresh failed, keeping previous snapshot"
                );
                RefreshOutcome::Failed(e.to_string())
            }
        };
        drop(dir);

        if let Some(ref observer) = observer {
            // Observers that fall behind miss outcomes rather than stall refreshes.
            let _ = observer.try_send(outcome);
        }
    }

    tracing::info!("subscription refresher stopped");
}
