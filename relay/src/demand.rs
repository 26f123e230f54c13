use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Best-effort "a client is here" handoff between request handlers and the
/// connector loop.
///
/// A wake only lands while the connector is parked in
/// [`wait_since`](Self::wait_since). Every signal also stamps the activity
/// time, which is what the connector's idle check and pending-demand check
/// read when a wake is missed.
#[derive(Debug, Default)]
pub struct DemandSignal {
    parked: AtomicBool,
    notify: Notify,
    last_activity: Mutex<Option<Instant>>,
}

/// Clears the parked flag when the waiter goes away, including on cancel.
struct Parked<'a>(&'a AtomicBool);

impl<'a> Parked<'a> {
    fn park(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DemandSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a client request and wake the connector if it is parked.
    /// Returns whether a parked connector was woken.
    pub fn signal(&self) -> bool {
        self.touch();
        if self.parked.swap(false, Ordering::AcqRel) {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn last_activity(&self) -> Option<Instant> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a client showed up at or after `since`.
    pub fn active_since(&self, since: Instant) -> bool {
        self.last_activity().is_some_and(|at| at >= since)
    }

    /// Whether no client has been seen for `timeout`. A zero timeout never
    /// goes idle.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return false;
        }
        match self.last_activity() {
            Some(at) => at.elapsed() >= timeout,
            None => true,
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    /// Park until the next [`signal`](Self::signal), returning at once if a
    /// client was already seen at or after `since`.
    pub async fn wait_since(&self, since: Instant) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before publishing the parked flag so a signal in between
        // is not lost.
        notified.as_mut().enable();
        let _parked = Parked::park(&self.parked);
        if self.active_since(since) {
            return;
        }
        notified.await;
    }
}
