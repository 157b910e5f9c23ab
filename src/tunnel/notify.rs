//! Best-effort broadcast of status labels and relay versions.
//!
//! Observers that fall behind lose updates; publishing never blocks the
//! state machine.

use semver::Version;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::handoff::{handoff, Giver, Taker};

#[derive(Clone)]
pub struct Notifier {
    changes: mpsc::Sender<String>,
    versions: Arc<Giver<Version>>,
    version_wait: Duration,
}

impl Notifier {
    pub fn channels(
        status_capacity: usize,
        version_wait: Duration,
    ) -> (Self, Notifications<String>, Announcements<Version>) {
        let (changes_tx, changes_rx) = mpsc::channel(status_capacity.max(1));
        let (versions_tx, versions_rx) = handoff();

        let notifier = Self {
            changes: changes_tx,
            versions: Arc::new(versions_tx),
            version_wait,
        };
        (
            notifier,
            Notifications::new(changes_rx),
            Announcements { rx: versions_rx },
        )
    }

    /// Publishes a status label, dropping it if the channel is full.
    /// Returns whether the label was queued.
    pub fn publish_status(&self, status: &str) -> bool {
        if status.is_empty() {
            return false;
        }
        match self.changes.try_send(status.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(status)) => {
                debug!("Status channel full, dropping {:?}", status);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Offers `version` to an observer that is waiting in
    /// [`Announcements::recv`], for at most `version_wait`, in the
    /// background. Nothing is kept once the wait runs out.
    pub fn announce_version(&self, version: Version) {
        let versions = self.versions.clone();
        let wait = self.version_wait;

        tokio::spawn(async move {
            match tokio::time::timeout(wait, versions.give(version)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!("Version observers gone"),
                Err(_) => debug!("No observer took the version announcement, dropped"),
            }
        });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("version_wait", &self.version_wait)
            .finish_non_exhaustive()
    }
}

/// Read-only, shareable view of a notification channel.
#[derive(Debug)]
pub struct Notifications<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for Notifications<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Notifications<T> {
    fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next notification, or None once the tunnel has shut down.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    ///
    /// Also returns None while another clone is parked in `recv`, since that
    /// clone holds the receiver.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// Shareable view of an unbuffered announcement stream.
///
/// An announcement reaches only an observer that is already waiting in
/// [`recv`](Self::recv) when it is made; there is no backlog to poll.
#[derive(Debug)]
pub struct Announcements<T> {
    rx: Taker<T>,
}

impl<T> Clone for Announcements<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Announcements<T> {
    /// Waits for the next announcement, or None once the tunnel has shut
    /// down.
    pub async fn recv(&self) -> Option<T> {
        self.rx.take().await
    }
}
