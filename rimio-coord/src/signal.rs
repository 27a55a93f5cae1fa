//! Single-fire ownership signal shared by ephemeral registrations and watches.

use tokio::sync::watch;

/// Why a background registration or watch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEnd {
    /// Renewal or watch failed: the lease expired, the key was removed, or the store is unreachable.
    Lost,
    /// The watched directory's children may have changed since the snapshot.
    Changed,
    /// The owning client was closed.
    Closed,
}

/// Ends exactly once. Clones observe the same end.
#[derive(Debug, Clone)]
pub struct OwnershipSignal {
    rx: watch::Receiver<Option<SignalEnd>>,
}

pub(crate) struct SignalNotifier {
    tx: watch::Sender<Option<SignalEnd>>,
}

pub(crate) fn channel() -> (SignalNotifier, OwnershipSignal) {
    let (tx, rx) = watch::channel(None);
    (SignalNotifier { tx }, OwnershipSignal { rx })
}

impl SignalNotifier {
    pub(crate) fn end(self, reason: SignalEnd) {
        self.tx.send_replace(Some(reason));
    }
}

impl OwnershipSignal {
    /// Waits until the signal ends.
    ///
    /// A loop that disappears without reporting (e.g. its task panicked) counts as `Lost`.
    pub async fn ended(&mut self) -> SignalEnd {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return (*self.rx.borrow()).unwrap_or(SignalEnd::Lost);
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_reason().is_some()
    }

    /// The end reason, if the signal already ended.
    pub fn end_reason(&self) -> Option<SignalEnd> {
        let current = *self.rx.borrow();
        match current {
            Some(reason) => Some(reason),
            None if self.rx.has_changed().is_err() => Some(SignalEnd::Lost),
            None => None,
        }
    }
}
