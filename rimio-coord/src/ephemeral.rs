//! Session-bound keys kept alive by a background renewal task.

use crate::client::{Client, WeakClient};
use crate::error::{CoordError, Result};
use crate::signal::{self, OwnershipSignal, SignalEnd, SignalNotifier};
use crate::store::{PrevExist, SetOptions};
use std::time::Duration;

impl Client {
    /// Registers `path` as a key that lives for one client timeout unless renewed.
    ///
    /// Fails with [`CoordError::NodeExists`] while another owner holds the key. On
    /// success the key is renewed every half timeout until a refresh fails or the
    /// client closes; the returned signal ends at that point.
    pub async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<OwnershipSignal> {
        let options = SetOptions::value(data.to_vec())
            .prev_exist(PrevExist::MustNotExist)
            .ttl(self.timeout());

        if let Err(error) = self.call(path, self.store().set(path, options)).await {
            tracing::debug!("coord create-ephemeral node {} failed: {}", path, error);
            return Err(error);
        }

        tracing::debug!("coord create-ephemeral OK");
        Ok(self.spawn_renewal(path.to_string()))
    }

    /// Resets the TTL of an existing ephemeral key without touching its value.
    pub async fn refresh_ephemeral(&self, path: &str) -> Result<()> {
        tracing::debug!("coord refresh-ephemeral node {}", path);
        let options = SetOptions::refresh(self.timeout());
        if let Err(error) = self.call(path, self.store().set(path, options)).await {
            tracing::debug!("coord refresh-ephemeral node {} failed: {}", path, error);
            return Err(error);
        }
        tracing::debug!("coord refresh-ephemeral OK");
        Ok(())
    }

    pub(crate) fn spawn_renewal(&self, path: String) -> OwnershipSignal {
        let (notifier, signal) = signal::channel();
        let interval = renewal_interval(self.timeout());
        tokio::spawn(renew_until_lost(self.downgrade(), path, interval, notifier));
        signal
    }
}

/// Refreshes `path` every `interval` until a refresh fails or the client goes away.
///
/// Only a weak handle is kept between ticks, so dropping every `Client` stops renewal.
async fn renew_until_lost(
    client: WeakClient,
    path: String,
    interval: Duration,
    notifier: SignalNotifier,
) {
    loop {
        let Ok(token) = client.begin() else {
            notifier.end(SignalEnd::Closed);
            return;
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                notifier.end(SignalEnd::Closed);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(owner) = client.upgrade() else {
            notifier.end(SignalEnd::Closed);
            return;
        };
        if let Err(error) = owner.refresh_ephemeral(&path).await {
            let reason = end_reason(&error);
            if reason == SignalEnd::Lost {
                tracing::warn!("ephemeral node {} lost: {}", path, error);
            } else {
                tracing::debug!("ephemeral node {} renewal stopped: {}", path, error);
            }
            notifier.end(reason);
            return;
        }
    }
}

/// Renewals run at half the TTL so one missed tick does not expire the key.
pub(crate) fn renewal_interval(ttl: Duration) -> Duration {
    ttl / 2
}

pub(crate) fn end_reason(error: &CoordError) -> SignalEnd {
    if error.is_closed() {
        SignalEnd::Closed
    } else {
        SignalEnd::Lost
    }
}
