//! Ordered ephemeral queues and one-shot directory watches.

use crate::client::{Client, WeakClient};
use crate::ephemeral::end_reason;
use crate::error::{CoordError, Result};
use crate::signal::{self, OwnershipSignal, SignalEnd, SignalNotifier};
use crate::store::ReadOptions;

impl Client {
    /// Creates an ephemeral entry under `dir` with a store-assigned, strictly increasing name.
    ///
    /// Returns the renewal signal and the full key of the new entry. The earliest
    /// arrival is the entry whose key sorts first.
    pub async fn create_ephemeral_in_order(
        &self,
        dir: &str,
        data: &[u8],
    ) -> Result<(OwnershipSignal, String)> {
        let ttl = self.timeout();
        let resp = match self
            .call(dir, self.store().create_in_order(dir, data.to_vec(), Some(ttl)))
            .await
        {
            Ok(resp) => resp,
            Err(error) => {
                tracing::debug!("coord create-ephemeral-inorder node {} failed: {}", dir, error);
                return Err(error);
            }
        };

        let key = resp.node.key;
        tracing::debug!("coord create-ephemeral-inorder OK, key = {}", key);
        let signal = self.spawn_renewal(key.clone());
        Ok((signal, key))
    }

    /// Snapshots the children of `dir` and watches for the next change under it.
    ///
    /// The returned signal ends with [`SignalEnd::Changed`] on the first mutating
    /// event after the snapshot. Callers re-list to see the new state.
    pub async fn watch_in_order(&self, dir: &str) -> Result<(OwnershipSignal, Vec<String>)> {
        self.mkdir(dir).await?;

        let resp = match self.call(dir, self.store().get(dir, ReadOptions::sorted())).await {
            Ok(resp) => resp,
            Err(error) => {
                tracing::debug!("coord watch-inorder node {} failed: {}", dir, error);
                return Err(error);
            }
        };
        if !resp.node.dir {
            return Err(CoordError::NotDir(dir.to_string()));
        }

        let index = resp.index;
        let keys = resp.node.nodes.into_iter().map(|node| node.key).collect();

        let (notifier, signal) = signal::channel();
        tokio::spawn(watch_until_changed(
            self.downgrade(),
            dir.to_string(),
            index,
            notifier,
        ));

        tracing::debug!("coord watch-inorder OK, index = {}", index);
        Ok((signal, keys))
    }
}

/// Waits for the first mutating event under `dir` after `index`.
///
/// The task keeps only a weak client handle plus the store, so dropping every
/// `Client` cancels the wait.
async fn watch_until_changed(
    client: WeakClient,
    dir: String,
    mut index: u64,
    notifier: SignalNotifier,
) {
    loop {
        let Some((token, store)) = client
            .upgrade()
            .and_then(|client| Some((client.begin().ok()?, client.store().clone())))
        else {
            notifier.end(SignalEnd::Closed);
            return;
        };

        // The wait is unbounded; only closing the client interrupts it.
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => {
                notifier.end(SignalEnd::Closed);
                return;
            }
            event = store.watch_next(&dir, index) => event,
        };

        match event {
            Ok(event) if event.action.is_mutation() => {
                tracing::debug!(
                    "coord watch node {} changed: {:?} {} at index {}",
                    dir,
                    event.action,
                    event.key,
                    event.index
                );
                notifier.end(SignalEnd::Changed);
                return;
            }
            Ok(event) => {
                index = event.index;
            }
            Err(error) => {
                let error = CoordError::from(error);
                tracing::debug!("coord watch node {} failed: {}", dir, error);
                notifier.end(end_reason(&error));
                return;
            }
        }
    }
}
