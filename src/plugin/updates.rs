//! Per-installation progress streams
//!
//! The registry maps installation ids to their live subscribers. Each
//! subscriber owns a bounded channel, so one slow watcher never stalls the
//! installation or other watchers; updates that do not fit are dropped.
//!
//! A terminal update closes every channel of its installation, after which
//! `Subscription::recv` returns `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::plugin::types::{InstallUpdate, InstallationId, InstallationStatus};

/// Unique identifier for a subscription
pub type SubscriptionId = String;

type Subscribers = HashMap<InstallationId, Vec<(SubscriptionId, mpsc::Sender<InstallUpdate>)>>;

pub struct UpdateRegistry {
    subscribers: RwLock<Subscribers>,
    buffer: usize,
}

impl UpdateRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a watcher for an installation
    pub fn subscribe(self: &Arc<Self>, installation_id: &str) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);

        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(installation_id.to_string())
            .or_default()
            .push((id.clone(), tx));

        tracing::debug!(
            installation_id = %installation_id,
            subscription_id = %id,
            "Subscribed to installation updates"
        );

        Subscription {
            id,
            installation_id: installation_id.to_string(),
            receiver: rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver an update to every subscriber of its installation
    ///
    /// Returns how many subscribers accepted the update. Terminal updates close
    /// the installation's channels.
    pub fn broadcast(&self, update: &InstallUpdate) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = subscribers.get(&update.installation_id) {
                for (id, tx) in list {
                    match tx.try_send(update.clone()) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!(
                                installation_id = %update.installation_id,
                                subscription_id = %id,
                                progress = update.progress,
                                "Subscriber buffer full, dropping update"
                            );
                        }
                        Err(TrySendError::Closed(_)) => closed.push(id.clone()),
                    }
                }
            }
        }

        for id in closed {
            self.unsubscribe(&update.installation_id, &id);
        }

        if update.is_terminal() {
            self.close(&update.installation_id);
        }

        delivered
    }

    /// Drop every channel of an installation
    pub fn close(&self, installation_id: &str) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(installation_id);

        if let Some(list) = removed {
            tracing::debug!(
                installation_id = %installation_id,
                subscribers = list.len(),
                "Closed installation update stream"
            );
        }
    }

    /// Send a final update to one subscription and close it
    ///
    /// Used for watchers that attach after the installation already settled.
    /// Does nothing if the subscription was closed in the meantime.
    pub fn settle(&self, installation_id: &str, subscription_id: &str, update: InstallUpdate) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(installation_id) {
            if let Some(pos) = list.iter().position(|(id, _)| id == subscription_id) {
                let (_, tx) = list.remove(pos);
                let _ = tx.try_send(update);
            }
            if list.is_empty() {
                subscribers.remove(installation_id);
            }
        }
    }

    pub fn unsubscribe(&self, installation_id: &str, subscription_id: &str) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(installation_id) {
            list.retain(|(id, _)| id != subscription_id);
            if list.is_empty() {
                subscribers.remove(installation_id);
            }
        }
    }

    pub fn subscriber_count(&self, installation_id: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(installation_id)
            .map_or(0, Vec::len)
    }
}

/// A live watch on one installation; dropping it unsubscribes
pub struct Subscription {
    id: SubscriptionId,
    installation_id: InstallationId,
    receiver: mpsc::Receiver<InstallUpdate>,
    registry: Weak<UpdateRegistry>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next update, or `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<InstallUpdate> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.installation_id, &self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("installation_id", &self.installation_id)
            .finish()
    }
}

/// Publishes progress for one installation
///
/// Progress is strictly increasing: stale or repeated values are discarded.
/// Intermediate updates are capped at 99 so that only a terminal update
/// reaches 100.
pub struct ProgressReporter {
    registry: Arc<UpdateRegistry>,
    installation_id: InstallationId,
    status: InstallationStatus,
    last: Mutex<Option<u8>>,
}

impl ProgressReporter {
    /// `status` is the transitional state intermediate updates report
    pub fn new(
        registry: Arc<UpdateRegistry>,
        installation_id: impl Into<String>,
        status: InstallationStatus,
    ) -> Self {
        Self {
            registry,
            installation_id: installation_id.into(),
            status,
            last: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn last_progress(&self) -> Option<u8> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report intermediate progress
    pub fn progress(&self, progress: u8, message: impl Into<String>) -> bool {
        self.emit(self.status, progress.min(99), message.into(), None)
    }

    /// Report successful completion
    pub fn complete(&self, status: InstallationStatus, message: impl Into<String>) -> bool {
        self.emit(status, 100, message.into(), None)
    }

    /// Report terminal failure
    pub fn fail(&self, message: impl Into<String>, error: impl Into<String>) -> bool {
        self.emit(
            InstallationStatus::Failed,
            100,
            message.into(),
            Some(error.into()),
        )
    }

    fn emit(
        &self,
        status: InstallationStatus,
        progress: u8,
        message: String,
        error: Option<String>,
    ) -> bool {
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*last, Some(prev) if progress <= prev) {
                tracing::debug!(
                    installation_id = %self.installation_id,
                    progress,
                    "Discarding non-increasing progress update"
                );
                return false;
            }
            *last = Some(progress);
        }

        self.registry.broadcast(&InstallUpdate {
            installation_id: self.installation_id.clone(),
            status,
            progress,
            message,
            error,
            timestamp: Utc::now(),
        });
        true
    }
}
