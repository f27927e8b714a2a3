//! Registry of established data channels.
//!
//! Channels are keyed by label. Registration comes from engine events and
//! from locally created channels; broadcasts come from the operator. Both go
//! through one lock around the label map, and message delivery happens after
//! the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use protocol::error::{ProtocolError, Result};
use tokio::sync::RwLock;

use super::{ChannelId, DataChannel};
use crate::sink::MessageSink;

/// Per-channel outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    outcomes: BTreeMap<String, Result<()>>,
}

impl BroadcastReport {
    /// Returns the outcome for every attempted channel, ordered by label.
    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &Result<()>)> {
        self.outcomes.iter().map(|(label, outcome)| (label.as_str(), outcome))
    }

    /// Returns the outcome for one channel, if it was attempted.
    pub fn outcome(&self, label: &str) -> Option<&Result<()>> {
        self.outcomes.get(label)
    }

    /// Number of channels the message was delivered to.
    pub fn delivered(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_ok()).count()
    }

    /// Number of channels whose send failed.
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    /// Number of channels attempted.
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }
}

/// Label-keyed set of live data channels.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn DataChannel>>>,
    sink: Arc<dyn MessageSink>,
}

impl ChannelRegistry {
    /// Creates an empty registry routing inbound messages to `sink`.
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Inserts or replaces the channel registered under `label`.
    pub async fn register(&self, label: &str, channel: Arc<dyn DataChannel>) {
        let replaced = self
            .channels
            .write()
            .await
            .insert(label.to_string(), channel)
            .is_some();

        if replaced {
            tracing::debug!("data channel '{}' replaced", label);
        } else {
            tracing::debug!("data channel '{}' registered", label);
        }
    }

    /// Removes a channel, returning it if it was registered.
    pub async fn remove(&self, label: &str) -> Option<Arc<dyn DataChannel>> {
        let removed = self.channels.write().await.remove(label);
        if removed.is_some() {
            tracing::debug!("data channel '{}' removed", label);
        }
        removed
    }

    /// Removes the channel under `label` only if it is the instance `id`.
    ///
    /// A close notification for a replaced channel leaves its successor
    /// registered.
    pub async fn remove_instance(&self, label: &str, id: ChannelId) -> Option<Arc<dyn DataChannel>> {
        let mut channels = self.channels.write().await;
        match channels.get(label) {
            Some(current) if current.id() == id => {
                tracing::debug!("data channel '{}' ({}) removed", label, id);
                channels.remove(label)
            }
            Some(current) => {
                tracing::debug!(
                    "ignoring close of '{}' ({}); {} is registered",
                    label,
                    id,
                    current.id()
                );
                None
            }
            None => None,
        }
    }

    /// Removes every channel, returning them ordered by label.
    pub async fn clear(&self) -> Vec<(String, Arc<dyn DataChannel>)> {
        let mut removed: Vec<_> = self.channels.write().await.drain().collect();
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        removed
    }

    /// Returns the channel registered under `label`.
    pub async fn get(&self, label: &str) -> Option<Arc<dyn DataChannel>> {
        self.channels.read().await.get(label).cloned()
    }

    /// Returns the registered labels, sorted.
    pub async fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.channels.read().await.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Returns the number of registered channels.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Returns whether no channels are registered.
    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    /// Sends `message` on every registered channel.
    ///
    /// Channels are attempted independently: a failing channel is recorded in
    /// the report and the remaining channels are still tried. Fails only when
    /// nothing is registered.
    pub async fn broadcast(&self, message: &[u8]) -> Result<BroadcastReport> {
        let snapshot: Vec<(String, Arc<dyn DataChannel>)> = self
            .channels
            .read()
            .await
            .iter()
            .map(|(label, channel)| (label.clone(), channel.clone()))
            .collect();

        if snapshot.is_empty() {
            return Err(ProtocolError::NoActiveChannels);
        }

        let mut report = BroadcastReport::default();
        for (label, channel) in snapshot {
            let outcome = channel.send(message).await.map_err(|e| match e {
                failure @ ProtocolError::ChannelSendFailure { .. } => failure,
                other => ProtocolError::ChannelSendFailure {
                    label: label.clone(),
                    reason: other.to_string(),
                },
            });

            if let Err(e) = &outcome {
                tracing::error!("{}", e);
            }
            report.outcomes.insert(label, outcome);
        }

        Ok(report)
    }

    /// Routes one inbound message to the sink, untouched.
    pub fn on_message(&self, label: &str, payload: &[u8]) {
        self.sink.deliver(label, payload);
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").finish_non_exhaustive()
    }
}
