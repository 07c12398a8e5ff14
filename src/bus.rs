//! Process-wide publish/subscribe registry for push events.
//!
//! One independent channel exists per `(ResourceKind, device id)` pair,
//! created lazily on first subscribe and removed again when its last
//! receiver leaves. The bus is an explicitly constructed, explicitly owned
//! instance; the webhook receiver and every live session hold the same
//! `Arc<EventBus>`, and there is no module-level singleton.
//!
//! Delivery uses one unbounded sender per receiver, so a slow or stalled
//! consumer never blocks the publisher or its siblings. A failed send is a
//! receiver-local problem: it is logged and the remaining receivers still
//! get the event.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// What a push event concerns. Closed set; a new variant needs its own
/// topic-parsing rule in the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A telemetry sample pushed for one data stream
    DataPoint,
    /// A device metadata/status change
    DeviceCore,
}

impl ResourceKind {
    /// Match the resource-kind segment of a webhook topic.
    pub fn from_topic_tag(tag: &str) -> Option<Self> {
        match tag {
            "DataPoint" => Some(Self::DataPoint),
            "DeviceCore" => Some(Self::DeviceCore),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataPoint => "DataPoint",
            Self::DeviceCore => "DeviceCore",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed push event: the kind and device it concerns plus the raw
/// message body as delivered by the cloud. Constructed by the router,
/// consumed immediately by the bus, never persisted.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub kind: ResourceKind,
    pub device_id: String,
    pub raw: Value,
}

/// Result of one publish call. `receiver_count` is the liveness signal the
/// webhook response is built from; `delivered == (receiver_count > 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered: bool,
    pub receiver_count: usize,
}

type ChannelKey = (ResourceKind, String);
type Receiver = mpsc::UnboundedSender<Arc<EventEnvelope>>;

#[derive(Default)]
pub struct EventBus {
    channels: RwLock<HashMap<ChannelKey, HashMap<String, Receiver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `receiver` under `(kind, device_id)`. Subscribing the same
    /// receiver id twice keeps the first registration; one event is still
    /// delivered once.
    pub async fn subscribe(
        &self,
        kind: ResourceKind,
        device_id: &str,
        receiver_id: &str,
        receiver: Receiver,
    ) {
        let mut channels = self.channels.write().await;
        let entry = channels
            .entry((kind, device_id.to_string()))
            .or_default()
            .entry(receiver_id.to_string());
        match entry {
            std::collections::hash_map::Entry::Occupied(_) => {
                debug!(%kind, device_id, receiver_id, "Receiver already subscribed");
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(receiver);
                debug!(%kind, device_id, receiver_id, "Subscribed receiver");
            }
        }
    }

    /// Remove `receiver_id` from `(kind, device_id)`. Removing a receiver
    /// that is not registered is a no-op. Empty channels are dropped so the
    /// registry stays bounded by the set of actively watched devices.
    pub async fn unsubscribe(&self, kind: ResourceKind, device_id: &str, receiver_id: &str) {
        let mut channels = self.channels.write().await;
        let key = (kind, device_id.to_string());
        let drained = match channels.get_mut(&key) {
            Some(receivers) => {
                if receivers.remove(receiver_id).is_some() {
                    debug!(%kind, device_id, receiver_id, "Unsubscribed receiver");
                }
                receivers.is_empty()
            }
            None => false,
        };
        if drained {
            channels.remove(&key);
            debug!(%kind, device_id, "Removed empty channel");
        }
    }

    /// Deliver `envelope` to every receiver currently registered for its
    /// exact key. A channel with zero subscribers is indistinguishable from
    /// one that never existed: both report no receivers.
    pub async fn publish(&self, envelope: EventEnvelope) -> DeliveryOutcome {
        let channels = self.channels.read().await;
        let key = (envelope.kind, envelope.device_id.clone());
        let Some(receivers) = channels.get(&key) else {
            return DeliveryOutcome {
                delivered: false,
                receiver_count: 0,
            };
        };

        let event = Arc::new(envelope);
        let mut receiver_count = 0;
        for (receiver_id, sender) in receivers {
            if sender.send(event.clone()).is_err() {
                // The receiving session is gone but has not unsubscribed
                // yet. Its teardown will remove the entry; don't count it
                // as a live listener.
                warn!(kind = %event.kind, device_id = %event.device_id, %receiver_id,
                    "Dropping event for closed receiver");
            } else {
                receiver_count += 1;
            }
        }
        DeliveryOutcome {
            delivered: receiver_count > 0,
            receiver_count,
        }
    }

    /// Returns current number of live channels
    #[cfg(test)]
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
