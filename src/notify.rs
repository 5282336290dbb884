use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Receives every committed state change. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Discards everything.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: &Event) {}
}

/// A change rendered for delivery: the channel is `venue_<id>`, the payload
/// is the event as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn channel_for(venue_id: Ulid) -> String {
        format!("venue_{venue_id}")
    }

    /// Venue named by a `venue_<id>` channel, prefix matched case-insensitively.
    pub fn venue_of(channel: &str) -> Option<Ulid> {
        let prefix = channel.get(..6)?;
        if !prefix.eq_ignore_ascii_case("venue_") {
            return None;
        }
        Ulid::from_string(&channel[6..]).ok()
    }

    fn from_event(event: &Event) -> Option<Self> {
        match serde_json::to_string(event) {
            Ok(payload) => Some(Self {
                channel: Self::channel_for(event.venue_id()),
                payload,
            }),
            Err(e) => {
                tracing::warn!("dropping unserializable notification: {e}");
                None
            }
        }
    }
}

/// Broadcast hub with one channel per venue plus a firehose of everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one venue's changes. Creates the channel if needed.
    pub fn subscribe(&self, venue_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(venue_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Remove a channel (e.g. when the venue is deleted). Receivers see `Closed`.
    pub fn remove(&self, venue_id: &Ulid) {
        self.channels.remove(venue_id);
    }
}

impl NotificationSink for NotifyHub {
    /// No-op if nobody is listening.
    fn notify(&self, event: &Event) {
        let venue_id = event.venue_id();
        let venue_tx = self.channels.get(&venue_id).map(|e| e.value().clone());
        if venue_tx.is_none() && self.all.receiver_count() == 0 {
            return;
        }
        let Some(notification) = Notification::from_event(event) else {
            return;
        };
        tracing::debug!("notify {}: {}", notification.channel, notification.payload);
        if let Some(tx) = venue_tx {
            let _ = tx.send(notification.clone());
        }
        let _ = self.all.send(notification);
        if matches!(event, Event::VenueDeleted { .. }) {
            self.remove(&venue_id);
        }
    }
}

/// Channels one session listens on. Notifications queue in the receivers
/// until the session drains them.
#[derive(Default)]
pub struct Subscriptions {
    channels: HashMap<String, broadcast::Receiver<Notification>>,
}

impl Subscriptions {
    /// Returns the venue behind `channel`, `None` if it names no venue.
    /// Listening twice on one channel is a no-op.
    pub fn listen(&mut self, hub: &NotifyHub, channel: &str) -> Option<Ulid> {
        let venue_id = Notification::venue_of(channel)?;
        if !self.channels.contains_key(channel) {
            self.channels.insert(channel.to_string(), hub.subscribe(venue_id));
        }
        Some(venue_id)
    }

    /// `None` drops every channel.
    pub fn unlisten(&mut self, channel: Option<&str>) {
        match channel {
            Some(channel) => {
                self.channels.remove(channel);
            }
            None => self.channels.clear(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Everything received since the last drain, under the channel name the
    /// session listened with. Channels of deleted venues are dropped.
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        self.channels.retain(|name, rx| loop {
            match rx.try_recv() {
                Ok(n) => out.push(Notification {
                    channel: name.clone(),
                    payload: n.payload,
                }),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("listener on {name} lagged, {skipped} notifications dropped");
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        out
    }
}
