// Streamshelf - Offline Video Downloads for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Download lifecycle events
//!
//! Subscribers are called synchronously, in subscription order, on whichever task
//! emitted the event. Callbacks must not block; use [`EventBus::subscribe_channel`]
//! to move work elsewhere.

use crate::download::progress::DownloadStatus;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Per-download progress payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub id: String,
    pub episode_number: Option<u32>,
    pub progress: f64,
    pub status: DownloadStatus,
}

/// How far a completed download has materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionPhase {
    /// Video persisted and playable; subtitle still downloading
    VideoReady,
    /// Video and any subtitle are on disk (or the subtitle failed)
    FullyReady,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DownloadEvent {
    Progress(ProgressPayload),
    /// Queue or active set changed
    StatusChange,
    Completed {
        #[serde(flatten)]
        payload: ProgressPayload,
        phase: CompletionPhase,
    },
    /// An asset was deleted
    Deleted,
    /// Asset records changed without a deletion
    LibraryChange,
    /// Validation removed assets whose files are gone
    Cleanup,
    /// A download failed; `message` is meant for the user
    Failed {
        id: String,
        title: String,
        message: String,
    },
}

impl DownloadEvent {
    /// Consumers that cache the asset list must reload it
    pub fn requires_cache_invalidation(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Completed { .. }
                | DownloadEvent::Deleted
                | DownloadEvent::LibraryChange
                | DownloadEvent::Cleanup
        )
    }

    pub fn download_id(&self) -> Option<&str> {
        match self {
            DownloadEvent::Progress(payload) | DownloadEvent::Completed { payload, .. } => {
                Some(&payload.id)
            }
            DownloadEvent::Failed { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Callback type for download events
pub type EventCallback = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, EventCallback)>,
}

/// Fan-out of [`DownloadEvent`]s to subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Subscribers>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .subscribers
            .read()
            .map(|s| s.callbacks.len())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("subscribers", &count).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        let mut subscribers = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;
        subscribers.callbacks.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subscribers.callbacks.len();
        subscribers.callbacks.retain(|(sub, _)| *sub != id);
        subscribers.callbacks.len() != before
    }

    /// Receive every event on a channel; the subscription ends when the receiver drops
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = self.clone();
        let slot: Arc<RwLock<Option<SubscriptionId>>> = Arc::new(RwLock::new(None));
        let own_id = Arc::clone(&slot);

        let id = self.subscribe(move |event| {
            if tx.send(event.clone()).is_err() {
                // Receiver gone: drop this subscription. emit() holds no lock here.
                if let Some(id) = own_id.read().ok().and_then(|guard| *guard) {
                    bus.unsubscribe(id);
                }
            }
        });
        if let Ok(mut guard) = slot.write() {
            *guard = Some(id);
        }
        rx
    }

    /// Deliver `event` to every subscriber in subscription order
    pub fn emit(&self, event: DownloadEvent) {
        // Snapshot so callbacks may subscribe or unsubscribe
        let callbacks: Vec<EventCallback> = match self.subscribers.read() {
            Ok(guard) => guard.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .callbacks
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect(),
        };

        tracing::trace!(?event, subscribers = callbacks.len(), "Emitting download event");
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .map(|s| s.callbacks.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn progress(id: &str, value: f64) -> DownloadEvent {
        DownloadEvent::Progress(ProgressPayload {
            id: id.to_string(),
            episode_number: Some(1),
            progress: value,
            status: DownloadStatus::Downloading,
        })
    }

    #[test]
    fn test_cache_invalidation_table() {
        assert!(!progress("a", 0.1).requires_cache_invalidation());
        assert!(!DownloadEvent::StatusChange.requires_cache_invalidation());
        assert!(DownloadEvent::Deleted.requires_cache_invalidation());
        assert!(DownloadEvent::LibraryChange.requires_cache_invalidation());
        assert!(DownloadEvent::Cleanup.requires_cache_invalidation());
        assert!(DownloadEvent::Completed {
            payload: ProgressPayload {
                id: "a".into(),
                episode_number: None,
                progress: 1.0,
                status: DownloadStatus::Completed,
            },
            phase: CompletionPhase::FullyReady,
        }
        .requires_cache_invalidation());
        assert!(!DownloadEvent::Failed {
            id: "a".into(),
            title: "t".into(),
            message: "m".into()
        }
        .requires_cache_invalidation());
    }

    #[test]
    fn test_subscribers_called_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().unwrap().push(tag));
        }
        bus.emit(DownloadEvent::StatusChange);

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(move |_| *c.lock().unwrap() += 1);

        bus.emit(DownloadEvent::Deleted);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(DownloadEvent::Deleted);

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel();

        bus.emit(progress("x", 0.5));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.download_id(), Some("x"));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(progress("x", 0.25)).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["episodeNumber"], 1);
        assert_eq!(json["status"], "downloading");
    }
}
