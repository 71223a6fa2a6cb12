//! Change events emitted by polls and reconciliation.

use crate::instance::PollReport;
use convoy_schema::{ManagedContainer, WatcherKey};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One inventory mutation. `container` is the row as written, or as it
/// was before deletion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub change: ChangeKind,
    pub container: ManagedContainer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    PollStarted { watcher: WatcherKey },
    PollFinished { watcher: WatcherKey, report: PollReport },
    PollFailed { watcher: WatcherKey, error: String },
    Container(ChangeEvent),
}

impl WatchEvent {
    pub fn change(&self) -> Option<&ChangeEvent> {
        match self {
            WatchEvent::Container(change) => Some(change),
            _ => None,
        }
    }
}

/// Event bus the engine publishes to. Called from blocking worker threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WatchEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: WatchEvent) {}
}

/// Writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: WatchEvent) {
        match event {
            WatchEvent::PollStarted { watcher } => debug!("{watcher}: poll started"),
            WatchEvent::PollFinished { watcher, report } => debug!(
                "{watcher}: poll finished ({} listed, {} created, {} updated, {} deleted)",
                report.listed,
                report.reconcile.created,
                report.reconcile.updated,
                report.reconcile.deleted
            ),
            WatchEvent::PollFailed { watcher, error } => warn!("{watcher}: poll failed: {error}"),
            WatchEvent::Container(ChangeEvent { change, container }) => info!(
                "{}: {} {:?} ({}) status={}",
                container.watcher, container.name, change, container.provider_id, container.status
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WatchEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WatchEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn changes(&self) -> Vec<ChangeEvent> {
        self.events()
            .iter()
            .filter_map(WatchEvent::change)
            .cloned()
            .collect()
    }

    pub fn polls_started(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, WatchEvent::PollStarted { .. }))
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: WatchEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Fans events out to tokio subscribers. Events sent while nobody is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<WatchEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }
}
