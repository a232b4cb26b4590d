/// Supervisor event bus and host bridge.
use crate::logs::LogEntry;
use crate::state::AgentStatus;
use crate::stream::LoadingProgress;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Broadcast channel capacity. Slow subscribers skip ahead past this many events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Events pushed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum SupervisorEvent {
    /// One captured or generated log line
    #[serde(rename = "agent-log")]
    Log(LogEntry),

    /// One per applied transition
    #[serde(rename = "agent-status")]
    Status { status: AgentStatus },

    /// Model load or download progress
    #[serde(rename = "agent-loading-progress")]
    LoadingProgress(LoadingProgress),
}

impl SupervisorEvent {
    /// Wire name used by host bridges.
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorEvent::Log(_) => "agent-log",
            SupervisorEvent::Status { .. } => "agent-status",
            SupervisorEvent::LoadingProgress(_) => "agent-loading-progress",
        }
    }
}

/// Capabilities supplied by the embedding host (desktop shell, CLI, tests).
pub trait RuntimeBridge: Send + Sync {
    /// Directory holding bundled sidecar binaries, if the host ships any.
    fn resource_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Forward an event to the host UI. Called inline; must not call back into the supervisor.
    fn emit(&self, event: &SupervisorEvent);
}

/// Metadata kept for each live subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Statistics about event bus usage
#[derive(Debug, Clone, Default)]
pub struct EventBusStats {
    pub total_events_published: u64,
    pub total_subscriptions: u64,
    pub active_subscriptions: usize,
    pub events_by_type: HashMap<String, u64>,
}

type Registry = RwLock<HashMap<Uuid, SubscriptionInfo>>;

/// Fan-out of [`SupervisorEvent`]s to any number of subscribers.
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
    subscriptions: Arc<Registry>,
    stats: RwLock<EventBusStats>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SupervisorEvent) {
        {
            let mut stats = self.stats.write();
            stats.total_events_published += 1;
            *stats
                .events_by_type
                .entry(event.name().to_string())
                .or_insert(0) += 1;
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events. Dropping the token unsubscribes.
    pub fn subscribe(&self) -> Subscription {
        let info = SubscriptionInfo {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let id = info.id;
        self.subscriptions.write().insert(id, info);
        self.stats.write().total_subscriptions += 1;

        Subscription {
            id,
            rx: self.tx.subscribe(),
            registry: Arc::downgrade(&self.subscriptions),
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> EventBusStats {
        let mut stats = self.stats.read().clone();
        stats.active_subscriptions = self.subscription_count();
        stats
    }

    /// Get active subscription count
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Live subscription to an [`EventBus`]. Released on drop.
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<SupervisorEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber {} lagged, skipped {} events", self.id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber {} lagged, skipped {} events", self.id, skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.id);
        }
    }
}
