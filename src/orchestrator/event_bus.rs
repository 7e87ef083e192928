//! Event Bus (C6, `spec.md` §4.6).
//!
//! One broadcast topic per execution, fed by a persist-then-publish write
//! path so a subscriber can never observe an event that is not already
//! durable in the log. Generalizes the teacher's `EventHandler` callback
//! (`src/cloudllm/event.rs`) into a multi-subscriber, resumable stream,
//! since `spec.md` requires replay and backpressure-bounded fan-out that a
//! single in-process callback cannot express.

use crate::orchestrator::error::{Error, Result};
use crate::orchestrator::execution::ExecutionLog;
use crate::orchestrator::repository::ExecutionLogRepository;
use async_stream::stream;
use chrono::Utc;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

/// Bounded per-subscriber buffer (`spec.md` §4.6 backpressure).
const SUBSCRIBER_BUFFER: usize = 128;

/// Event types that terminate an execution's log (`spec.md` §4.3, §4.6).
const TERMINAL_EVENT_TYPES: &[&str] = &[
    "execution_completed",
    "execution_failed",
    "execution_timeout",
    "execution_cancelled",
];

/// An item delivered to a subscriber: either a durable log row or a
/// synthetic, non-persisted heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum StreamItem {
    Log(ExecutionLog),
    Heartbeat { execution_id: Uuid, next_sequence: u64 },
}

/// Why a subscriber's stream ended before the caller chose to stop reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The subscriber's buffer overflowed (`spec.md` §4.6): the execution
    /// keeps running, only this subscriber is dropped. Reconnect with the
    /// last received `sequence`.
    BufferOverflow,
}

struct Topic {
    sender: broadcast::Sender<ExecutionLog>,
    /// Sequence to assign to the *next* published event. Locked across the
    /// persist-then-broadcast step so readers can snapshot it atomically
    /// with subscribing (`spec.md` §4.6 "Implementation hint").
    next_sequence: Mutex<u64>,
    terminal: AtomicBool,
}

/// Per-execution ordered pub/sub with durable replay (C6).
pub struct EventBus {
    logs: Arc<dyn ExecutionLogRepository>,
    topics: RwLock<HashMap<Uuid, Arc<Topic>>>,
    heartbeat_interval: Duration,
    terminal_grace: Duration,
}

impl EventBus {
    pub fn new(logs: Arc<dyn ExecutionLogRepository>, heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            logs,
            topics: RwLock::new(HashMap::new()),
            heartbeat_interval,
            terminal_grace: Duration::from_secs(60),
        })
    }

    async fn topic_for(&self, execution_id: Uuid) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().await.get(&execution_id) {
            return topic.clone();
        }
        let mut topics = self.topics.write().await;
        let next_sequence = self.logs.highest_sequence(execution_id).await + 1;
        topics
            .entry(execution_id)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
                Arc::new(Topic {
                    sender,
                    next_sequence: Mutex::new(next_sequence),
                    terminal: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Persist `event_type` as the next log row for `execution_id`, then
    /// deliver it to every live subscriber. Returns the durable row.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish(
        self: &Arc<Self>,
        execution_id: Uuid,
        event_type: &str,
        node_id: Option<String>,
        agent_id: Option<String>,
        supervisor_id: Option<String>,
        message: Option<String>,
        extra_data: Value,
    ) -> Result<ExecutionLog> {
        let topic = self.topic_for(execution_id).await;
        let mut guard = topic.next_sequence.lock().await;
        let sequence = *guard;
        let log = ExecutionLog {
            id: Uuid::new_v4(),
            execution_id,
            sequence,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            node_id,
            agent_id,
            supervisor_id,
            message,
            extra_data,
        };
        let persisted = self
            .logs
            .append(log)
            .await
            .map_err(|e| Error::Internal(format!("failed to persist event log: {}", e)))?;
        *guard += 1;

        // Broadcast while still holding the sequence lock (send is
        // synchronous, no await) so concurrent publishers for the same
        // execution can never deliver out of sequence order.
        let _ = topic.sender.send(persisted.clone());
        drop(guard);

        if TERMINAL_EVENT_TYPES.contains(&event_type) {
            topic.terminal.store(true, Ordering::SeqCst);
            self.schedule_reclaim(execution_id);
        }

        Ok(persisted)
    }

    fn schedule_reclaim(self: &Arc<Self>, execution_id: Uuid) {
        let bus = Arc::clone(self);
        let grace = bus.terminal_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            bus.topics.write().await.remove(&execution_id);
        });
    }

    /// Subscribe to `execution_id`'s events, replaying everything with
    /// `sequence > since_sequence` before switching to the live stream. The
    /// handoff is gap-free and duplicate-free (`spec.md` §4.6, §8 invariant 4).
    pub fn subscribe(
        self: &Arc<Self>,
        execution_id: Uuid,
        since_sequence: Option<u64>,
    ) -> impl Stream<Item = std::result::Result<StreamItem, Disconnect>> {
        let bus = Arc::clone(self);
        let since = since_sequence.unwrap_or(0);
        stream! {
            let topic = bus.topic_for(execution_id).await;
            let (snapshot, mut receiver) = {
                let guard = topic.next_sequence.lock().await;
                (*guard, topic.sender.subscribe())
            };

            for row in bus.logs.list_since(execution_id, since).await {
                if row.sequence < snapshot {
                    yield Ok(StreamItem::Log(row));
                }
            }

            if topic.terminal.load(Ordering::SeqCst) {
                return;
            }

            let mut next_sequence = snapshot;
            loop {
                let outcome = tokio::time::timeout(bus.heartbeat_interval, receiver.recv()).await;
                match outcome {
                    Ok(Ok(log)) => {
                        if log.sequence >= next_sequence {
                            let is_terminal = TERMINAL_EVENT_TYPES.contains(&log.event_type.as_str());
                            next_sequence = log.sequence + 1;
                            yield Ok(StreamItem::Log(log));
                            if is_terminal {
                                return;
                            }
                        }
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                        yield Err(Disconnect::BufferOverflow);
                        return;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        return;
                    }
                    Err(_elapsed) => {
                        yield Ok(StreamItem::Heartbeat { execution_id, next_sequence });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::repository::InMemoryRepository;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn persist_before_publish_and_sequence_monotonic() {
        let repo = InMemoryRepository::new();
        let bus = EventBus::new(repo.clone(), Duration::from_secs(30));
        let execution_id = Uuid::new_v4();
        for i in 0..5 {
            bus.publish(execution_id, "node_entered", None, None, None, Some(format!("step {}", i)), Value::Null)
                .await
                .unwrap();
        }
        let rows = repo.list_since(execution_id, 0).await;
        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.sequence, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn resume_from_sequence_is_lossless() {
        let repo = InMemoryRepository::new();
        let bus = EventBus::new(repo.clone(), Duration::from_secs(30));
        let execution_id = Uuid::new_v4();
        for i in 0..5 {
            bus.publish(execution_id, "node_entered", None, None, None, Some(format!("step {}", i)), Value::Null)
                .await
                .unwrap();
        }

        let stream = bus.subscribe(execution_id, Some(2));
        tokio::pin!(stream);
        let mut sequences = Vec::new();
        while let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(50), stream.next()).await {
            match item {
                Ok(StreamItem::Log(log)) => sequences.push(log.sequence),
                Ok(StreamItem::Heartbeat { .. }) => break,
                Err(_) => break,
            }
        }
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn terminal_event_ends_subscriber_stream() {
        let repo = InMemoryRepository::new();
        let bus = EventBus::new(repo.clone(), Duration::from_secs(30));
        let execution_id = Uuid::new_v4();
        bus.publish(execution_id, "execution_started", None, None, None, None, Value::Null).await.unwrap();
        bus.publish(execution_id, "execution_completed", None, None, None, None, Value::Null).await.unwrap();

        let stream = bus.subscribe(execution_id, None);
        tokio::pin!(stream);
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }
        assert_eq!(items.len(), 2);
    }
}
