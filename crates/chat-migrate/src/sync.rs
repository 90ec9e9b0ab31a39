//! Realtime sync queue.
//!
//! While a conversation is being migrated, messages keep arriving.
//! Each listening conversation owns a bounded queue of those arrivals;
//! once the batch forwarder finishes, the queue is replayed in id order
//! and deduplicated against the highest id the batches already covered.
//! All registries are instance state owned by one queue object per
//! run; there are no process-wide tables.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{ChatClient, MessageItem};
use crate::error::Result;
use crate::forwarder::ForwardIdAllocator;

/// Sync queue tunables.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Queued arrivals kept per conversation; the oldest entry is
    /// dropped past this cap.
    pub max_queue_size: usize,

    /// Delivery attempts per item before it is marked failed.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_retries: 3,
        }
    }
}

/// A live arrival waiting to be replayed.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Message id on the source conversation.
    pub message_id: i32,

    /// When the listener observed it.
    pub arrived_at: DateTime<Utc>,

    /// Opaque payload reference; the queue never inspects it.
    pub item: MessageItem,

    /// Failed delivery attempts so far.
    pub retries: u32,
}

/// Outcome of one queue replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items delivered to the destination.
    pub synced: u64,

    /// Items dropped after exhausting their retries.
    pub failed: u64,

    /// Items already covered by the batch forwarder.
    pub skipped: u64,

    /// Ids that ultimately failed.
    pub failed_ids: Vec<i32>,

    /// Highest id delivered in this replay.
    pub last_synced_id: Option<i32>,
}

/// Pending/processed counters for one conversation.
#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub pending: usize,
    pub processed: u64,
    pub failed: u64,
}

/// Aggregate counters across all conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub total_received: u64,
    pub total_synced: u64,
    pub total_failed: u64,
    pub total_skipped: u64,
    pub overflow_dropped: u64,
    pub active_listeners: usize,
}

#[derive(Default)]
struct DialogQueue {
    items: VecDeque<QueuedMessage>,
    received: u64,
    processed: u64,
    failed: u64,
    skipped: u64,
    overflowed: u64,
}

#[derive(Default)]
struct SyncInner {
    queues: HashMap<i64, DialogQueue>,
    mappings: HashMap<i64, i64>,
}

impl SyncInner {
    fn enqueue(&mut self, dialog_id: i64, item: MessageItem, cap: usize) {
        let queue = self.queues.entry(dialog_id).or_default();
        queue.received += 1;
        if queue.items.len() >= cap.max(1) {
            queue.items.pop_front();
            queue.overflowed += 1;
            warn!(
                "dialog {}: sync queue full, dropped oldest entry",
                dialog_id
            );
        }
        queue.items.push_back(QueuedMessage {
            message_id: item.id,
            arrived_at: Utc::now(),
            item,
            retries: 0,
        });
    }
}

/// Captures messages arriving during migration and replays them after
/// each conversation's batch forwarding completes.
pub struct SyncQueue {
    config: SyncConfig,
    inner: Arc<Mutex<SyncInner>>,
    listeners: HashMap<i64, JoinHandle<()>>,
    forward_ids: ForwardIdAllocator,
}

impl SyncQueue {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(SyncInner::default())),
            listeners: HashMap::new(),
            forward_ids: ForwardIdAllocator::new(),
        }
    }

    /// Start capturing new messages for a conversation. Idempotent:
    /// an existing listener is stopped first; the queue and counters
    /// are created only if absent.
    pub async fn start_listening(
        &mut self,
        client: Arc<dyn ChatClient>,
        dialog_id: i64,
    ) -> Result<()> {
        if let Some(handle) = self.listeners.remove(&dialog_id) {
            handle.abort();
        }
        self.inner
            .lock()
            .expect("sync queue lock")
            .queues
            .entry(dialog_id)
            .or_default();

        let mut rx = client.subscribe_messages(dialog_id).await?;
        let inner = Arc::clone(&self.inner);
        let cap = self.config.max_queue_size;
        let handle = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                inner
                    .lock()
                    .expect("sync queue lock")
                    .enqueue(dialog_id, item, cap);
            }
        });
        self.listeners.insert(dialog_id, handle);
        debug!("dialog {}: realtime listener started", dialog_id);
        Ok(())
    }

    /// Full teardown for a conversation: listener, queue, mapping and
    /// counters all removed. Safe to call for an unregistered id.
    pub fn stop_listening(&mut self, dialog_id: i64) {
        if let Some(handle) = self.listeners.remove(&dialog_id) {
            handle.abort();
            debug!("dialog {}: realtime listener stopped", dialog_id);
        }
        let mut inner = self.inner.lock().expect("sync queue lock");
        inner.queues.remove(&dialog_id);
        inner.mappings.remove(&dialog_id);
    }

    /// Record where queued items for a source conversation should be
    /// delivered.
    pub fn register_mapping(&mut self, source_id: i64, destination_id: i64) {
        self.inner
            .lock()
            .expect("sync queue lock")
            .mappings
            .insert(source_id, destination_id);
    }

    /// Append an observed arrival to a conversation's queue, enforcing
    /// the overflow policy. Listener tasks funnel through this same
    /// path.
    pub fn enqueue(&self, dialog_id: i64, item: MessageItem) {
        self.inner
            .lock()
            .expect("sync queue lock")
            .enqueue(dialog_id, item, self.config.max_queue_size);
    }

    /// Replay a conversation's queue against its destination.
    ///
    /// Items are delivered ascending by id. Anything at or below
    /// `last_batch_message_id` was already covered by the batch
    /// forwarder and is skipped, not retried. Delivery failures bump
    /// the per-item retry counter; items past the cap are dropped as
    /// failed, the rest are requeued for the next call.
    pub async fn process_queue(
        &self,
        client: &dyn ChatClient,
        dialog_id: i64,
        last_batch_message_id: Option<i32>,
    ) -> SyncReport {
        let mut report = SyncReport::default();

        let (mut pending, destination) = {
            let mut inner = self.inner.lock().expect("sync queue lock");
            let destination = inner.mappings.get(&dialog_id).copied();
            let pending: Vec<QueuedMessage> = match inner.queues.get_mut(&dialog_id) {
                Some(queue) => queue.items.drain(..).collect(),
                None => Vec::new(),
            };
            (pending, destination)
        };

        if pending.is_empty() {
            return report;
        }
        let Some(destination) = destination else {
            // No destination yet: leave everything queued.
            warn!(
                "dialog {}: no destination mapping, keeping {} queued items",
                dialog_id,
                pending.len()
            );
            let mut inner = self.inner.lock().expect("sync queue lock");
            if let Some(queue) = inner.queues.get_mut(&dialog_id) {
                queue.items.extend(pending);
            }
            return report;
        };

        pending.sort_by_key(|m| m.message_id);

        let mut requeue: Vec<QueuedMessage> = Vec::new();
        for mut queued in pending {
            if last_batch_message_id.map_or(false, |last| queued.message_id <= last) {
                report.skipped += 1;
                continue;
            }

            let ids = [queued.message_id];
            let forward_ids = self.forward_ids.take(1);
            let delivered = match client
                .forward_batch(dialog_id, destination, &ids, &forward_ids)
                .await
            {
                Ok(outcome) => outcome.success_count > 0 && outcome.failed_ids.is_empty(),
                Err(e) => {
                    debug!(
                        "dialog {}: sync delivery of {} failed: {}",
                        dialog_id, queued.message_id, e
                    );
                    false
                }
            };

            if delivered {
                report.synced += 1;
                // Pending is ascending, so this ends up as the maximum.
                report.last_synced_id = Some(queued.message_id);
            } else {
                queued.retries += 1;
                if queued.retries > self.config.max_retries {
                    report.failed += 1;
                    report.failed_ids.push(queued.message_id);
                } else {
                    requeue.push(queued);
                }
            }
        }

        let mut inner = self.inner.lock().expect("sync queue lock");
        if let Some(queue) = inner.queues.get_mut(&dialog_id) {
            queue.processed += report.synced;
            queue.failed += report.failed;
            queue.skipped += report.skipped;
            // Requeued items go back in front of anything that arrived
            // during this replay.
            for (i, item) in requeue.into_iter().enumerate() {
                queue.items.insert(i, item);
            }
        }
        report
    }

    /// Pending/processed/failed counters for one conversation.
    pub fn queue_status(&self, dialog_id: i64) -> Option<QueueStatus> {
        let inner = self.inner.lock().expect("sync queue lock");
        inner.queues.get(&dialog_id).map(|q| QueueStatus {
            pending: q.items.len(),
            processed: q.processed,
            failed: q.failed,
        })
    }

    /// Aggregate counters across every conversation.
    pub fn stats(&self) -> SyncStats {
        let inner = self.inner.lock().expect("sync queue lock");
        let mut stats = SyncStats {
            active_listeners: self.listeners.len(),
            ..Default::default()
        };
        for queue in inner.queues.values() {
            stats.total_received += queue.received;
            stats.total_synced += queue.processed;
            stats.total_failed += queue.failed;
            stats.total_skipped += queue.skipped;
            stats.overflow_dropped += queue.overflowed;
        }
        stats
    }
}
