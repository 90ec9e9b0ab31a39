//! Per-conversation paginated fetch / batched forward engine.
//!
//! History is walked newest toward oldest by message-id cursor and
//! forwarded in bounded batches. Ordinary batch failures are recorded
//! and the loop moves on; a flood-wait signal halts the conversation
//! immediately with the progress collected so far, since the retry
//! policy for those lives in the limiter and orchestrator layers. The result
//! is always returned, never thrown, so the orchestrator can isolate
//! one conversation's failure from the rest of the run.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ChatClient, MessageItem};
use crate::limiter::RateLimiter;

/// Forwarding parameters for one run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Messages per forward call.
    pub batch_size: usize,

    /// Messages per history page request.
    pub page_size: usize,

    /// Inclusive lower bound on message dates.
    pub date_from: Option<DateTime<Utc>>,

    /// Inclusive upper bound on message dates.
    pub date_to: Option<DateTime<Utc>>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            page_size: 100,
            date_from: None,
            date_to: None,
        }
    }
}

/// One filtered history page with its pagination signals.
#[derive(Debug, Clone)]
pub struct MessagePage {
    /// Items inside the date range, newest first.
    pub items: Vec<MessageItem>,

    /// More history is available only when the raw page was full and
    /// survived date filtering non-empty.
    pub has_more: bool,

    /// Id of the last filtered item, the cursor for the next page.
    pub next_cursor: Option<i32>,
}

/// Outcome of forwarding one conversation. Returned, never thrown.
#[derive(Debug, Clone, Default)]
pub struct ForwardResult {
    /// Messages the platform accepted.
    pub migrated: u64,

    /// Messages rejected or lost to failed batches.
    pub failed: u64,

    /// True only with zero failures and zero residual errors.
    pub success: bool,

    /// The loop stopped at a cancellation checkpoint.
    pub cancelled: bool,

    /// Error records in occurrence order.
    pub errors: Vec<String>,

    /// Resume cursor: last message id covered by a batch.
    pub last_message_id: Option<i32>,

    /// Highest message id covered by this run; the dedup boundary for
    /// the realtime sync queue.
    pub newest_message_id: Option<i32>,
}

/// Allocates unique per-message forwarding identifiers.
///
/// A monotonic counter seeded from the clock: unlike a narrow random
/// id it cannot collide within a run, while still varying between runs
/// so the platform never sees a repeated (id, message) pair.
pub struct ForwardIdAllocator {
    next: AtomicI64,
}

impl ForwardIdAllocator {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(1)
            .abs();
        Self {
            next: AtomicI64::new(seed),
        }
    }

    /// Hand out `count` consecutive unique identifiers.
    pub fn take(&self, count: usize) -> Vec<i64> {
        let start = self.next.fetch_add(count as i64, Ordering::Relaxed);
        (0..count as i64).map(|i| start + i).collect()
    }
}

impl Default for ForwardIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter a raw newest-first page and compute its pagination signals.
pub fn page_from_raw(
    raw: Vec<MessageItem>,
    page_limit: usize,
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
) -> MessagePage {
    let was_full = raw.len() == page_limit && page_limit > 0;
    let items: Vec<MessageItem> = raw
        .into_iter()
        .filter(|m| date_from.map_or(true, |from| m.date >= from))
        .filter(|m| date_to.map_or(true, |to| m.date <= to))
        .collect();
    let has_more = was_full && !items.is_empty();
    let next_cursor = items.last().map(|m| m.id);
    MessagePage {
        items,
        has_more,
        next_cursor,
    }
}

/// Forwards a single conversation's history.
pub struct DialogForwarder {
    client: Arc<dyn ChatClient>,
    limiter: Arc<RateLimiter>,
    config: ForwardConfig,
    forward_ids: ForwardIdAllocator,
}

impl DialogForwarder {
    pub fn new(client: Arc<dyn ChatClient>, limiter: Arc<RateLimiter>, config: ForwardConfig) -> Self {
        Self {
            client,
            limiter,
            config,
            forward_ids: ForwardIdAllocator::new(),
        }
    }

    /// Walk the conversation's history and forward it batch by batch.
    ///
    /// `on_batch` fires after every accepted batch with the batch's
    /// last message id and accepted count, so the caller can persist
    /// progress at each safe point. Cancellation is polled at page and
    /// batch boundaries.
    pub async fn forward_dialog(
        &self,
        source_id: i64,
        destination_id: i64,
        resume_cursor: Option<i32>,
        cancel: &CancellationToken,
        mut on_batch: impl FnMut(i32, u64),
    ) -> ForwardResult {
        let mut result = ForwardResult {
            last_message_id: resume_cursor,
            ..Default::default()
        };
        let mut cursor = resume_cursor;

        debug!(
            "dialog {}: forwarding to {} (cursor {:?})",
            source_id, destination_id, cursor
        );

        'pages: loop {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            // Fetching
            self.limiter.acquire().await;
            let raw = match self
                .client
                .fetch_message_page(source_id, cursor, self.config.page_size)
                .await
            {
                Ok(raw) => raw,
                Err(e) => {
                    if let Some(seconds) = e.flood_wait_seconds() {
                        self.limiter
                            .record_flood_wait(seconds, "fetch_message_page")
                            .await;
                        result
                            .errors
                            .push(format!("flood wait {}s during fetch_message_page", seconds));
                    } else {
                        result.errors.push(format!("fetch failed: {}", e));
                    }
                    break;
                }
            };

            let page = page_from_raw(
                raw,
                self.config.page_size,
                self.config.date_from,
                self.config.date_to,
            );
            if page.items.is_empty() {
                break;
            }
            if result.newest_message_id.is_none() {
                result.newest_message_id = page.items.first().map(|m| m.id);
            }

            // Forwarding
            for batch in page.items.chunks(self.config.batch_size.max(1)) {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    break 'pages;
                }

                self.limiter.acquire().await;
                let ids: Vec<i32> = batch.iter().map(|m| m.id).collect();
                let forward_ids = self.forward_ids.take(ids.len());

                match self
                    .client
                    .forward_batch(source_id, destination_id, &ids, &forward_ids)
                    .await
                {
                    Ok(outcome) => {
                        result.migrated += outcome.success_count as u64;
                        if !outcome.failed_ids.is_empty() {
                            result.failed += outcome.failed_ids.len() as u64;
                            result.errors.push(format!(
                                "batch rejected {} of {} messages",
                                outcome.failed_ids.len(),
                                ids.len()
                            ));
                        }
                        let batch_last = *ids.last().expect("batch is never empty");
                        result.last_message_id = Some(batch_last);
                        on_batch(batch_last, outcome.success_count as u64);
                    }
                    Err(e) => {
                        if let Some(seconds) = e.flood_wait_seconds() {
                            // Flood wait halts the conversation; what
                            // was not forwarded stays unprocessed.
                            self.limiter
                                .record_flood_wait(seconds, "forward_batch")
                                .await;
                            result
                                .errors
                                .push(format!("flood wait {}s during forward_batch", seconds));
                            warn!(
                                "dialog {}: halted by flood wait of {}s",
                                source_id, seconds
                            );
                            break 'pages;
                        }
                        result.failed += ids.len() as u64;
                        result
                            .errors
                            .push(format!("batch forward failed: {}", e));
                    }
                }
            }

            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        result.success = !result.cancelled && result.errors.is_empty() && result.failed == 0;
        debug!(
            "dialog {}: done (migrated {}, failed {}, success {})",
            source_id, result.migrated, result.failed, result.success
        );
        result
    }
}
