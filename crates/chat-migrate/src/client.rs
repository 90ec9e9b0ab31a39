//! Remote platform client boundary.
//!
//! The migration core never speaks the remote wire protocol itself.
//! Everything it needs from the platform sits behind [`ChatClient`],
//! implemented by an adapter crate and injected through constructors.
//! Any method may fail with [`MigrateError::FloodWait`], which the
//! limiter and forwarder recognize as a retryable pacing signal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Kind of conversation on the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    User,
    Group,
    Channel,
    Bot,
}

impl DialogKind {
    /// Parse a kind name as used by the CLI `--type` filter.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(DialogKind::User),
            "group" => Some(DialogKind::Group),
            "channel" => Some(DialogKind::Channel),
            "bot" => Some(DialogKind::Bot),
            _ => None,
        }
    }
}

/// A conversation enumerated from the source account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogInfo {
    /// Platform conversation id.
    pub id: i64,

    /// Display name.
    pub title: String,

    /// Conversation kind.
    pub kind: DialogKind,

    /// Estimated total message count (may be approximate).
    pub total_messages: i64,
}

/// A single message reference within a history page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageItem {
    /// Message id, monotonically increasing on the platform.
    pub id: i32,

    /// When the message was sent.
    pub date: DateTime<Utc>,

    /// Whether the message carries a non-text payload.
    pub has_media: bool,
}

/// Outcome of a batched forward call.
#[derive(Debug, Clone, Default)]
pub struct ForwardOutcome {
    /// Number of messages the platform accepted.
    pub success_count: usize,

    /// Ids the platform rejected within this batch.
    pub failed_ids: Vec<i32>,
}

/// A destination conversation created on the target side.
#[derive(Debug, Clone)]
pub struct DestinationInfo {
    /// Platform id of the new conversation.
    pub id: i64,

    /// Title it was created with.
    pub title: String,
}

/// A resolved platform entity (user, group, channel).
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub id: i64,
    pub name: String,
}

/// Client for the remote chat platform.
///
/// Implementations own authentication, session storage and the wire
/// protocol. Message forwarding must preserve sender attribution and
/// attachment captions; the core treats payloads as opaque.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// List all conversations of the source account.
    async fn enumerate_dialogs(&self) -> Result<Vec<DialogInfo>>;

    /// Fetch one page of history, newest toward oldest.
    ///
    /// Returns at most `limit` items strictly older than `cursor` (or
    /// the newest items when `cursor` is `None`), ordered newest first.
    /// Date filtering and pagination signals are computed by the
    /// forwarder, not here.
    async fn fetch_message_page(
        &self,
        dialog_id: i64,
        cursor: Option<i32>,
        limit: usize,
    ) -> Result<Vec<MessageItem>>;

    /// Forward a batch of messages in one remote call.
    ///
    /// `forward_ids` carries one unique identifier per message so the
    /// platform cannot silently deduplicate distinct forward requests.
    async fn forward_batch(
        &self,
        from_dialog: i64,
        to_dialog: i64,
        message_ids: &[i32],
        forward_ids: &[i64],
    ) -> Result<ForwardOutcome>;

    /// Create a destination conversation on the target side.
    async fn create_destination(&self, title: &str) -> Result<DestinationInfo>;

    /// Invite the target recipient into a destination conversation.
    async fn invite_recipient(&self, destination_id: i64, identifier: &str) -> Result<()>;

    /// Resolve an account identifier to a platform entity.
    async fn resolve_entity(&self, identifier: &str) -> Result<Option<EntityInfo>>;

    /// Subscribe to messages arriving in a conversation while the
    /// migration runs. The receiver yields until unsubscribed or the
    /// client shuts down.
    async fn subscribe_messages(&self, dialog_id: i64) -> Result<mpsc::Receiver<MessageItem>>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory client for component tests.

    use super::*;
    use crate::error::MigrateError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory [`ChatClient`] with scriptable failures.
    pub(crate) struct MockClient {
        pub dialogs: Vec<DialogInfo>,
        /// Messages per dialog, ascending by id.
        pub messages: Mutex<HashMap<i64, Vec<MessageItem>>>,
        /// Errors keyed by 1-based forward call number.
        pub forward_errors: Mutex<HashMap<u32, MigrateError>>,
        /// Ids passed to each forward call, in call order.
        pub forwarded: Mutex<Vec<Vec<i32>>>,
        /// Forward ids observed across all calls.
        pub forward_ids_seen: Mutex<Vec<i64>>,
        pub created: Mutex<Vec<String>>,
        pub invited: Mutex<Vec<(i64, String)>>,
        pub fail_enumerate: bool,
        /// When set, `resolve_entity` reports the identifier unknown.
        pub resolve_none: bool,
        /// Errors keyed by 1-based create_destination call number.
        pub create_errors: Mutex<HashMap<u32, MigrateError>>,
        /// Arrivals delivered on the next subscription, per dialog.
        pub live_messages: Mutex<HashMap<i64, Vec<MessageItem>>>,
        forward_calls: AtomicU32,
        create_calls: AtomicU32,
        next_destination_id: AtomicU32,
    }

    impl MockClient {
        pub(crate) fn new() -> Self {
            Self {
                dialogs: Vec::new(),
                messages: Mutex::new(HashMap::new()),
                forward_errors: Mutex::new(HashMap::new()),
                forwarded: Mutex::new(Vec::new()),
                forward_ids_seen: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                invited: Mutex::new(Vec::new()),
                fail_enumerate: false,
                resolve_none: false,
                create_errors: Mutex::new(HashMap::new()),
                live_messages: Mutex::new(HashMap::new()),
                forward_calls: AtomicU32::new(0),
                create_calls: AtomicU32::new(0),
                next_destination_id: AtomicU32::new(9000),
            }
        }

        pub(crate) fn with_dialog(mut self, id: i64, title: &str, message_count: i32) -> Self {
            self.dialogs.push(DialogInfo {
                id,
                title: title.to_string(),
                kind: DialogKind::User,
                total_messages: message_count as i64,
            });
            let items: Vec<MessageItem> = (1..=message_count)
                .map(|i| MessageItem {
                    id: i,
                    date: Utc::now(),
                    has_media: i % 7 == 0,
                })
                .collect();
            self.messages.lock().unwrap().insert(id, items);
            self
        }

        /// Make the nth forward call (1-based) fail with `err`.
        pub(crate) fn fail_forward_call(&self, call: u32, err: MigrateError) {
            self.forward_errors.lock().unwrap().insert(call, err);
        }

        /// Make the nth create_destination call (1-based) fail.
        pub(crate) fn fail_create_call(&self, call: u32, err: MigrateError) {
            self.create_errors.lock().unwrap().insert(call, err);
        }

        /// Stage a live arrival, delivered on the next subscription to
        /// this dialog.
        pub(crate) fn queue_live(&self, dialog_id: i64, item: MessageItem) {
            self.live_messages
                .lock()
                .unwrap()
                .entry(dialog_id)
                .or_default()
                .push(item);
        }

        pub(crate) fn forward_call_count(&self) -> u32 {
            self.forward_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatClient for MockClient {
        async fn enumerate_dialogs(&self) -> Result<Vec<DialogInfo>> {
            if self.fail_enumerate {
                return Err(MigrateError::Client("listing unavailable".into()));
            }
            Ok(self.dialogs.clone())
        }

        async fn fetch_message_page(
            &self,
            dialog_id: i64,
            cursor: Option<i32>,
            limit: usize,
        ) -> Result<Vec<MessageItem>> {
            // Let spawned listener tasks drain staged arrivals before
            // the page returns.
            tokio::task::yield_now().await;
            let messages = self.messages.lock().unwrap();
            let items = messages
                .get(&dialog_id)
                .map(|v| v.as_slice())
                .unwrap_or(&[]);
            // Newest first, strictly older than the cursor.
            let mut page: Vec<MessageItem> = items
                .iter()
                .rev()
                .filter(|m| cursor.map_or(true, |c| m.id < c))
                .take(limit)
                .cloned()
                .collect();
            page.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(page)
        }

        async fn forward_batch(
            &self,
            _from_dialog: i64,
            _to_dialog: i64,
            message_ids: &[i32],
            forward_ids: &[i64],
        ) -> Result<ForwardOutcome> {
            let call = self.forward_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = self.forward_errors.lock().unwrap().remove(&call) {
                return Err(err);
            }
            self.forwarded.lock().unwrap().push(message_ids.to_vec());
            self.forward_ids_seen
                .lock()
                .unwrap()
                .extend_from_slice(forward_ids);
            Ok(ForwardOutcome {
                success_count: message_ids.len(),
                failed_ids: Vec::new(),
            })
        }

        async fn create_destination(&self, title: &str) -> Result<DestinationInfo> {
            let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = self.create_errors.lock().unwrap().remove(&call) {
                return Err(err);
            }
            self.created.lock().unwrap().push(title.to_string());
            let id = self.next_destination_id.fetch_add(1, Ordering::SeqCst) as i64;
            Ok(DestinationInfo {
                id,
                title: title.to_string(),
            })
        }

        async fn invite_recipient(&self, destination_id: i64, identifier: &str) -> Result<()> {
            self.invited
                .lock()
                .unwrap()
                .push((destination_id, identifier.to_string()));
            Ok(())
        }

        async fn resolve_entity(&self, identifier: &str) -> Result<Option<EntityInfo>> {
            if self.resolve_none {
                return Ok(None);
            }
            Ok(Some(EntityInfo {
                id: 42,
                name: identifier.to_string(),
            }))
        }

        async fn subscribe_messages(&self, dialog_id: i64) -> Result<mpsc::Receiver<MessageItem>> {
            let staged = self
                .live_messages
                .lock()
                .unwrap()
                .remove(&dialog_id)
                .unwrap_or_default();
            let (tx, rx) = mpsc::channel(staged.len().max(1));
            for item in staged {
                let _ = tx.try_send(item);
            }
            // The sender is dropped after the staged arrivals; tests
            // can also push through SyncQueue::enqueue directly.
            Ok(rx)
        }
    }
}
