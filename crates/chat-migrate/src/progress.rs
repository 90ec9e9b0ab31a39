//! Crash-safe, resumable migration progress store.
//!
//! The progress document is a versioned JSON file written atomically
//! (temp sibling + rename), so on disk it is always either the previous
//! complete state or the new complete state. In memory the document is
//! an immutable value: every update function takes a snapshot and
//! returns a new one, which keeps an in-flight update from racing a
//! concurrent persistence write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::client::{DialogInfo, DialogKind};
use crate::error::{MigrateError, Result};

/// The single progress document version this build reads and writes.
/// Any other value is rejected outright; there is no upgrade path.
pub const SUPPORTED_VERSION: &str = "1.0";

/// Phase of the overall migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationPhase {
    Idle,
    Authenticating,
    EnumeratingConversations,
    CreatingDestinations,
    ForwardingContent,
    Completed,
}

/// Status of a single conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DialogStatus {
    Pending,
    InProgress,
    PartiallyMigrated,
    Completed,
    Failed,
    Skipped,
}

/// One recorded flood-wait occurrence. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloodWaitEvent {
    pub at: DateTime<Utc>,
    pub seconds: u64,
    pub operation: String,
}

/// Aggregate counters over the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationStats {
    pub total_dialogs: u64,
    pub completed_dialogs: u64,
    pub failed_dialogs: u64,
    pub skipped_dialogs: u64,
    pub total_messages: u64,
    pub migrated_messages: u64,
    pub failed_messages: u64,
    pub flood_wait_count: u64,
    pub total_wait_seconds: u64,
}

/// Per-conversation migration position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogProgress {
    /// Source conversation id.
    pub id: i64,

    /// Display name at enumeration time.
    pub title: String,

    /// Conversation kind.
    pub kind: DialogKind,

    /// Lifecycle status.
    pub status: DialogStatus,

    /// Destination conversation id, set once created.
    #[serde(default)]
    pub destination_id: Option<i64>,

    /// Resume cursor: id of the last message covered by a batch.
    #[serde(default)]
    pub last_message_id: Option<i32>,

    /// Messages forwarded so far.
    #[serde(default)]
    pub migrated_count: u64,

    /// Estimated total messages in the conversation.
    #[serde(default)]
    pub total_count: u64,

    /// Error records, in occurrence order.
    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DialogProgress {
    /// Fresh Pending entry for a newly enumerated conversation.
    pub fn pending(info: &DialogInfo) -> Self {
        Self {
            id: info.id,
            title: info.title.clone(),
            kind: info.kind,
            status: DialogStatus::Pending,
            destination_id: None,
            last_message_id: None,
            migrated_count: 0,
            total_count: info.total_messages.max(0) as u64,
            errors: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Root progress document, one per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    /// Document format version; must equal [`SUPPORTED_VERSION`].
    pub version: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the document was last saved.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub source_account: String,

    #[serde(default)]
    pub target_account: String,

    #[serde(default = "default_phase")]
    pub current_phase: MigrationPhase,

    /// Per-conversation progress, keyed by conversation id.
    pub dialogs: HashMap<i64, DialogProgress>,

    /// Flood-wait audit trail, in occurrence order.
    #[serde(default)]
    pub flood_wait_events: Vec<FloodWaitEvent>,

    #[serde(default)]
    pub stats: MigrationStats,
}

fn default_phase() -> MigrationPhase {
    MigrationPhase::Idle
}

impl MigrationProgress {
    /// Freshly-initialized empty document.
    pub fn new(source_account: &str, target_account: &str) -> Self {
        let now = Utc::now();
        Self {
            version: SUPPORTED_VERSION.to_string(),
            started_at: now,
            updated_at: now,
            source_account: source_account.to_string(),
            target_account: target_account.to_string(),
            current_phase: MigrationPhase::Idle,
            dialogs: HashMap::new(),
            flood_wait_events: Vec::new(),
            stats: MigrationStats::default(),
        }
    }
}

/// Load the progress document at `path`.
///
/// A missing file is a success: it yields a fresh empty document. An
/// existing file must parse and carry exactly the supported version.
pub fn load<P: AsRef<Path>>(path: P) -> Result<MigrationProgress> {
    let path = path.as_ref();
    if !path.exists() {
        debug!("no progress file at {:?}, starting fresh", path);
        return Ok(MigrationProgress::new("", ""));
    }
    let content = std::fs::read_to_string(path)?;
    parse_document(&content)
}

/// Save the document atomically: refresh `updated_at`, write a sibling
/// temp file, rename it over `path`. Returns the snapshot that was
/// persisted. Failures are reported as `Persistence` errors; a leftover
/// temp file is removed best-effort.
pub fn save<P: AsRef<Path>>(path: P, progress: &MigrationProgress) -> Result<MigrationProgress> {
    let path = path.as_ref();
    let mut snapshot = progress.clone();
    snapshot.updated_at = Utc::now();

    let content = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| MigrateError::Persistence(format!("serialize progress: {}", e)))?;

    let temp_path = path.with_extension("tmp");
    if let Err(e) = std::fs::write(&temp_path, &content) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(MigrateError::Persistence(format!(
            "write {}: {}",
            temp_path.display(),
            e
        )));
    }
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(MigrateError::Persistence(format!(
            "rename {} -> {}: {}",
            temp_path.display(),
            path.display(),
            e
        )));
    }

    Ok(snapshot)
}

/// Serialize the document to a portable string (same schema as the
/// file on disk).
pub fn export_progress(progress: &MigrationProgress) -> Result<String> {
    Ok(serde_json::to_string_pretty(progress)?)
}

/// Parse a portable progress string, running the same validation as
/// [`load`].
pub fn import_progress(content: &str) -> Result<MigrationProgress> {
    parse_document(content)
}

fn parse_document(content: &str) -> Result<MigrationProgress> {
    let progress: MigrationProgress = serde_json::from_str(content)
        .map_err(|e| MigrateError::Format(format!("invalid progress document: {}", e)))?;
    if progress.version != SUPPORTED_VERSION {
        return Err(MigrateError::Format(format!(
            "unsupported progress version \"{}\" (this build supports \"{}\")",
            progress.version, SUPPORTED_VERSION
        )));
    }
    Ok(progress)
}

/// Ensure a Pending entry exists for `info`. Pure: returns the input
/// unchanged if the conversation is already tracked.
pub fn ensure_dialog(progress: &MigrationProgress, info: &DialogInfo) -> MigrationProgress {
    if progress.dialogs.contains_key(&info.id) {
        return progress.clone();
    }
    let mut next = progress.clone();
    next.dialogs.insert(info.id, DialogProgress::pending(info));
    next.stats.total_messages += info.total_messages.max(0) as u64;
    refresh_aggregates(&mut next);
    next
}

/// Record a processed batch for a conversation. Pure: unknown ids
/// return the input unchanged. Replaces the resume cursor, bumps the
/// migrated count, forces the status to InProgress and stamps
/// `started_at` on the first batch.
pub fn update_dialog_progress(
    progress: &MigrationProgress,
    dialog_id: i64,
    last_message_id: i32,
    message_count: u64,
) -> MigrationProgress {
    if !progress.dialogs.contains_key(&dialog_id) {
        return progress.clone();
    }
    let mut next = progress.clone();
    let dialog = next.dialogs.get_mut(&dialog_id).expect("checked above");
    dialog.last_message_id = Some(last_message_id);
    dialog.migrated_count += message_count;
    dialog.status = DialogStatus::InProgress;
    if dialog.started_at.is_none() {
        dialog.started_at = Some(Utc::now());
    }
    refresh_aggregates(&mut next);
    next
}

/// Record the destination created for a conversation. Pure; unknown
/// ids return the input unchanged.
pub fn set_dialog_destination(
    progress: &MigrationProgress,
    dialog_id: i64,
    destination_id: i64,
) -> MigrationProgress {
    let mut next = progress.clone();
    if let Some(dialog) = next.dialogs.get_mut(&dialog_id) {
        dialog.destination_id = Some(destination_id);
    }
    next
}

/// Mark a conversation Completed. Pure; no-op for unknown ids.
pub fn mark_dialog_complete(progress: &MigrationProgress, dialog_id: i64) -> MigrationProgress {
    let mut next = progress.clone();
    if let Some(dialog) = next.dialogs.get_mut(&dialog_id) {
        dialog.status = DialogStatus::Completed;
        dialog.completed_at = Some(Utc::now());
    }
    refresh_aggregates(&mut next);
    next
}

/// Mark a conversation Failed, or PartiallyMigrated when some content
/// already went through. Appends error records and counts the failed
/// messages. Pure; no-op for unknown ids.
pub fn mark_dialog_failed(
    progress: &MigrationProgress,
    dialog_id: i64,
    errors: &[String],
    failed_messages: u64,
) -> MigrationProgress {
    let mut next = progress.clone();
    if let Some(dialog) = next.dialogs.get_mut(&dialog_id) {
        dialog.status = if dialog.migrated_count > 0 {
            DialogStatus::PartiallyMigrated
        } else {
            DialogStatus::Failed
        };
        dialog.errors.extend_from_slice(errors);
        dialog.completed_at = Some(Utc::now());
        next.stats.failed_messages += failed_messages;
    }
    refresh_aggregates(&mut next);
    next
}

/// Mark a conversation Skipped. Pure; no-op for unknown ids.
pub fn mark_dialog_skipped(progress: &MigrationProgress, dialog_id: i64) -> MigrationProgress {
    let mut next = progress.clone();
    if let Some(dialog) = next.dialogs.get_mut(&dialog_id) {
        dialog.status = DialogStatus::Skipped;
    }
    refresh_aggregates(&mut next);
    next
}

/// Append flood-wait events to the audit trail and the aggregate
/// counters. Pure.
pub fn record_flood_events(
    progress: &MigrationProgress,
    events: &[FloodWaitEvent],
) -> MigrationProgress {
    if events.is_empty() {
        return progress.clone();
    }
    let mut next = progress.clone();
    for event in events {
        next.stats.flood_wait_count += 1;
        next.stats.total_wait_seconds += event.seconds;
        next.flood_wait_events.push(event.clone());
    }
    next
}

/// Set the run phase. Pure.
pub fn set_phase(progress: &MigrationProgress, phase: MigrationPhase) -> MigrationProgress {
    let mut next = progress.clone();
    next.current_phase = phase;
    next
}

/// Recompute every dialog-derived aggregate so the document invariants
/// hold: `migrated_messages` is the sum of per-dialog counts and each
/// status counter matches the dialog map.
fn refresh_aggregates(progress: &mut MigrationProgress) {
    let stats = &mut progress.stats;
    stats.total_dialogs = progress.dialogs.len() as u64;
    stats.migrated_messages = progress.dialogs.values().map(|d| d.migrated_count).sum();
    stats.completed_dialogs = count_status(&progress.dialogs, DialogStatus::Completed);
    stats.failed_dialogs = count_status(&progress.dialogs, DialogStatus::Failed)
        + count_status(&progress.dialogs, DialogStatus::PartiallyMigrated);
    stats.skipped_dialogs = count_status(&progress.dialogs, DialogStatus::Skipped);
}

fn count_status(dialogs: &HashMap<i64, DialogProgress>, status: DialogStatus) -> u64 {
    dialogs.values().filter(|d| d.status == status).count() as u64
}
