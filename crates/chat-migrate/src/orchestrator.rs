//! Migration orchestrator - main workflow coordinator.
//!
//! Drives the run through its phases and, for every conversation in
//! scope: create a destination, invite the target recipient, forward
//! the history, replay the realtime queue, persist progress. One
//! conversation's failure never stops the run; the single global
//! fatal condition is being unable to enumerate conversations at all.
//! Conversations are processed strictly sequentially so the limiter's
//! pacing stays meaningful and progress reporting stays deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ChatClient, DialogInfo};
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::forwarder::DialogForwarder;
use crate::limiter::RateLimiter;
use crate::progress::{
    self, DialogStatus, MigrationPhase, MigrationProgress,
};
use crate::sync::SyncQueue;

/// Migration orchestrator.
pub struct MigrationOrchestrator {
    config: Config,
    client: Arc<dyn ChatClient>,
    limiter: Arc<RateLimiter>,
    progress_file: Option<PathBuf>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: completed, completed-with-errors, cancelled or
    /// dry-run.
    pub status: String,

    /// Whether this was a dry run.
    pub dry_run: bool,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Conversations in scope for this run.
    pub dialogs_total: usize,

    pub dialogs_completed: u64,

    pub dialogs_failed: u64,

    pub dialogs_skipped: u64,

    /// Messages forwarded across all conversations.
    pub messages_migrated: u64,

    pub messages_failed: u64,

    /// Flood waits encountered, and the total signaled wait time.
    pub flood_waits: u64,

    pub total_wait_seconds: u64,

    /// Titles of conversations that did not complete.
    pub failed_dialogs: Vec<String>,
}

impl MigrationOrchestrator {
    /// Create a new orchestrator around an authenticated client.
    pub fn new(config: Config, client: Arc<dyn ChatClient>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            config,
            client,
            limiter,
            progress_file: None,
        }
    }

    /// Set the progress file path for resume capability.
    pub fn with_progress_file(mut self, path: PathBuf) -> Self {
        self.progress_file = Some(path);
        self
    }

    /// The shared limiter, e.g. to install a countdown callback.
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Run the migration.
    pub async fn run(
        &self,
        cancel: Option<CancellationToken>,
        dry_run: bool,
    ) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = cancel.unwrap_or_default();
        let mut sync = SyncQueue::new(self.config.sync.clone());

        info!("Starting migration run: {}", run_id);

        // Resume from the progress file when one exists.
        let mut progress = match &self.progress_file {
            Some(path) => progress::load(path)?,
            None => MigrationProgress::new(&self.config.source_account, &self.config.target_account),
        };
        if progress.source_account.is_empty() {
            progress.source_account = self.config.source_account.clone();
            progress.target_account = self.config.target_account.clone();
        }

        // Phase 1: the client is already authenticated; resolve the
        // target recipient so every invite later can succeed.
        progress = progress::set_phase(&progress, MigrationPhase::Authenticating);
        let target = self
            .limiter
            .retry_flood("resolve_entity", || async {
                self.limiter.acquire().await;
                self.client.resolve_entity(&self.config.target_account).await
            })
            .await?
            .ok_or_else(|| MigrateError::EntityNotFound(self.config.target_account.clone()))?;
        debug!("target recipient resolved: {}", target.name);

        // Phase 2: enumerate. This is the one global fatal condition.
        progress = progress::set_phase(&progress, MigrationPhase::EnumeratingConversations);
        self.limiter.acquire().await;
        let dialogs = self
            .client
            .enumerate_dialogs()
            .await
            .map_err(|e| MigrateError::Enumeration(e.to_string()))?;
        let selected: Vec<DialogInfo> = dialogs
            .into_iter()
            .filter(|d| self.config.filters.matches(d))
            .collect();
        info!("Found {} conversations in scope", selected.len());

        for dialog in &selected {
            progress = progress::ensure_dialog(&progress, dialog);
        }
        self.persist(&mut progress);

        if dry_run {
            return Ok(self.build_report(run_id, started_at, &progress, &selected, true, false));
        }

        let forwarder = DialogForwarder::new(
            Arc::clone(&self.client),
            Arc::clone(&self.limiter),
            self.config.forward.clone(),
        );

        // Phase 3: conversation by conversation, strictly sequential.
        let mut cancelled = false;
        for dialog in &selected {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let Some(entry) = progress.dialogs.get(&dialog.id).cloned() else {
                continue;
            };
            if entry.status == DialogStatus::Completed {
                debug!("dialog {}: already completed, skipping", dialog.id);
                continue;
            }
            if dialog.total_messages == 0 && entry.migrated_count == 0 {
                debug!("dialog {}: empty, skipping", dialog.id);
                progress = progress::mark_dialog_skipped(&progress, dialog.id);
                self.persist(&mut progress);
                continue;
            }

            // Destination + invite.
            progress = progress::set_phase(&progress, MigrationPhase::CreatingDestinations);
            let destination_id = match entry.destination_id {
                Some(id) => id,
                None => {
                    match self
                        .limiter
                        .retry_flood("create_destination", || async {
                            self.limiter.acquire().await;
                            self.client.create_destination(&dialog.title).await
                        })
                        .await
                    {
                        Ok(destination) => {
                            progress = progress::set_dialog_destination(
                                &progress,
                                dialog.id,
                                destination.id,
                            );
                            self.persist(&mut progress);
                            destination.id
                        }
                        Err(e) => {
                            warn!("dialog {}: destination creation failed: {}", dialog.id, e);
                            progress = progress::mark_dialog_failed(
                                &progress,
                                dialog.id,
                                &[format!("create destination failed: {}", e)],
                                0,
                            );
                            self.persist(&mut progress);
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = self
                .limiter
                .retry_flood("invite_recipient", || async {
                    self.limiter.acquire().await;
                    self.client
                        .invite_recipient(destination_id, &self.config.target_account)
                        .await
                })
                .await
            {
                warn!("dialog {}: invite failed: {}", dialog.id, e);
                progress = progress::mark_dialog_failed(
                    &progress,
                    dialog.id,
                    &[format!("invite failed: {}", e)],
                    0,
                );
                self.persist(&mut progress);
                continue;
            }

            // Capture live arrivals while the history is forwarded.
            sync.register_mapping(dialog.id, destination_id);
            if let Err(e) = sync.start_listening(Arc::clone(&self.client), dialog.id).await {
                warn!("dialog {}: realtime listener unavailable: {}", dialog.id, e);
            }

            progress = progress::set_phase(&progress, MigrationPhase::ForwardingContent);
            let resume_cursor = entry.last_message_id;
            let result = {
                let progress_ref = &mut progress;
                forwarder
                    .forward_dialog(
                        dialog.id,
                        destination_id,
                        resume_cursor,
                        &cancel,
                        |batch_last, count| {
                            *progress_ref = progress::update_dialog_progress(
                                progress_ref,
                                dialog.id,
                                batch_last,
                                count,
                            );
                            if let Some(path) = &self.progress_file {
                                match progress::save(path, progress_ref) {
                                    Ok(snapshot) => *progress_ref = snapshot,
                                    Err(e) => {
                                        warn!("progress save failed (resume at risk): {}", e)
                                    }
                                }
                            }
                        },
                    )
                    .await
            };

            // Fold the limiter's audit trail into the document.
            let events = self.limiter.take_flood_events().await;
            progress = progress::record_flood_events(&progress, &events);

            // Replay what arrived during forwarding, deduplicated
            // against the ids the batches already covered.
            let boundary = result.newest_message_id.or(resume_cursor);
            let replay = sync
                .process_queue(self.client.as_ref(), dialog.id, boundary)
                .await;
            if replay.synced > 0 {
                // A dialog whose batches forwarded nothing still needs
                // the synced arrivals recorded; the highest replayed id
                // stands in for the missing cursor.
                if let Some(cursor) = result.last_message_id.or(replay.last_synced_id) {
                    progress = progress::update_dialog_progress(
                        &progress,
                        dialog.id,
                        cursor,
                        replay.synced,
                    );
                }
            }
            sync.stop_listening(dialog.id);

            if result.cancelled {
                // Leave the dialog InProgress; the cursor resumes it.
                cancelled = true;
                self.persist(&mut progress);
                break;
            }

            if result.success && replay.failed == 0 {
                progress = progress::mark_dialog_complete(&progress, dialog.id);
                info!(
                    "dialog {} ({}): completed, {} messages",
                    dialog.id, dialog.title, result.migrated
                );
            } else {
                let mut errors = result.errors.clone();
                if replay.failed > 0 {
                    errors.push(format!(
                        "{} realtime messages failed to sync",
                        replay.failed
                    ));
                }
                progress = progress::mark_dialog_failed(
                    &progress,
                    dialog.id,
                    &errors,
                    result.failed + replay.failed,
                );
                warn!(
                    "dialog {} ({}): incomplete ({} migrated, {} failed)",
                    dialog.id, dialog.title, result.migrated, result.failed
                );
            }
            self.persist(&mut progress);
        }

        // Phase 4: finalize. A cancelled run stays resumable.
        if !cancelled {
            progress = progress::set_phase(&progress, MigrationPhase::Completed);
        }
        self.persist(&mut progress);

        let report = self.build_report(run_id, started_at, &progress, &selected, false, cancelled);
        info!(
            "Migration {}: {}/{} conversations, {} messages in {:.1}s",
            report.status,
            report.dialogs_completed,
            report.dialogs_total,
            report.messages_migrated,
            report.duration_seconds
        );
        Ok(report)
    }

    fn build_report(
        &self,
        run_id: String,
        started_at: DateTime<Utc>,
        progress: &MigrationProgress,
        selected: &[DialogInfo],
        dry_run: bool,
        cancelled: bool,
    ) -> MigrationReport {
        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let stats = &progress.stats;

        let failed_dialogs: Vec<String> = progress
            .dialogs
            .values()
            .filter(|d| {
                matches!(
                    d.status,
                    DialogStatus::Failed | DialogStatus::PartiallyMigrated
                )
            })
            .map(|d| d.title.clone())
            .collect();

        let status = if dry_run {
            "dry-run"
        } else if cancelled {
            "cancelled"
        } else if stats.failed_dialogs > 0 {
            "completed-with-errors"
        } else {
            "completed"
        };

        MigrationReport {
            run_id,
            status: status.to_string(),
            dry_run,
            duration_seconds: duration,
            started_at,
            completed_at,
            dialogs_total: selected.len(),
            dialogs_completed: stats.completed_dialogs,
            dialogs_failed: stats.failed_dialogs,
            dialogs_skipped: stats.skipped_dialogs,
            messages_migrated: stats.migrated_messages,
            messages_failed: stats.failed_messages,
            flood_waits: stats.flood_wait_count,
            total_wait_seconds: stats.total_wait_seconds,
            failed_dialogs,
        }
    }

    /// Best-effort save: a persistence failure is surfaced as a
    /// warning and the in-memory run continues.
    fn persist(&self, progress: &mut MigrationProgress) {
        if let Some(path) = &self.progress_file {
            match progress::save(path, progress) {
                Ok(snapshot) => *progress = snapshot,
                Err(e) => warn!("progress save failed (resume at risk): {}", e),
            }
        }
    }
}

impl MigrationReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;
    use crate::client::MessageItem;
    use crate::limiter::RateLimitConfig;
    use tempfile::tempdir;

    fn test_config() -> Config {
        Config::from_yaml(
            r#"
source_account: "+15550001111"
target_account: "@target"
rate_limit:
  batch_delay_ms: 0
  min_batch_delay_ms: 0
  requests_per_minute: 0
"#,
        )
        .unwrap()
    }

    fn orchestrator_with(client: Arc<MockClient>, config: Config) -> MigrationOrchestrator {
        MigrationOrchestrator::new(config, client)
    }

    #[tokio::test]
    async fn test_full_run_completes_all_dialogs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let client = Arc::new(
            MockClient::new()
                .with_dialog(1, "family", 250)
                .with_dialog(2, "work", 40),
        );
        let orchestrator = orchestrator_with(client.clone(), test_config())
            .with_progress_file(path.clone());

        let report = orchestrator.run(None, false).await.unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.dialogs_total, 2);
        assert_eq!(report.dialogs_completed, 2);
        assert_eq!(report.messages_migrated, 290);
        assert_eq!(client.created.lock().unwrap().len(), 2);
        assert_eq!(client.invited.lock().unwrap().len(), 2);

        let saved = progress::load(&path).unwrap();
        assert_eq!(saved.current_phase, MigrationPhase::Completed);
        assert!(saved
            .dialogs
            .values()
            .all(|d| d.status == DialogStatus::Completed));
        assert_eq!(saved.stats.migrated_messages, 290);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_dialogs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let client = Arc::new(MockClient::new().with_dialog(1, "family", 250));
        let orchestrator = orchestrator_with(client.clone(), test_config())
            .with_progress_file(path.clone());

        orchestrator.run(None, false).await.unwrap();
        let calls_after_first = client.forward_call_count();

        let report = orchestrator.run(None, false).await.unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(
            client.forward_call_count(),
            calls_after_first,
            "a completed dialog must not be forwarded again"
        );
    }

    #[tokio::test]
    async fn test_per_dialog_failure_is_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let client = Arc::new(
            MockClient::new()
                .with_dialog(1, "family", 40)
                .with_dialog(2, "work", 40),
        );
        // First destination creation fails outright.
        client.fail_create_call(1, MigrateError::Client("title rejected".into()));
        let orchestrator = orchestrator_with(client.clone(), test_config())
            .with_progress_file(path.clone());

        let report = orchestrator.run(None, false).await.unwrap();
        assert_eq!(report.status, "completed-with-errors");
        assert_eq!(report.dialogs_completed, 1);
        assert_eq!(report.dialogs_failed, 1);
        assert_eq!(report.failed_dialogs.len(), 1);

        let saved = progress::load(&path).unwrap();
        let failed: Vec<_> = saved
            .dialogs
            .values()
            .filter(|d| d.status == DialogStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].errors[0].contains("create destination"));
    }

    #[tokio::test]
    async fn test_enumeration_failure_aborts_run() {
        let mut client = MockClient::new();
        client.fail_enumerate = true;
        let orchestrator = orchestrator_with(Arc::new(client), test_config());

        let err = orchestrator.run(None, false).await.unwrap_err();
        assert!(matches!(err, MigrateError::Enumeration(_)));
    }

    #[tokio::test]
    async fn test_unresolvable_target_aborts_run() {
        let mut client = MockClient::new().with_dialog(1, "family", 10);
        client.resolve_none = true;
        let orchestrator = orchestrator_with(Arc::new(client), test_config());

        let err = orchestrator.run(None, false).await.unwrap_err();
        assert!(matches!(err, MigrateError::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let client = Arc::new(
            MockClient::new()
                .with_dialog(1, "family", 250)
                .with_dialog(2, "work", 40),
        );
        let orchestrator = orchestrator_with(client.clone(), test_config())
            .with_progress_file(path.clone());

        let report = orchestrator.run(None, true).await.unwrap();
        assert_eq!(report.status, "dry-run");
        assert!(report.dry_run);
        assert_eq!(report.dialogs_total, 2);
        assert_eq!(report.messages_migrated, 0);
        assert!(client.created.lock().unwrap().is_empty());
        assert_eq!(client.forward_call_count(), 0);

        // Scope is still recorded for inspection.
        let saved = progress::load(&path).unwrap();
        assert_eq!(saved.dialogs.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_counted_without_batch_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let client = Arc::new(MockClient::new().with_dialog(1, "family", 10));
        client.queue_live(
            1,
            MessageItem {
                id: 100,
                date: Utc::now(),
                has_media: false,
            },
        );
        // Every historical message falls outside the date range, so no
        // batch runs; only the live arrival is migrated.
        let mut config = test_config();
        config.forward.date_from = Some(Utc::now() + chrono::Duration::days(1));
        let orchestrator = orchestrator_with(client.clone(), config)
            .with_progress_file(path.clone());

        let report = orchestrator.run(None, false).await.unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.messages_migrated, 1);

        let saved = progress::load(&path).unwrap();
        let dialog = &saved.dialogs[&1];
        assert_eq!(dialog.migrated_count, 1);
        assert_eq!(dialog.last_message_id, Some(100));
    }

    #[tokio::test]
    async fn test_empty_conversation_is_skipped() {
        let client = Arc::new(
            MockClient::new()
                .with_dialog(1, "family", 40)
                .with_dialog(2, "archive", 0),
        );
        let orchestrator = orchestrator_with(client.clone(), test_config());

        let report = orchestrator.run(None, false).await.unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.dialogs_completed, 1);
        assert_eq!(report.dialogs_skipped, 1);
        // No destination is created for a skipped conversation.
        assert_eq!(*client.created.lock().unwrap(), vec!["family".to_string()]);
    }

    #[tokio::test]
    async fn test_conversation_filter_limits_scope() {
        let client = Arc::new(
            MockClient::new()
                .with_dialog(1, "family", 10)
                .with_dialog(2, "work", 10),
        );
        let mut config = test_config();
        config.filters.dialogs = vec![2];
        let orchestrator = orchestrator_with(client.clone(), config);

        let report = orchestrator.run(None, false).await.unwrap();
        assert_eq!(report.dialogs_total, 1);
        assert_eq!(client.created.lock().unwrap().len(), 1);
        assert_eq!(client.created.lock().unwrap()[0], "work");
    }

    #[tokio::test]
    async fn test_flood_halt_yields_partial_dialog_and_audit_trail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let client = Arc::new(MockClient::new().with_dialog(1, "family", 250));
        let orchestrator = orchestrator_with(client.clone(), test_config())
            .with_progress_file(path.clone());
        // Second forward batch trips the platform limit.
        client.fail_forward_call(2, MigrateError::flood_wait(30, "forward_batch"));

        let report = orchestrator.run(None, false).await.unwrap();
        assert_eq!(report.status, "completed-with-errors");
        assert_eq!(report.flood_waits, 1);
        assert_eq!(report.total_wait_seconds, 30);

        let saved = progress::load(&path).unwrap();
        let dialog = &saved.dialogs[&1];
        assert_eq!(dialog.status, DialogStatus::PartiallyMigrated);
        assert_eq!(dialog.migrated_count, 100);
        assert!(dialog.errors.iter().any(|e| e.contains("30")));
        assert_eq!(saved.flood_wait_events.len(), 1);
        assert_eq!(saved.flood_wait_events[0].operation, "forward_batch");
    }

    #[tokio::test]
    async fn test_adaptive_limiter_is_wired_through() {
        let client = Arc::new(MockClient::new().with_dialog(1, "family", 10));
        client.fail_forward_call(1, MigrateError::flood_wait(5, "forward_batch"));
        let mut config = test_config();
        config.rate_limit = RateLimitConfig {
            batch_delay_ms: 0,
            min_batch_delay_ms: 0,
            max_batch_delay_ms: 100,
            requests_per_minute: 0,
            ..Default::default()
        };
        let orchestrator = orchestrator_with(client.clone(), config);
        let limiter = orchestrator.limiter();

        orchestrator.run(None, false).await.unwrap();
        assert_eq!(limiter.stats().await.flood_waits, 1);
    }
}
