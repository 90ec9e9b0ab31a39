//! # chat-migrate
//!
//! Resumable chat history migration library.
//!
//! This library moves the message history of a source account to
//! destinations owned by a target account, one conversation at a time,
//! against a remote platform that enforces dynamically-signaled rate
//! limits. It provides:
//!
//! - **Adaptive rate limiting** that paces outgoing calls and backs off
//!   on flood-wait signals
//! - **Resume capability** via an atomically-written JSON progress file
//! - **Batched forwarding** with per-conversation failure isolation
//! - **Realtime sync** of messages arriving during the migration
//!
//! ## Example
//!
//! ```rust,no_run
//! use chat_migrate::{Config, MigrationOrchestrator};
//! use std::sync::Arc;
//!
//! # async fn run(client: Arc<dyn chat_migrate::ChatClient>) -> chat_migrate::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let orchestrator = MigrationOrchestrator::new(config, client)
//!     .with_progress_file("progress.json".into());
//! let report = orchestrator.run(None, false).await?;
//! println!("Migrated {} messages", report.messages_migrated);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod limiter;
pub mod orchestrator;
pub mod progress;
pub mod sync;

// Re-exports for convenient access
pub use client::{ChatClient, DestinationInfo, DialogInfo, DialogKind, EntityInfo, MessageItem};
pub use config::{Config, FilterSettings};
pub use error::{MigrateError, Result};
pub use forwarder::{DialogForwarder, ForwardConfig, ForwardResult};
pub use limiter::{RateAdjustmentEvent, RateLimitConfig, RateLimitStats, RateLimiter};
pub use orchestrator::{MigrationOrchestrator, MigrationReport};
pub use progress::{
    DialogProgress, DialogStatus, FloodWaitEvent, MigrationPhase, MigrationProgress,
    MigrationStats, SUPPORTED_VERSION,
};
pub use sync::{SyncConfig, SyncQueue, SyncReport, SyncStats};
