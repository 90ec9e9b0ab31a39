//! Configuration loading and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::client::{DialogInfo, DialogKind};
use crate::error::{MigrateError, Result};
use crate::forwarder::ForwardConfig;
use crate::limiter::RateLimitConfig;
use crate::sync::SyncConfig;

/// Root configuration structure, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source account identifier (the history being migrated).
    pub source_account: String,

    /// Target account identifier (invited into each destination).
    pub target_account: String,

    /// Flow-control limiter parameters.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Paging and batching parameters.
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Realtime sync queue parameters.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Conversation selection filters.
    #[serde(default)]
    pub filters: FilterSettings,
}

/// Which enumerated conversations take part in the run. Empty lists
/// select everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Restrict to these conversation ids.
    pub dialogs: Vec<i64>,

    /// Restrict to these conversation kinds.
    pub kinds: Vec<DialogKind>,
}

impl FilterSettings {
    /// Whether a conversation is in scope for this run.
    pub fn matches(&self, dialog: &DialogInfo) -> bool {
        if !self.dialogs.is_empty() && !self.dialogs.contains(&dialog.id) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&dialog.kind) {
            return false;
        }
        true
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.source_account.trim().is_empty() {
            return Err(invalid("source_account must not be empty"));
        }
        if self.target_account.trim().is_empty() {
            return Err(invalid("target_account must not be empty"));
        }

        let f = &self.forward;
        if f.batch_size == 0 || f.batch_size > 100 {
            return Err(invalid("forward.batch_size must be between 1 and 100"));
        }
        if f.page_size == 0 {
            return Err(invalid("forward.page_size must be at least 1"));
        }
        if let (Some(from), Some(to)) = (f.date_from, f.date_to) {
            if from > to {
                return Err(invalid("forward.date_from must not be after forward.date_to"));
            }
        }

        let r = &self.rate_limit;
        if r.min_batch_delay_ms > r.max_batch_delay_ms {
            return Err(invalid(
                "rate_limit.min_batch_delay_ms must not exceed max_batch_delay_ms",
            ));
        }
        if r.backoff_multiplier <= 1.0 {
            return Err(invalid("rate_limit.backoff_multiplier must be greater than 1.0"));
        }
        if r.decay_factor <= 0.0 || r.decay_factor >= 1.0 {
            return Err(invalid("rate_limit.decay_factor must be between 0 and 1"));
        }

        if self.sync.max_queue_size == 0 {
            return Err(invalid("sync.max_queue_size must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> MigrateError {
    MigrateError::Config(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source_account: "+15550001111"
target_account: "@target"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.forward.batch_size, 100);
        assert_eq!(config.rate_limit.batch_delay_ms, 1_000);
        assert_eq!(config.sync.max_queue_size, 100);
        assert!(config.filters.dialogs.is_empty());
    }

    #[test]
    fn test_partial_sections_fill_in() {
        let yaml = r#"
source_account: "+15550001111"
target_account: "@target"
rate_limit:
  batch_delay_ms: 500
forward:
  batch_size: 50
filters:
  kinds: [group, channel]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit.batch_delay_ms, 500);
        assert_eq!(config.rate_limit.max_batch_delay_ms, 30_000);
        assert_eq!(config.forward.batch_size, 50);
        assert_eq!(config.filters.kinds, vec![DialogKind::Group, DialogKind::Channel]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for (yaml, needle) in [
            ("source_account: \"\"\ntarget_account: \"@t\"", "source_account"),
            (
                "source_account: \"+1\"\ntarget_account: \"@t\"\nforward:\n  batch_size: 0",
                "batch_size",
            ),
            (
                "source_account: \"+1\"\ntarget_account: \"@t\"\nforward:\n  batch_size: 500",
                "batch_size",
            ),
            (
                "source_account: \"+1\"\ntarget_account: \"@t\"\nrate_limit:\n  decay_factor: 1.5",
                "decay_factor",
            ),
            (
                "source_account: \"+1\"\ntarget_account: \"@t\"\nrate_limit:\n  min_batch_delay_ms: 99999",
                "min_batch_delay_ms",
            ),
        ] {
            let err = Config::from_yaml(yaml).unwrap_err();
            assert!(
                err.to_string().contains(needle),
                "expected {:?} in {:?}",
                needle,
                err.to_string()
            );
        }
    }

    #[test]
    fn test_filters_match() {
        let dialog = DialogInfo {
            id: 7,
            title: "x".into(),
            kind: DialogKind::Group,
            total_messages: 0,
        };
        assert!(FilterSettings::default().matches(&dialog));
        assert!(FilterSettings {
            dialogs: vec![7],
            kinds: vec![DialogKind::Group],
        }
        .matches(&dialog));
        assert!(!FilterSettings {
            dialogs: vec![8],
            ..Default::default()
        }
        .matches(&dialog));
        assert!(!FilterSettings {
            kinds: vec![DialogKind::Channel],
            ..Default::default()
        }
        .matches(&dialog));
    }
}
