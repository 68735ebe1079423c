use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub plan: PlanLimits,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Put threads back to their prior labels when a remote mutation fails.
    #[serde(default = "default_rollback")]
    pub rollback_on_failure: bool,
}

/// Label and folder allowance of the account's plan. `None` means
/// unlimited. A downgraded account can hold more labels than its plan
/// allows; it keeps them but cannot apply any more of that kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_labels: Option<usize>,
    pub max_folders: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_labels")]
    pub poll_labels: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_rollback() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    30
}

fn default_poll_labels() -> Vec<String> {
    vec!["INBOX".to_string(), "SENT".to_string()]
}

fn default_page_size() -> usize {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_labels: default_poll_labels(),
            page_size: default_page_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plan: PlanLimits::default(),
            sync: SyncConfig::default(),
            rollback_on_failure: default_rollback(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from("settings.toml")
    }

    /// Reads a TOML file, falling back to defaults when it is missing or
    /// does not parse.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid settings, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.rollback_on_failure);
        assert_eq!(config.sync.poll_interval_secs, 30);
        assert_eq!(config.sync.poll_labels, vec!["INBOX", "SENT"]);
        assert_eq!(config.plan.max_folders, None);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            rollback_on_failure = false

            [plan]
            max_folders = 3

            [sync]
            page_size = 20
            "#,
        )
        .unwrap();
        assert!(!config.rollback_on_failure);
        assert_eq!(config.plan.max_folders, Some(3));
        assert_eq!(config.plan.max_labels, None);
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.sync.poll_interval_secs, 30);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = Config::load_from("/nonexistent/settings.toml");
        assert_eq!(config, Config::default());
    }
}
