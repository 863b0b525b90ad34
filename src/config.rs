//! TOML configuration for rate limit thresholds.
//!
//! ```toml
//! new_account_age_secs = 604800
//! exempt_roles = ["admin"]
//! spam_trigger_terms = "hey, pokemon go hack"
//!
//! [actions.feedback_message_creation]
//! max_requests = 5
//! interval_secs = 300
//! new_account_max_requests = 1
//! ```

use crate::action::ActionKind;
use crate::actor::Role;
use crate::policy::{PolicyError, PolicyTable, ThresholdPolicy, DEFAULT_NEW_ACCOUNT_AGE_SECONDS};
use crate::spam::SpamTriggerTerms;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid rate limit configuration: {0}")]
    Parse(
        #[source]
        #[from]
        toml::de::Error,
    ),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("new_account_age_secs {0} is out of range")]
    NewAccountAgeOutOfRange(u64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Accounts younger than this are limited with the new account thresholds.
    pub new_account_age_secs: u64,
    /// Actors holding any of these roles are never limited.
    pub exempt_roles: Vec<Role>,
    pub spam_trigger_terms: SpamTriggerTerms,
    pub actions: BTreeMap<String, ActionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub max_requests: u64,
    pub interval_secs: u64,
    #[serde(default)]
    pub new_account_max_requests: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            new_account_age_secs: DEFAULT_NEW_ACCOUNT_AGE_SECONDS,
            exempt_roles: Vec::new(),
            spam_trigger_terms: SpamTriggerTerms::default(),
            actions: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn new_account_age(&self) -> Result<chrono::Duration, ConfigError> {
        chrono::Duration::from_std(Duration::from_secs(self.new_account_age_secs))
            .map_err(|_| ConfigError::NewAccountAgeOutOfRange(self.new_account_age_secs))
    }

    /// Build the validated policy table described by this configuration.
    pub fn policy_table(&self) -> Result<PolicyTable, ConfigError> {
        let rules = PolicyTable::default_tier_rules(self.new_account_age()?, &self.exempt_roles);
        let mut table = PolicyTable::new(rules);
        for (name, action) in &self.actions {
            let mut policy =
                ThresholdPolicy::new(action.max_requests, Duration::from_secs(action.interval_secs));
            policy.new_account_max_requests = action.new_account_max_requests;
            table.insert(ActionKind::new(name.clone()), policy)?;
        }
        Ok(table)
    }
}
