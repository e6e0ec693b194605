// ⚙️ Reconciliation Config - one explicit struct handed to the engine
//
// Loaded from TOML. Every component receives what it needs from here;
// there is no global or captured configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ReconcileError;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Name of this reconciliation source (used in case names and error reports)
    pub name: String,

    /// Record attributes compared by the classifier
    pub attributes: Vec<String>,

    /// Minimum combined score (0-100) for a candidate to reach human review
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Reviewer identity keys
    #[serde(default)]
    pub reviewers: Vec<String>,

    /// Groups whose members are also reviewers
    #[serde(default)]
    pub reviewer_groups: Vec<String>,

    /// Days until a newly created review case expires
    #[serde(default = "default_expiration_days")]
    pub expiration_days: u32,

    /// Addresses that receive the consolidated error report
    #[serde(default)]
    pub error_recipients: Vec<String>,

    /// Reviewer record attribute holding the notification address
    #[serde(default = "default_email_attribute")]
    pub reviewer_email_attribute: String,

    /// Worker threads used for unresolved records (1 = sequential)
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_threshold() -> f64 {
    70.0
}

fn default_expiration_days() -> u32 {
    7
}

fn default_email_attribute() -> String {
    "email".to_string()
}

fn default_workers() -> usize {
    1
}

impl ReconcileConfig {
    /// Minimal config with defaults; callers fill in reviewers.
    pub fn new(name: impl Into<String>, attributes: Vec<String>) -> Self {
        ReconcileConfig {
            name: name.into(),
            attributes,
            threshold: default_threshold(),
            reviewers: Vec::new(),
            reviewer_groups: Vec::new(),
            expiration_days: default_expiration_days(),
            error_recipients: Vec::new(),
            reviewer_email_attribute: default_email_attribute(),
            workers: default_workers(),
        }
    }

    pub fn from_toml(input: &str) -> Result<Self, ReconcileError> {
        let config: ReconcileConfig = toml::from_str(input)
            .map_err(|e| ReconcileError::Configuration(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ReconcileError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ReconcileError::Configuration(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.name.trim().is_empty() {
            return Err(ReconcileError::Configuration("name must not be empty".into()));
        }

        if self.attributes.is_empty() {
            return Err(ReconcileError::Configuration(
                "at least one matching attribute is required".into(),
            ));
        }

        if self.threshold.is_nan() || self.threshold < 0.0 {
            return Err(ReconcileError::Configuration(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }

        if self.workers == 0 {
            return Err(ReconcileError::Configuration("workers must be at least 1".into()));
        }

        if self.reviewers.is_empty() && self.reviewer_groups.is_empty() {
            return Err(ReconcileError::Configuration(
                "no reviewers or reviewer groups configured".into(),
            ));
        }

        Ok(())
    }

    pub fn with_reviewers(mut self, reviewers: &[&str]) -> Self {
        self.reviewers = reviewers.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_reviewer_groups(mut self, groups: &[&str]) -> Self {
        self.reviewer_groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_error_recipients(mut self, recipients: &[&str]) -> Self {
        self.error_recipients = recipients.iter().map(|r| r.to_string()).collect();
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
