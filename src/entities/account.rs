// 💳 Merged Account Entity - the engine's output unit
//
// "The id is IDENTITY (stable across merges), history is an append-only LOG,
//  status is a SET of tags"

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

use super::record::Record;

// ============================================================================
// ACCOUNT STATUS
// ============================================================================

/// Non-exclusive status tags carried by a merged account
///
/// Tags written by other tooling are kept as `Other` and carried through
/// merges untouched; they never make an account authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountStatus {
    /// Emitted by the bootstrap (first) pass
    Initial,

    /// Correlated through a unique exact match
    Auto,

    /// Correlated by a reviewer's decision
    Manual,

    /// Confirmed by a reviewer as a new standalone identity
    Authorized,

    /// No candidate found (or a side effect failed) this pass
    Unmatched,

    /// Account belongs to a configured reviewer
    Reviewer,

    /// Orphan account a reviewer confirmed has no owning identity
    Orphan,

    /// Orphan account a reviewer assigned to an identity
    Correlated,

    /// Any tag this crate does not produce
    Other(String),
}

impl AccountStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AccountStatus::Initial => "initial",
            AccountStatus::Auto => "auto",
            AccountStatus::Manual => "manual",
            AccountStatus::Authorized => "authorized",
            AccountStatus::Unmatched => "unmatched",
            AccountStatus::Reviewer => "reviewer",
            AccountStatus::Orphan => "orphan",
            AccountStatus::Correlated => "correlated",
            AccountStatus::Other(tag) => tag,
        }
    }

    /// Parse a stored tag; unknown tags are preserved
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "initial" => AccountStatus::Initial,
            "auto" => AccountStatus::Auto,
            "manual" => AccountStatus::Manual,
            "authorized" => AccountStatus::Authorized,
            "unmatched" => AccountStatus::Unmatched,
            "reviewer" => AccountStatus::Reviewer,
            "orphan" => AccountStatus::Orphan,
            "correlated" => AccountStatus::Correlated,
            other => AccountStatus::Other(other.to_string()),
        }
    }

    /// Tags that make an account part of the authoritative view
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            AccountStatus::Initial
                | AccountStatus::Auto
                | AccountStatus::Manual
                | AccountStatus::Authorized
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AccountStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AccountStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(AccountStatus::from_tag(&tag))
    }
}

// ============================================================================
// ACCOUNT ROLE
// ============================================================================

/// Which kind of account a record is turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountRole {
    /// An identity reconciled by the engine
    Subject,

    /// A reviewer who receives outstanding review cases
    Reviewer,
}

// ============================================================================
// MERGED ACCOUNT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedAccount {
    /// Primary key, never rewritten by a merge
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Chronological audit trail
    #[serde(default)]
    pub history: Vec<String>,

    #[serde(default)]
    pub status: BTreeSet<AccountStatus>,

    /// Outstanding review-case references (reviewer accounts only)
    #[serde(default)]
    pub reviews: BTreeSet<String>,
}

impl MergedAccount {
    pub fn new(id: impl Into<String>) -> Self {
        MergedAccount {
            id: id.into(),
            display_name: None,
            source: None,
            history: Vec::new(),
            status: BTreeSet::new(),
            reviews: BTreeSet::new(),
        }
    }

    /// The one conversion from a record to an account
    pub fn from_record(record: &Record, role: AccountRole) -> Self {
        let mut account = MergedAccount::new(record.key.clone());
        account.display_name = Some(record.name().to_string());
        if !record.source.is_empty() {
            account.source = Some(record.source.clone());
        }
        if role == AccountRole::Reviewer {
            account.status.insert(AccountStatus::Reviewer);
        }
        account
    }

    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status.insert(status);
        self
    }

    /// Append a timestamped audit entry
    pub fn with_entry(mut self, at: DateTime<Utc>, message: &str) -> Self {
        self.record(at, message);
        self
    }

    pub fn record(&mut self, at: DateTime<Utc>, message: &str) {
        self.history.push(history_entry(at, message));
    }

    pub fn has_status(&self, status: AccountStatus) -> bool {
        self.status.contains(&status)
    }

    pub fn is_reviewer(&self) -> bool {
        self.has_status(AccountStatus::Reviewer)
    }

    /// True when the account counts as resolved on the next pass
    pub fn is_authoritative(&self) -> bool {
        self.status.iter().any(|s| s.is_authoritative())
    }
}

/// Format a history line: `[<rfc3339>] message`
pub fn history_entry(at: DateTime<Utc>, message: &str) -> String {
    format!("[{}] {}", at.to_rfc3339_opts(SecondsFormat::Millis, true), message)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_subject_conversion() {
        let record = Record::new("jdoe").with_display_name("John Doe").with_source("HR");
        let account = MergedAccount::from_record(&record, AccountRole::Subject);

        assert_eq!(account.id, "jdoe");
        assert_eq!(account.display_name.as_deref(), Some("John Doe"));
        assert_eq!(account.source.as_deref(), Some("HR"));
        assert!(account.status.is_empty());
        assert!(account.history.is_empty());
    }

    #[test]
    fn test_reviewer_conversion() {
        let record = Record::new("alice");
        let account = MergedAccount::from_record(&record, AccountRole::Reviewer);

        assert!(account.is_reviewer());
        assert!(!account.is_authoritative());
        assert!(account.source.is_none());
    }

    #[test]
    fn test_history_entry_format() {
        let account = MergedAccount::new("jdoe").with_entry(test_time(), "Found on first run");

        assert_eq!(
            account.history,
            vec!["[2026-03-01T12:00:00.000Z] Found on first run".to_string()]
        );
    }

    #[test]
    fn test_authoritative_tags() {
        assert!(MergedAccount::new("a").with_status(AccountStatus::Initial).is_authoritative());
        assert!(MergedAccount::new("a").with_status(AccountStatus::Manual).is_authoritative());
        assert!(!MergedAccount::new("a").with_status(AccountStatus::Unmatched).is_authoritative());
        assert!(!MergedAccount::new("a").is_authoritative());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let account = MergedAccount::new("jdoe")
            .with_status(AccountStatus::Auto)
            .with_status(AccountStatus::Initial);
        let json = serde_json::to_value(&account).unwrap();

        assert_eq!(json["status"], serde_json::json!(["initial", "auto"]));
    }

    #[test]
    fn test_unknown_status_tag_is_preserved() {
        let json = serde_json::json!({
            "id": "jdoe",
            "status": ["initial", "quarantined"]
        });

        let account: MergedAccount = serde_json::from_value(json).unwrap();

        assert!(account.has_status(AccountStatus::Initial));
        assert!(account.has_status(AccountStatus::Other("quarantined".into())));
        assert!(account.is_authoritative());
        assert_eq!(
            serde_json::to_value(&account).unwrap()["status"],
            serde_json::json!(["initial", "quarantined"])
        );
    }

    #[test]
    fn test_unknown_tag_alone_is_not_authoritative() {
        let account = MergedAccount::new("jdoe").with_status(AccountStatus::from_tag("quarantined"));

        assert!(!account.is_authoritative());
        assert_eq!(AccountStatus::from_tag("orphan"), AccountStatus::Orphan);
    }
}
