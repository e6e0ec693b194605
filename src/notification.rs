// ✉️ Notifications - data for "case assigned" notices and the error report
//
// Only composition lives here; delivery belongs to the Notifier.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::Record;
use crate::error::ReconcileError;
use crate::review::ReviewCase;
use crate::store::Notifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Notice {
    /// Tell reviewers a case is waiting for them
    pub fn assignment(case: &ReviewCase, subject: &Record, recipients: Vec<String>) -> Self {
        let lead = if case.is_orphan_case() {
            "An account without an owner needs your review"
        } else {
            "A potential duplicate identity needs your review"
        };
        let mut lines = vec![
            format!("{lead}: {} ({})", subject.name(), subject.key),
            format!("Case reference: {}", case.case_ref),
            format!("Candidates: {}", case.candidates.len()),
        ];
        for candidate in &case.candidates {
            lines.push(format!("  - {} ({})", candidate.name(), candidate.key));
        }
        lines.push(format!(
            "Please decide before {}",
            case.expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));

        Notice {
            recipients,
            subject: case.form_name.clone(),
            body: lines.join("\n"),
        }
    }

    /// One consolidated report for every non-fatal error of a pass
    pub fn error_report(
        config_name: &str,
        pass_id: &str,
        started_at: DateTime<Utc>,
        errors: &[ReconcileError],
        recipients: Vec<String>,
    ) -> Self {
        let mut lines = vec![
            format!("Context: {config_name} pass {pass_id}"),
            format!("Started: {}", started_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            "Errors:".to_string(),
        ];
        lines.extend(errors.iter().map(|e| format!("  - {e}")));

        Notice {
            recipients,
            subject: format!("Identity reconciliation [{config_name}] error report"),
            body: lines.join("\n"),
        }
    }

    pub fn send(&self, notifier: &dyn Notifier) -> Result<()> {
        notifier.notify(&self.recipients, &self.subject, &self.body)
    }
}

/// Notification addresses of reviewers that carry one
pub fn reviewer_addresses(reviewers: &[Record], attribute: &str) -> Vec<String> {
    reviewers
        .iter()
        .filter_map(|r| r.attribute_text(attribute))
        .filter(|address| !address.trim().is_empty())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{form_name, orphan_form_name, NewReviewCase};
    use chrono::TimeZone;

    #[test]
    fn test_assignment_notice() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let case = NewReviewCase {
            form_name: form_name("jdoe"),
            subject_key: "jdoe".into(),
            candidates: vec![Record::new("john.doe").with_display_name("John Doe")],
            reviewers: vec!["alice".into()],
            expiry: created + chrono::Duration::days(7),
        }
        .into_case(created);
        let subject = Record::new("jdoe").with_display_name("J. Doe");

        let notice = Notice::assignment(&case, &subject, vec!["alice@example.com".into()]);

        assert_eq!(notice.subject, "Identity Merge - jdoe");
        assert_eq!(notice.recipients, vec!["alice@example.com"]);
        assert!(notice.body.contains("J. Doe (jdoe)"));
        assert!(notice.body.contains(&case.case_ref));
        assert!(notice.body.contains("  - John Doe (john.doe)"));
        assert!(notice.body.contains("2026-03-08T00:00:00Z"));
    }

    #[test]
    fn test_orphan_assignment_notice() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let account = Record::new("jd01").with_source("LDAP");
        let case = NewReviewCase {
            form_name: orphan_form_name(&account),
            subject_key: "jd01".into(),
            candidates: vec![Record::new("jdoe")],
            reviewers: vec!["alice".into()],
            expiry: created,
        }
        .into_case(created);

        let notice = Notice::assignment(&case, &account, vec!["alice@example.com".into()]);

        assert_eq!(notice.subject, "Orphan account assignment - jd01 (LDAP)");
        assert!(notice.body.starts_with("An account without an owner needs your review: jd01 (jd01)"));
    }

    #[test]
    fn test_error_report_lists_every_error() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let errors = vec![
            ReconcileError::classification("jdoe", "boom"),
            ReconcileError::DecisionDecode {
                form_name: "Identity Merge - x".into(),
                message: "recipient for form not found (ghost)".into(),
            },
        ];

        let notice = Notice::error_report("HR", "pass-1", started, &errors, vec!["owner@example.com".into()]);

        assert_eq!(notice.subject, "Identity reconciliation [HR] error report");
        assert!(notice.body.starts_with("Context: HR pass pass-1"));
        assert!(notice.body.contains("classification failed for 'jdoe': boom"));
        assert!(notice.body.contains("recipient for form not found (ghost)"));
    }

    #[test]
    fn test_reviewer_addresses_skip_missing() {
        let reviewers = vec![
            Record::new("alice").with_attribute("email", "alice@example.com"),
            Record::new("bob"),
            Record::new("carol").with_attribute("email", ""),
        ];

        assert_eq!(reviewer_addresses(&reviewers, "email"), vec!["alice@example.com"]);
    }
}
