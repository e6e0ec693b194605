// 🧑‍⚖️ Review Case State Machine - lifecycle of one human decision
//
//   Absent → Created → Assigned → InProgress → { Completed | Cancelled }
//
// Absent is "no case found for this form name". Completed and Cancelled are
// terminal. The form name is derived from the subject key alone, so every
// pass (including one restarted after a crash) finds the same case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::entities::Record;
use crate::error::ReconcileError;

/// Reserved decision value: the subject is a brand-new identity
pub const NEW_IDENTITY: &str = "This is a new identity";

/// Reserved decision value: the orphan account has no owning identity
pub const ORPHAN_ACCOUNT: &str = "This is an orphan account";

/// Prefix shared by every form name this engine creates
pub const FORM_NAME_PREFIX: &str = "Identity Merge";

/// Prefix of the form names of orphan-account cases
pub const ORPHAN_FORM_NAME_PREFIX: &str = "Orphan account assignment";

// ============================================================================
// REVIEW STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    /// Persisted, reviewers not yet notified
    Created,

    /// Reviewers notified
    Assigned,

    /// A reviewer opened the case
    InProgress,

    /// Decision recorded
    Completed,

    /// Withdrawn or expired externally
    Cancelled,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::Created => "CREATED",
            ReviewState::Assigned => "ASSIGNED",
            ReviewState::InProgress => "IN_PROGRESS",
            ReviewState::Completed => "COMPLETED",
            ReviewState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewState::Completed | ReviewState::Cancelled)
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(ReviewState::Created),
            "ASSIGNED" => Ok(ReviewState::Assigned),
            "IN_PROGRESS" => Ok(ReviewState::InProgress),
            "COMPLETED" => Ok(ReviewState::Completed),
            "CANCELLED" => Ok(ReviewState::Cancelled),
            other => Err(format!("unknown review state: {other}")),
        }
    }
}

// ============================================================================
// DECISION
// ============================================================================

/// A reviewer's choice, decoded once where the case is read from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Keep the subject on its own: a new identity, or a confirmed orphan
    NewIdentity,

    /// The subject is the same identity as this resolved record
    MatchedKey(String),
}

impl Decision {
    /// Decode the raw value stored with a completed case
    ///
    /// Returns None for a blank value.
    pub fn decode(raw: &str) -> Option<Decision> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else if raw == NEW_IDENTITY || raw == ORPHAN_ACCOUNT {
            Some(Decision::NewIdentity)
        } else {
            Some(Decision::MatchedKey(raw.to_string()))
        }
    }

    /// Raw value as written back to a store
    pub fn encode(&self) -> &str {
        match self {
            Decision::NewIdentity => NEW_IDENTITY,
            Decision::MatchedKey(key) => key,
        }
    }
}

// ============================================================================
// REVIEW CASE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCase {
    /// Reference shown to reviewers (digest of the form name)
    pub case_ref: String,
    pub form_name: String,
    pub subject_key: String,
    pub candidates: Vec<Record>,
    pub reviewers: Vec<String>,
    pub state: ReviewState,
    pub decision: Option<Decision>,
    /// Reviewer key that recorded the decision
    pub decided_by: Option<String>,
    pub expiry: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ReviewCase {
    pub fn is_outstanding(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn is_orphan_case(&self) -> bool {
        self.form_name.starts_with(ORPHAN_FORM_NAME_PREFIX)
    }
}

/// Everything needed to create a case
#[derive(Debug, Clone, PartialEq)]
pub struct NewReviewCase {
    pub form_name: String,
    pub subject_key: String,
    pub candidates: Vec<Record>,
    pub reviewers: Vec<String>,
    pub expiry: DateTime<Utc>,
}

impl NewReviewCase {
    pub fn into_case(self, created_at: DateTime<Utc>) -> ReviewCase {
        ReviewCase {
            case_ref: case_reference(&self.form_name),
            form_name: self.form_name,
            subject_key: self.subject_key,
            candidates: self.candidates,
            reviewers: self.reviewers,
            state: ReviewState::Created,
            decision: None,
            decided_by: None,
            expiry: self.expiry,
            created_at,
        }
    }
}

/// Form name for a subject; identical on every pass
pub fn form_name(subject_key: &str) -> String {
    format!("{FORM_NAME_PREFIX} - {subject_key}")
}

/// Form name for an orphan account; the source keeps equal native keys of
/// different systems apart
pub fn orphan_form_name(account: &Record) -> String {
    format!("{ORPHAN_FORM_NAME_PREFIX} - {} ({})", account.key, account.source)
}

/// Deterministic case reference derived from the form name
pub fn case_reference(form_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(form_name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// What the orchestrator must do with an existing case this pass
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewAction {
    /// Created: notify reviewers, then persist Assigned
    Notify,

    /// Assigned / InProgress: nothing to do until a decision exists
    Wait,

    /// Completed: apply the decision, then delete the case
    Apply { decision: Decision, decided_by: String },

    /// Cancelled: delete the case, the subject is re-classified next pass
    Discard,
}

/// Next step for an observed case
///
/// A completed case without a decision or reviewer cannot be attributed;
/// it stays pending and the problem is reported.
pub fn next_action(case: &ReviewCase) -> Result<ReviewAction, ReconcileError> {
    match case.state {
        ReviewState::Created => Ok(ReviewAction::Notify),
        ReviewState::Assigned | ReviewState::InProgress => Ok(ReviewAction::Wait),
        ReviewState::Cancelled => Ok(ReviewAction::Discard),
        ReviewState::Completed => match (&case.decision, &case.decided_by) {
            (Some(decision), Some(reviewer)) => Ok(ReviewAction::Apply {
                decision: decision.clone(),
                decided_by: reviewer.clone(),
            }),
            (None, _) => Err(ReconcileError::DecisionDecode {
                form_name: case.form_name.clone(),
                message: "completed without a decision value".into(),
            }),
            (_, None) => Err(ReconcileError::DecisionDecode {
                form_name: case.form_name.clone(),
                message: "completed without a recorded reviewer".into(),
            }),
        },
    }
}

/// A decision attributed to a named reviewer
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedDecision {
    pub decision: Decision,
    pub reviewer_name: String,
    /// Audit line for the resulting account history
    pub message: String,
}

/// Attribute a decision to the reviewer who made it
///
/// `reviewer` is the directory lookup for `decided_by`; None means the
/// reviewer could not be resolved and the decision is not applied.
pub fn decode_decision(
    case: &ReviewCase,
    decision: Decision,
    decided_by: &str,
    reviewer: Option<&Record>,
    subject: &Record,
) -> Result<DecodedDecision, ReconcileError> {
    let reviewer = reviewer.ok_or_else(|| ReconcileError::DecisionDecode {
        form_name: case.form_name.clone(),
        message: format!("recipient for form not found ({decided_by})"),
    })?;
    let reviewer_name = reviewer.name().to_string();

    let message = match &decision {
        Decision::NewIdentity => format!("New identity approved by {reviewer_name}"),
        Decision::MatchedKey(_) if subject.source.is_empty() => {
            format!("Assignment of {} approved by {reviewer_name}", subject.name())
        }
        Decision::MatchedKey(_) => format!(
            "Assignment of {} from {} approved by {reviewer_name}",
            subject.name(),
            subject.source
        ),
    };

    Ok(DecodedDecision {
        decision,
        reviewer_name,
        message,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_case(state: ReviewState) -> ReviewCase {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut case = NewReviewCase {
            form_name: form_name("jdoe"),
            subject_key: "jdoe".into(),
            candidates: vec![Record::new("john.doe").resolved(true)],
            reviewers: vec!["alice".into()],
            expiry: created + chrono::Duration::days(7),
        }
        .into_case(created);
        case.state = state;
        case
    }

    #[test]
    fn test_form_name_is_deterministic() {
        assert_eq!(form_name("jdoe"), "Identity Merge - jdoe");
        assert_eq!(case_reference(&form_name("jdoe")), case_reference(&form_name("jdoe")));
        assert_ne!(case_reference(&form_name("jdoe")), case_reference(&form_name("jdoe2")));
        assert_eq!(case_reference("x").len(), 32);
    }

    #[test]
    fn test_orphan_form_name_includes_source() {
        let account = Record::new("jdoe").with_source("LDAP");

        assert_eq!(orphan_form_name(&account), "Orphan account assignment - jdoe (LDAP)");
        assert_ne!(
            orphan_form_name(&account),
            orphan_form_name(&Record::new("jdoe").with_source("AD"))
        );
    }

    #[test]
    fn test_orphan_sentinel_keeps_account_on_its_own() {
        assert_eq!(Decision::decode(ORPHAN_ACCOUNT), Some(Decision::NewIdentity));
        assert_eq!(Decision::decode(NEW_IDENTITY), Some(Decision::NewIdentity));
    }

    #[test]
    fn test_new_case_starts_created() {
        let case = create_test_case(ReviewState::Created);

        assert_eq!(case.state, ReviewState::Created);
        assert_eq!(case.case_ref, case_reference("Identity Merge - jdoe"));
        assert!(case.decision.is_none());
        assert!(case.is_outstanding());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ReviewState::Completed.is_terminal());
        assert!(ReviewState::Cancelled.is_terminal());
        assert!(!ReviewState::Created.is_terminal());
        assert!(!ReviewState::Assigned.is_terminal());
        assert!(!ReviewState::InProgress.is_terminal());
    }

    #[test]
    fn test_state_round_trip_through_text() {
        for state in [
            ReviewState::Created,
            ReviewState::Assigned,
            ReviewState::InProgress,
            ReviewState::Completed,
            ReviewState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<ReviewState>(), Ok(state));
        }
        assert!("DONE".parse::<ReviewState>().is_err());
    }

    #[test]
    fn test_decision_decode() {
        assert_eq!(Decision::decode(NEW_IDENTITY), Some(Decision::NewIdentity));
        assert_eq!(
            Decision::decode("john.doe"),
            Some(Decision::MatchedKey("john.doe".into()))
        );
        assert_eq!(Decision::decode("  "), None);
        assert_eq!(Decision::NewIdentity.encode(), NEW_IDENTITY);
    }

    #[test]
    fn test_next_action_per_state() {
        assert_eq!(next_action(&create_test_case(ReviewState::Created)), Ok(ReviewAction::Notify));
        assert_eq!(next_action(&create_test_case(ReviewState::Assigned)), Ok(ReviewAction::Wait));
        assert_eq!(next_action(&create_test_case(ReviewState::InProgress)), Ok(ReviewAction::Wait));
        assert_eq!(next_action(&create_test_case(ReviewState::Cancelled)), Ok(ReviewAction::Discard));

        let mut completed = create_test_case(ReviewState::Completed);
        completed.decision = Some(Decision::NewIdentity);
        completed.decided_by = Some("alice".into());
        assert_eq!(
            next_action(&completed),
            Ok(ReviewAction::Apply {
                decision: Decision::NewIdentity,
                decided_by: "alice".into()
            })
        );
    }

    #[test]
    fn test_completed_without_reviewer_is_decode_error() {
        let mut completed = create_test_case(ReviewState::Completed);
        completed.decision = Some(Decision::NewIdentity);

        let err = next_action(&completed).unwrap_err();
        assert!(matches!(err, ReconcileError::DecisionDecode { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_decode_decision_messages() {
        let case = create_test_case(ReviewState::Completed);
        let reviewer = Record::new("alice").with_display_name("Alice Admin");
        let subject = Record::new("jdoe").with_display_name("John Doe").with_source("Contractors");

        let new_identity =
            decode_decision(&case, Decision::NewIdentity, "alice", Some(&reviewer), &subject).unwrap();
        assert_eq!(new_identity.message, "New identity approved by Alice Admin");

        let matched = decode_decision(
            &case,
            Decision::MatchedKey("john.doe".into()),
            "alice",
            Some(&reviewer),
            &subject,
        )
        .unwrap();
        assert_eq!(
            matched.message,
            "Assignment of John Doe from Contractors approved by Alice Admin"
        );
        assert_eq!(matched.reviewer_name, "Alice Admin");
    }

    #[test]
    fn test_decode_decision_unknown_reviewer() {
        let case = create_test_case(ReviewState::Completed);
        let subject = Record::new("jdoe");

        let err = decode_decision(&case, Decision::NewIdentity, "ghost", None, &subject).unwrap_err();
        assert_eq!(
            err,
            ReconcileError::DecisionDecode {
                form_name: "Identity Merge - jdoe".into(),
                message: "recipient for form not found (ghost)".into(),
            }
        );
    }
}
