// 🔌 Collaborator Contracts - everything the engine reads from or writes to
//
// Implementations own transport, persistence and delivery. All calls are
// expected to be bounded by the implementation's own timeouts.

use anyhow::Result;

use crate::entities::{MergedAccount, Record};
use crate::review::{NewReviewCase, ReviewCase};

/// Source of the population and target of correlations
pub trait IdentityStore: Send + Sync {
    /// Current population, with `resolved` set for authoritative records
    fn list_population(&self) -> Result<Vec<Record>>;

    /// Accounts emitted by earlier passes
    fn list_resolved_outputs(&self) -> Result<Vec<MergedAccount>>;

    /// Link the subject to the target identity
    fn correlate(&self, subject_key: &str, target_key: &str) -> Result<()>;
}

/// Accounts on other sources that no identity owns yet
pub trait AccountSource: Send + Sync {
    /// Every account not correlated to an identity, whatever earlier
    /// orphan passes decided about it
    fn list_uncorrelated_accounts(&self) -> Result<Vec<Record>>;

    /// Accounts emitted by earlier orphan passes
    fn list_orphan_outputs(&self) -> Result<Vec<MergedAccount>>;

    /// Assign the account to the identity that owns it
    fn correlate_account(&self, account_key: &str, identity_key: &str) -> Result<()>;
}

/// Persistent review cases, keyed by form name
pub trait ReviewCaseStore: Send + Sync {
    fn find_case(&self, form_name: &str) -> Result<Option<ReviewCase>>;

    /// Create the case unless one with the same form name exists
    ///
    /// Returns the stored case either way, so two overlapping passes never
    /// hold different cases for one subject.
    fn create_case(&self, case: NewReviewCase) -> Result<ReviewCase>;

    /// Claim a case for notification: Created → Assigned
    ///
    /// Conditional on the stored state. Returns false when the case is gone
    /// or has already moved on (claimed by another pass, or acted on by a
    /// reviewer); the caller must not notify then.
    fn mark_assigned(&self, case_ref: &str) -> Result<bool>;

    /// Give back a claim whose notice was not sent: Assigned → Created
    ///
    /// Conditional like `mark_assigned`, so a case a reviewer already moved
    /// on is left alone.
    fn release_assignment(&self, case_ref: &str) -> Result<bool>;

    fn delete_case(&self, case_ref: &str) -> Result<()>;
}

/// Outbound notifications (assignment notices and error reports)
pub trait Notifier: Send + Sync {
    fn notify(&self, recipients: &[String], subject: &str, body: &str) -> Result<()>;
}

/// Lookup of reviewers, named individually or through groups
pub trait ReviewerDirectory: Send + Sync {
    /// Records for the keys that exist; unknown keys are skipped
    fn resolve_identities_by_keys(&self, keys: &[String]) -> Result<Vec<Record>>;

    fn resolve_group_members(&self, group: &str) -> Result<Vec<String>>;
}

/// The four collaborators a pass needs, borrowed for its duration
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub identities: &'a dyn IdentityStore,
    pub cases: &'a dyn ReviewCaseStore,
    pub notifier: &'a dyn Notifier,
    pub directory: &'a dyn ReviewerDirectory,
}

impl<'a> Collaborators<'a> {
    /// All four roles served by one backend
    pub fn single<S>(store: &'a S) -> Self
    where
        S: IdentityStore + ReviewCaseStore + Notifier + ReviewerDirectory,
    {
        Collaborators {
            identities: store,
            cases: store,
            notifier: store,
            directory: store,
        }
    }
}
