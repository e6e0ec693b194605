// 🧭 Orphan Accounts - hand accounts nobody owns to the identity they belong to
//
//   uncorrelated accounts → similar identities? → review case → emit
//
// Shares the engine of the identity pass: the same reviewers, the same case
// lifecycle, one error report. An account with no similar identity is left
// alone, and an account an earlier pass settled is never looked at again.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, info_span, warn};

use super::{absorb, PassContext, PassReport, PassStats, ReconciliationEngine, SubjectEvent, SubjectOutcome};
use crate::entities::{AccountRole, AccountStatus, MergedAccount, Record};
use crate::error::ReconcileError;
use crate::merge::AccountView;
use crate::review::{decode_decision, orphan_form_name, Decision, ReviewCase};
use crate::store::{AccountSource, Collaborators};

impl ReconciliationEngine {
    /// Run one orphan-account pass now
    pub fn run_orphan_pass(
        &self,
        collaborators: Collaborators<'_>,
        accounts: &dyn AccountSource,
    ) -> Result<PassReport, ReconcileError> {
        self.run_orphan_pass_at(collaborators, accounts, Utc::now())
    }

    /// Run one orphan-account pass with an explicit clock
    ///
    /// Identities are the resolved part of the population. Errors follow
    /// the identity pass: fatal ones return Err, the rest are reported once.
    pub fn run_orphan_pass_at(
        &self,
        collaborators: Collaborators<'_>,
        accounts: &dyn AccountSource,
        now: DateTime<Utc>,
    ) -> Result<PassReport, ReconcileError> {
        let pass_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("reconcile.orphan_pass", pass_id = %pass_id, config = %self.config.name);
        let _guard = span.enter();

        let mut errors = Vec::new();
        let result = self.reconcile_orphans(collaborators, accounts, &pass_id, now, &mut errors);
        self.conclude(collaborators, &pass_id, now, result, errors)
    }

    fn reconcile_orphans(
        &self,
        collaborators: Collaborators<'_>,
        accounts: &dyn AccountSource,
        pass_id: &str,
        now: DateTime<Utc>,
        errors: &mut Vec<ReconcileError>,
    ) -> Result<PassReport, ReconcileError> {
        let reviewers = self.resolve_reviewers(collaborators, errors)?;

        let identities: Vec<Record> = collaborators
            .identities
            .list_population()
            .map_err(|e| ReconcileError::Configuration(format!("cannot list population: {e:#}")))?
            .into_iter()
            .filter(|r| r.resolved)
            .collect();
        let prior = accounts
            .list_orphan_outputs()
            .map_err(|e| ReconcileError::Configuration(format!("cannot list orphan outputs: {e:#}")))?;
        let uncorrelated = accounts
            .list_uncorrelated_accounts()
            .map_err(|e| ReconcileError::Configuration(format!("cannot list uncorrelated accounts: {e:#}")))?;

        let pending: Vec<Record> = {
            let settled: HashSet<&str> = prior
                .iter()
                .filter(|a| a.has_status(AccountStatus::Orphan) || a.has_status(AccountStatus::Correlated))
                .map(|a| a.id.as_str())
                .collect();
            uncorrelated
                .into_iter()
                .filter(|a| !settled.contains(a.key.as_str()))
                .collect()
        };

        info!(
            identities = identities.len(),
            accounts = pending.len(),
            reviewers = reviewers.len(),
            "orphan_pass_start"
        );

        let mut stats = PassStats {
            resolved: identities.len(),
            unresolved: pending.len(),
            ..PassStats::default()
        };

        // Reviewer accounts are derived again from this pass's reviewers
        let mut view = AccountView::new();
        view.merge_all(
            prior
                .into_iter()
                .filter(|a| !(a.is_reviewer() && a.status.len() == 1)),
        );
        view.merge_all(
            reviewers
                .iter()
                .map(|r| MergedAccount::from_record(r, AccountRole::Reviewer)),
        );

        let unsettled = HashMap::new();
        let ctx = PassContext {
            collaborators,
            candidates: &identities,
            reviewers: &reviewers,
            reviewer_keys: reviewers.iter().map(|r| r.key.clone()).collect(),
            unsettled: &unsettled,
            now,
        };

        let mut outstanding = Vec::new();
        let outcomes = self.process_all(&pending, |account| self.process_orphan(&ctx, accounts, account))?;
        absorb(outcomes, &mut stats, errors, &mut outstanding, &mut view);

        Ok(self.finish(collaborators, pass_id, now, &reviewers, view, outstanding, errors, stats))
    }

    fn process_orphan(
        &self,
        ctx: &PassContext<'_>,
        source: &dyn AccountSource,
        account: &Record,
    ) -> SubjectOutcome {
        let mut outcome = SubjectOutcome::default();
        if let Err(err) = self.drive_orphan(ctx, source, account, &mut outcome) {
            warn!(account = %account.key, error = %err, "orphan_account_failed");
            outcome.errors.push(err);
        }
        outcome
    }

    fn drive_orphan(
        &self,
        ctx: &PassContext<'_>,
        source: &dyn AccountSource,
        account: &Record,
        outcome: &mut SubjectOutcome,
    ) -> Result<(), ReconcileError> {
        if account.key.trim().is_empty() {
            return Err(ReconcileError::classification(account.name(), "account has no key"));
        }

        let form = orphan_form_name(account);
        let existing = ctx
            .collaborators
            .cases
            .find_case(&form)
            .map_err(|e| ReconcileError::external("find_case", form.as_str(), e))?;

        match existing {
            Some(case) => {
                if let Some((decision, decided_by)) = self.advance_case(ctx, account, &case, outcome) {
                    self.apply_orphan_decision(ctx, source, account, &case, decision, &decided_by, outcome);
                }
            }
            None => {
                let similar = self.classifier.find_similar_matches(account, ctx.candidates);
                if similar.is_empty() {
                    debug!(account = %account.key, "no similar identity");
                    outcome.event = Some(SubjectEvent::Skipped);
                } else {
                    self.request_review(ctx, form, account, similar, outcome);
                }
            }
        }

        Ok(())
    }

    /// Completed: settle the account as orphan or correlated
    #[allow(clippy::too_many_arguments)]
    fn apply_orphan_decision(
        &self,
        ctx: &PassContext<'_>,
        source: &dyn AccountSource,
        account: &Record,
        case: &ReviewCase,
        decision: Decision,
        decided_by: &str,
        outcome: &mut SubjectOutcome,
    ) {
        let decoded = match self
            .lookup_reviewer(ctx, decided_by)
            .and_then(|reviewer| decode_decision(case, decision, decided_by, reviewer.as_ref(), account))
        {
            Ok(decoded) => decoded,
            Err(err) => {
                outcome.errors.push(err);
                outcome.pending(case, SubjectEvent::Pending);
                return;
            }
        };

        match &decoded.decision {
            Decision::NewIdentity => {
                info!(account = %account.key, reviewer = %decoded.reviewer_name, "orphan_account_confirmed");
                outcome.emit(
                    MergedAccount::from_record(account, AccountRole::Subject)
                        .with_status(AccountStatus::Orphan)
                        .with_entry(
                            ctx.now,
                            &format!("Orphan account confirmed by {}", decoded.reviewer_name),
                        ),
                    SubjectEvent::OrphanConfirmed,
                );
                self.delete_case(ctx, case, outcome);
            }
            Decision::MatchedKey(key) => {
                if !ctx.candidates.iter().any(|c| &c.key == key) {
                    // Offered again against the current identities next pass
                    outcome.errors.push(ReconcileError::classification(
                        account.key.as_str(),
                        format!("selected identity '{key}' is no longer resolved"),
                    ));
                    outcome.event = Some(SubjectEvent::Cancelled);
                    self.delete_case(ctx, case, outcome);
                    return;
                }

                match source.correlate_account(&account.key, key) {
                    Ok(()) => {
                        info!(account = %account.key, identity = %key, "orphan_account_correlated");
                        outcome.emit(
                            MergedAccount::from_record(account, AccountRole::Subject)
                                .with_status(AccountStatus::Correlated)
                                .with_entry(ctx.now, &decoded.message),
                            SubjectEvent::ManualCorrelated,
                        );
                        self.delete_case(ctx, case, outcome);
                    }
                    Err(e) => {
                        // The case keeps the decision for the next pass
                        outcome
                            .errors
                            .push(ReconcileError::external("correlate_account", account.key.as_str(), e));
                        outcome.pending(case, SubjectEvent::Pending);
                    }
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::memory::MemoryStore;
    use crate::review::ORPHAN_ACCOUNT;
    use chrono::TimeZone;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn create_test_engine() -> ReconciliationEngine {
        let config = ReconcileConfig::new("HR", vec!["uid".to_string()]).with_reviewers(&["alice"]);
        ReconciliationEngine::new(config).unwrap()
    }

    /// Two resolved identities and one LDAP account close to `jdoe`
    fn create_test_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .add_reviewer(Record::new("alice").with_attribute("email", "alice@example.com"))
            .unwrap();
        store
            .add_records(vec![
                Record::new("jdoe").with_attribute("uid", "jdoe"),
                Record::new("asmith").with_attribute("uid", "asmith"),
            ])
            .unwrap();
        store
            .save_outputs(&[
                MergedAccount::new("jdoe").with_status(AccountStatus::Initial),
                MergedAccount::new("asmith").with_status(AccountStatus::Initial),
            ])
            .unwrap();
        store
            .add_account(Record::new("jdoe1").with_source("LDAP").with_attribute("uid", "jdoe1"))
            .unwrap();
        store
    }

    fn run(engine: &ReconciliationEngine, store: &MemoryStore) -> PassReport {
        let report = engine
            .run_orphan_pass_at(Collaborators::single(store), store, test_time())
            .unwrap();
        store.save_orphan_outputs(&report.accounts).unwrap();
        report
    }

    fn orphan_form() -> String {
        orphan_form_name(&Record::new("jdoe1").with_source("LDAP"))
    }

    #[test]
    fn test_similar_account_opens_one_case() {
        let engine = create_test_engine();
        let store = create_test_store();

        let first = run(&engine, &store);
        let second = run(&engine, &store);

        assert_eq!(first.stats.cases_created, 1);
        assert_eq!(store.create_calls().unwrap(), 1);
        assert_eq!(second.stats.cases_assigned, 1);
        assert_eq!(second.account("alice").unwrap().reviews.len(), 1);
        assert!(second.account("jdoe1").is_none());
        assert!(store.notifications().unwrap()[0]
            .body
            .starts_with("An account without an owner"));
    }

    #[test]
    fn test_account_without_similar_identity_is_left_alone() {
        let engine = create_test_engine();
        let store = create_test_store();
        store
            .add_account(Record::new("svc-backup").with_source("LDAP").with_attribute("uid", "zzzzzzzz"))
            .unwrap();

        let report = run(&engine, &store);

        assert_eq!(report.stats.skipped, 1);
        assert!(report.account("svc-backup").is_none());
        assert_eq!(store.cases().unwrap().len(), 1);
    }

    #[test]
    fn test_matched_identity_correlates_account() {
        let engine = create_test_engine();
        let store = create_test_store();
        run(&engine, &store);
        store.decide(&orphan_form(), "jdoe", "alice").unwrap();

        let report = run(&engine, &store);

        let account = report.account("jdoe1").unwrap();
        assert!(account.has_status(AccountStatus::Correlated));
        assert!(account.history[0].ends_with("Assignment of jdoe1 from LDAP approved by alice"));
        assert_eq!(store.account_owner("jdoe1").unwrap().as_deref(), Some("jdoe"));
        assert!(store.case(&orphan_form()).unwrap().is_none());

        // settled accounts are carried, never reopened
        let again = run(&engine, &store);
        assert_eq!(again.account("jdoe1"), report.account("jdoe1"));
        assert_eq!(store.create_calls().unwrap(), 1);
    }

    #[test]
    fn test_confirmed_orphan_is_settled() {
        let engine = create_test_engine();
        let store = create_test_store();
        run(&engine, &store);
        store.decide(&orphan_form(), ORPHAN_ACCOUNT, "alice").unwrap();

        let report = run(&engine, &store);
        let again = run(&engine, &store);

        assert_eq!(report.stats.orphans_confirmed, 1);
        let account = again.account("jdoe1").unwrap();
        assert!(account.has_status(AccountStatus::Orphan));
        assert_eq!(account.history.len(), 1);
        assert!(account.history[0].ends_with("Orphan account confirmed by alice"));
        assert!(store.account_owner("jdoe1").unwrap().is_none());
        assert_eq!(store.create_calls().unwrap(), 1);
    }

    #[test]
    fn test_failed_account_correlation_keeps_case() {
        let engine = create_test_engine();
        let store = create_test_store();
        run(&engine, &store);
        store.decide(&orphan_form(), "jdoe", "alice").unwrap();
        store.fail_correlate_for("jdoe1").unwrap();

        let report = run(&engine, &store);

        assert!(matches!(
            report.errors.as_slice(),
            [ReconcileError::ExternalCall { operation: "correlate_account", .. }]
        ));
        assert!(report.account("jdoe1").is_none());
        assert!(store.case(&orphan_form()).unwrap().is_some());
    }

    #[test]
    fn test_orphan_pass_without_reviewers_is_fatal() {
        let config = ReconcileConfig::new("HR", vec!["uid".to_string()]).with_reviewers(&["ghost"]);
        let engine = ReconciliationEngine::new(config).unwrap();
        let store = create_test_store();

        let result = engine.run_orphan_pass_at(Collaborators::single(&store), &store, test_time());

        assert!(matches!(result, Err(ReconcileError::Configuration(_))));
        assert!(store.cases().unwrap().is_empty());
    }
}
