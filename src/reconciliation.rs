// ⚖️ Reconciliation Engine - one full pass over the population
//
//   population → partition → { classify, advance review cases } → merge → emit
//
// The engine is the only component with side effects (correlate, create and
// delete cases, notify). A pass can be re-run at any point: cases are found
// again by their deterministic form name, and output is only returned when
// the pass completes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

use rayon::prelude::*;

use crate::config::ReconcileConfig;
use crate::entities::{AccountRole, AccountStatus, MergedAccount, Record};
use crate::error::ReconcileError;
use crate::matching::{MatchCandidate, MatchClassifier};
use crate::merge::AccountView;
use crate::notification::{reviewer_addresses, Notice};
use crate::review::{decode_decision, form_name, next_action, Decision, NewReviewCase, ReviewAction, ReviewCase, ReviewState};
use crate::store::Collaborators;

mod orphan;

// ============================================================================
// PASS REPORT
// ============================================================================

/// A review case still waiting for a decision after this pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutstandingReview {
    pub case_ref: String,
    pub form_name: String,
    pub subject_key: String,
    pub state: ReviewState,
}

impl OutstandingReview {
    fn from_case(case: &ReviewCase) -> Self {
        OutstandingReview {
            case_ref: case.case_ref.clone(),
            form_name: case.form_name.clone(),
            subject_key: case.subject_key.clone(),
            state: case.state,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassStats {
    /// First run: every unresolved record was taken as-is
    pub bootstrap: bool,
    pub resolved: usize,
    pub unresolved: usize,
    pub auto_correlated: usize,
    pub cases_created: usize,
    pub cases_assigned: usize,
    pub cases_pending: usize,
    pub manual_correlated: usize,
    pub authorized: usize,
    pub cancelled: usize,
    pub unmatched: usize,
    /// Orphan accounts a reviewer confirmed as ownerless
    pub orphans_confirmed: usize,
    /// Orphan accounts with no similar identity, left alone
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: String,
    pub config_name: String,
    pub started_at: DateTime<Utc>,
    /// One account per id, ordered by id
    pub accounts: Vec<MergedAccount>,
    pub outstanding: Vec<OutstandingReview>,
    /// Non-fatal errors, already sent as one report
    #[serde(skip)]
    pub errors: Vec<ReconcileError>,
    pub stats: PassStats,
}

impl PassReport {
    pub fn account(&self, id: &str) -> Option<&MergedAccount> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Pass {} for {}: {} accounts, {} auto, {} manual, {} authorized, {} unmatched, {} cases created, {} outstanding, {} errors",
            self.pass_id,
            self.config_name,
            self.accounts.len(),
            self.stats.auto_correlated,
            self.stats.manual_correlated,
            self.stats.authorized,
            self.stats.unmatched,
            self.stats.cases_created,
            self.outstanding.len(),
            self.errors.len()
        )
    }
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// Shared flag checked between records; a cancelled pass emits nothing
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// PER-SUBJECT OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubjectEvent {
    AutoCorrelated,
    CaseCreated,
    CaseAssigned,
    Pending,
    ManualCorrelated,
    Authorized,
    Cancelled,
    Unmatched,
    OrphanConfirmed,
    Skipped,
}

#[derive(Debug, Default)]
struct SubjectOutcome {
    accounts: Vec<MergedAccount>,
    outstanding: Option<OutstandingReview>,
    errors: Vec<ReconcileError>,
    event: Option<SubjectEvent>,
}

impl SubjectOutcome {
    fn emit(&mut self, account: MergedAccount, event: SubjectEvent) {
        self.accounts.push(account);
        self.event = Some(event);
    }

    fn pending(&mut self, case: &ReviewCase, event: SubjectEvent) {
        if case.is_outstanding() {
            self.outstanding = Some(OutstandingReview::from_case(case));
        }
        self.event = Some(event);
    }
}

/// Everything resolved once per pass and shared by all subjects
struct PassContext<'a> {
    collaborators: Collaborators<'a>,
    candidates: &'a [Record],
    reviewers: &'a [Record],
    reviewer_keys: Vec<String>,
    /// Non-authoritative accounts of the last pass, rebuilt by this one
    unsettled: &'a HashMap<String, MergedAccount>,
    now: DateTime<Utc>,
}

impl PassContext<'_> {
    fn rebuild(&self, subject: &Record, status: AccountStatus) -> MergedAccount {
        rebuild_account(self.unsettled, subject, status)
    }
}

/// Account for a subject, started from what the last pass left for it
///
/// History and foreign tags carry over. `unmatched` and `reviewer` are
/// derived again every pass and never carried.
fn rebuild_account(
    unsettled: &HashMap<String, MergedAccount>,
    subject: &Record,
    status: AccountStatus,
) -> MergedAccount {
    let mut account = MergedAccount::from_record(subject, AccountRole::Subject).with_status(status);
    if let Some(prior) = unsettled.get(&subject.key) {
        account.history = prior.history.clone();
        account.status.extend(
            prior
                .status
                .iter()
                .filter(|s| !matches!(s, AccountStatus::Unmatched | AccountStatus::Reviewer))
                .cloned(),
        );
    }
    account
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    config: ReconcileConfig,
    classifier: MatchClassifier,
    cancellation: CancellationToken,
}

impl ReconciliationEngine {
    pub fn new(config: ReconcileConfig) -> Result<Self, ReconcileError> {
        config.validate()?;
        Ok(ReconciliationEngine {
            classifier: MatchClassifier::from_config(&config),
            config,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one pass now
    pub fn run_pass(&self, collaborators: Collaborators<'_>) -> Result<PassReport, ReconcileError> {
        self.run_pass_at(collaborators, Utc::now())
    }

    /// Run one pass with an explicit clock
    ///
    /// Fatal errors (no reviewers, unreachable identity store, cancellation)
    /// return Err and emit nothing. Every other error is collected into the
    /// report and sent once through the notifier.
    pub fn run_pass_at(
        &self,
        collaborators: Collaborators<'_>,
        now: DateTime<Utc>,
    ) -> Result<PassReport, ReconcileError> {
        let pass_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("reconcile.pass", pass_id = %pass_id, config = %self.config.name);
        let _guard = span.enter();

        let mut errors = Vec::new();
        let result = self.reconcile(collaborators, &pass_id, now, &mut errors);
        self.conclude(collaborators, &pass_id, now, result, errors)
    }

    /// Log how a pass ended; a fatal error is reported before it is returned
    fn conclude(
        &self,
        collaborators: Collaborators<'_>,
        pass_id: &str,
        now: DateTime<Utc>,
        result: Result<PassReport, ReconcileError>,
        mut errors: Vec<ReconcileError>,
    ) -> Result<PassReport, ReconcileError> {
        match result {
            Ok(report) => {
                info!(
                    accounts = report.accounts.len(),
                    outstanding = report.outstanding.len(),
                    errors = report.errors.len(),
                    "reconcile_pass_complete"
                );
                Ok(report)
            }
            Err(fatal) => {
                warn!(error = %fatal, "reconcile_pass_failed");
                if fatal != ReconcileError::Cancelled {
                    errors.push(fatal.clone());
                    self.report_errors(collaborators, pass_id, now, &errors);
                }
                Err(fatal)
            }
        }
    }

    fn reconcile(
        &self,
        collaborators: Collaborators<'_>,
        pass_id: &str,
        now: DateTime<Utc>,
        errors: &mut Vec<ReconcileError>,
    ) -> Result<PassReport, ReconcileError> {
        // 1. Reviewers
        let reviewers = self.resolve_reviewers(collaborators, errors)?;

        // 2. Population + partition
        let population = collaborators
            .identities
            .list_population()
            .map_err(|e| ReconcileError::Configuration(format!("cannot list population: {e:#}")))?;
        let prior = collaborators
            .identities
            .list_resolved_outputs()
            .map_err(|e| ReconcileError::Configuration(format!("cannot list resolved outputs: {e:#}")))?;

        let (resolved, unresolved): (Vec<Record>, Vec<Record>) =
            population.into_iter().partition(|r| r.resolved);

        // Authoritative accounts carry over as-is. The rest (unmatched and
        // reviewer-only) are rebuilt from this pass's outcomes, so a subject
        // that was correlated or authorized since loses its stale tags.
        let (carried, unsettled): (Vec<MergedAccount>, Vec<MergedAccount>) =
            prior.into_iter().partition(MergedAccount::is_authoritative);
        let unsettled: HashMap<String, MergedAccount> =
            unsettled.into_iter().map(|a| (a.id.clone(), a)).collect();

        info!(
            resolved = resolved.len(),
            unresolved = unresolved.len(),
            reviewers = reviewers.len(),
            "reconcile_pass_start"
        );

        let mut stats = PassStats {
            resolved: resolved.len(),
            unresolved: unresolved.len(),
            ..PassStats::default()
        };

        let mut view = AccountView::new();
        view.merge_all(carried);
        view.merge_all(
            reviewers
                .iter()
                .map(|r| MergedAccount::from_record(r, AccountRole::Reviewer)),
        );

        let mut outstanding = Vec::new();

        if resolved.is_empty() {
            // 3. First run: assume no duplicates
            stats.bootstrap = true;
            for record in &unresolved {
                self.check_cancelled()?;
                let mut account = rebuild_account(&unsettled, record, AccountStatus::Initial);
                account.record(now, "Found on first run");
                view.merge(account);
            }
            info!(records = unresolved.len(), "bootstrap_pass");
        } else {
            // 4. Classify and drive review cases
            let ctx = PassContext {
                collaborators,
                candidates: &resolved,
                reviewers: &reviewers,
                reviewer_keys: reviewers.iter().map(|r| r.key.clone()).collect(),
                unsettled: &unsettled,
                now,
            };

            let outcomes = self.process_all(&unresolved, |subject| self.process_subject(&ctx, subject))?;
            // 5. Merge in population order
            absorb(outcomes, &mut stats, errors, &mut outstanding, &mut view);
        }

        // 6. Reviewer workload, 7. consolidated error report
        Ok(self.finish(collaborators, pass_id, now, &reviewers, view, outstanding, errors, stats))
    }

    /// Hand outstanding cases to reviewers, report errors once, build the report
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        collaborators: Collaborators<'_>,
        pass_id: &str,
        now: DateTime<Utc>,
        reviewers: &[Record],
        mut view: AccountView,
        outstanding: Vec<OutstandingReview>,
        errors: &mut Vec<ReconcileError>,
        stats: PassStats,
    ) -> PassReport {
        let reviewer_keys: BTreeSet<String> = reviewers.iter().map(|r| r.key.clone()).collect();
        let case_refs: BTreeSet<String> = outstanding.iter().map(|o| o.case_ref.clone()).collect();
        view.assign_reviews(&reviewer_keys, &case_refs);

        if !errors.is_empty() {
            self.report_errors(collaborators, pass_id, now, errors);
        }

        PassReport {
            pass_id: pass_id.to_string(),
            config_name: self.config.name.clone(),
            started_at: now,
            accounts: view.into_accounts(),
            outstanding,
            errors: std::mem::take(errors),
            stats,
        }
    }

    fn check_cancelled(&self) -> Result<(), ReconcileError> {
        if self.cancellation.is_cancelled() {
            Err(ReconcileError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Process every subject, in parallel when configured
    ///
    /// Outcomes come back in input order whatever the worker count.
    fn process_all<F>(&self, subjects: &[Record], process: F) -> Result<Vec<SubjectOutcome>, ReconcileError>
    where
        F: Fn(&Record) -> SubjectOutcome + Sync,
    {
        let outcomes: Vec<Option<SubjectOutcome>> = if self.config.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .build()
                .map_err(|e| ReconcileError::Configuration(format!("cannot start worker pool: {e}")))?;
            pool.install(|| {
                subjects
                    .par_iter()
                    .map(|subject| self.process_unless_cancelled(subject, &process))
                    .collect()
            })
        } else {
            subjects
                .iter()
                .map(|subject| self.process_unless_cancelled(subject, &process))
                .collect()
        };

        self.check_cancelled()?;
        Ok(outcomes.into_iter().flatten().collect())
    }

    fn process_unless_cancelled<F>(&self, subject: &Record, process: &F) -> Option<SubjectOutcome>
    where
        F: Fn(&Record) -> SubjectOutcome,
    {
        if self.cancellation.is_cancelled() {
            return None;
        }
        Some(process(subject))
    }

    /// Classify one subject; its failures never reach other subjects
    fn process_subject(&self, ctx: &PassContext<'_>, subject: &Record) -> SubjectOutcome {
        let mut outcome = SubjectOutcome::default();
        if let Err(err) = self.drive_subject(ctx, subject, &mut outcome) {
            warn!(subject = %subject.key, error = %err, "subject_failed");
            outcome.errors.push(err);
        }
        keep_waiting_account(ctx, subject, &mut outcome);
        outcome
    }

    fn drive_subject(
        &self,
        ctx: &PassContext<'_>,
        subject: &Record,
        outcome: &mut SubjectOutcome,
    ) -> Result<(), ReconcileError> {
        if subject.key.trim().is_empty() {
            return Err(ReconcileError::classification(
                subject.name(),
                "record has no key",
            ));
        }

        let form = form_name(&subject.key);
        let existing = ctx
            .collaborators
            .cases
            .find_case(&form)
            .map_err(|e| ReconcileError::external("find_case", form.as_str(), e))?;

        // Identical wins over any open case
        if let Some(target) = self.classifier.find_exact_match(subject, ctx.candidates) {
            let correlated = self.auto_correlate(ctx, subject, target, outcome);
            if let (true, Some(stale)) = (correlated, existing) {
                info!(form = %stale.form_name, "deleting stale case after identical match");
                self.delete_case(ctx, &stale, outcome);
            }
            return Ok(());
        }

        match existing {
            Some(case) => {
                if let Some((decision, decided_by)) = self.advance_case(ctx, subject, &case, outcome) {
                    self.apply_decision(ctx, subject, &case, decision, &decided_by, outcome);
                }
            }
            None => self.open_case(ctx, subject, outcome),
        }

        Ok(())
    }

    /// Identical → correlate without a human
    fn auto_correlate(
        &self,
        ctx: &PassContext<'_>,
        subject: &Record,
        target: &Record,
        outcome: &mut SubjectOutcome,
    ) -> bool {
        match ctx.collaborators.identities.correlate(&subject.key, &target.key) {
            Ok(()) => {
                info!(subject = %subject.key, target = %target.key, "identical_match_correlated");
                outcome.emit(
                    MergedAccount::from_record(target, AccountRole::Subject)
                        .with_status(AccountStatus::Auto)
                        .with_entry(ctx.now, &format!("Identical match found for {}", subject.name())),
                    SubjectEvent::AutoCorrelated,
                );
                true
            }
            Err(e) => {
                outcome
                    .errors
                    .push(ReconcileError::external("correlate", subject.key.as_str(), e));
                self.leave_unmatched(ctx, subject, "Automatic correlation failed", outcome);
                false
            }
        }
    }

    /// Absent → Created, or unmatched when nothing is similar enough
    fn open_case(&self, ctx: &PassContext<'_>, subject: &Record, outcome: &mut SubjectOutcome) {
        let similar = self.classifier.find_similar_matches(subject, ctx.candidates);
        if similar.is_empty() {
            debug!(subject = %subject.key, "no_match");
            self.leave_unmatched(ctx, subject, "No match found", outcome);
            return;
        }

        if !self.request_review(ctx, form_name(&subject.key), subject, similar, outcome) {
            self.leave_unmatched(ctx, subject, "Review case could not be created", outcome);
        }
    }

    /// Absent → Created; false when the case store refused it
    fn request_review(
        &self,
        ctx: &PassContext<'_>,
        form: String,
        subject: &Record,
        similar: Vec<MatchCandidate>,
        outcome: &mut SubjectOutcome,
    ) -> bool {
        let request = NewReviewCase {
            form_name: form.clone(),
            subject_key: subject.key.clone(),
            candidates: similar.into_iter().map(|m| m.record).collect(),
            reviewers: ctx.reviewer_keys.clone(),
            expiry: ctx.now + Duration::days(i64::from(self.config.expiration_days)),
        };

        match ctx.collaborators.cases.create_case(request) {
            Ok(case) => {
                info!(
                    form = %case.form_name,
                    candidates = case.candidates.len(),
                    "review_case_created"
                );
                outcome.pending(&case, SubjectEvent::CaseCreated);
                true
            }
            Err(e) => {
                outcome
                    .errors
                    .push(ReconcileError::external("create_case", form, e));
                false
            }
        }
    }

    /// Move an existing case one step along its lifecycle
    ///
    /// Returns the decision of a completed case; applying it is up to the
    /// caller.
    fn advance_case(
        &self,
        ctx: &PassContext<'_>,
        subject: &Record,
        case: &ReviewCase,
        outcome: &mut SubjectOutcome,
    ) -> Option<(Decision, String)> {
        let action = match next_action(case) {
            Ok(action) => action,
            Err(err) => {
                outcome.errors.push(err);
                outcome.pending(case, SubjectEvent::Pending);
                return None;
            }
        };

        match action {
            ReviewAction::Notify => self.assign_case(ctx, subject, case, outcome),
            ReviewAction::Wait => {
                debug!(form = %case.form_name, state = %case.state, "no decision made yet");
                outcome.pending(case, SubjectEvent::Pending);
            }
            ReviewAction::Discard => {
                info!(form = %case.form_name, "review case was cancelled");
                outcome.event = Some(SubjectEvent::Cancelled);
                self.delete_case(ctx, case, outcome);
            }
            ReviewAction::Apply {
                decision,
                decided_by,
            } => return Some((decision, decided_by)),
        }
        None
    }

    /// Created → Assigned: claim the case, then send the one notice
    ///
    /// The claim is a compare-and-set, so a pass that loses it (another pass
    /// got there first, or a reviewer already acted) sends nothing. A notice
    /// that cannot be sent gives the claim back for the next pass.
    fn assign_case(
        &self,
        ctx: &PassContext<'_>,
        subject: &Record,
        case: &ReviewCase,
        outcome: &mut SubjectOutcome,
    ) {
        let recipients = reviewer_addresses(ctx.reviewers, &self.config.reviewer_email_attribute);
        if recipients.is_empty() {
            outcome.errors.push(ReconcileError::ExternalCall {
                operation: "notify",
                target: case.form_name.clone(),
                message: "no reviewer has a notification address".into(),
            });
            outcome.pending(case, SubjectEvent::Pending);
            return;
        }

        match ctx.collaborators.cases.mark_assigned(&case.case_ref) {
            Ok(true) => {}
            Ok(false) => {
                debug!(form = %case.form_name, "review case moved on before it was claimed");
                let current = ctx
                    .collaborators
                    .cases
                    .find_case(&case.form_name)
                    .ok()
                    .flatten();
                outcome.pending(current.as_ref().unwrap_or(case), SubjectEvent::Pending);
                return;
            }
            Err(e) => {
                outcome
                    .errors
                    .push(ReconcileError::external("mark_assigned", case.case_ref.as_str(), e));
                outcome.pending(case, SubjectEvent::Pending);
                return;
            }
        }

        let notice = Notice::assignment(case, subject, recipients);
        if let Err(e) = notice.send(ctx.collaborators.notifier) {
            outcome
                .errors
                .push(ReconcileError::external("notify", case.form_name.as_str(), e));
            if let Err(e) = ctx.collaborators.cases.release_assignment(&case.case_ref) {
                outcome.errors.push(ReconcileError::external(
                    "release_assignment",
                    case.case_ref.as_str(),
                    e,
                ));
            }
            outcome.pending(case, SubjectEvent::Pending);
            return;
        }

        info!(form = %case.form_name, recipients = notice.recipients.len(), "review_case_assigned");
        let mut assigned = case.clone();
        assigned.state = ReviewState::Assigned;
        outcome.pending(&assigned, SubjectEvent::CaseAssigned);
    }

    /// Completed: apply the reviewer's decision and retire the case
    fn apply_decision(
        &self,
        ctx: &PassContext<'_>,
        subject: &Record,
        case: &ReviewCase,
        decision: Decision,
        decided_by: &str,
        outcome: &mut SubjectOutcome,
    ) {
        let reviewer = match self.lookup_reviewer(ctx, decided_by) {
            Ok(reviewer) => reviewer,
            Err(err) => {
                outcome.errors.push(err);
                outcome.pending(case, SubjectEvent::Pending);
                return;
            }
        };

        let decoded = match decode_decision(case, decision, decided_by, reviewer.as_ref(), subject) {
            Ok(decoded) => decoded,
            Err(err) => {
                // Left pending rather than attributed to nobody
                outcome.errors.push(err);
                outcome.pending(case, SubjectEvent::Pending);
                return;
            }
        };

        match &decoded.decision {
            Decision::NewIdentity => {
                info!(subject = %subject.key, reviewer = %decoded.reviewer_name, "new_identity_authorized");
                let mut account = ctx.rebuild(subject, AccountStatus::Authorized);
                account.record(ctx.now, &decoded.message);
                outcome.emit(account, SubjectEvent::Authorized);
                self.delete_case(ctx, case, outcome);
            }
            Decision::MatchedKey(key) => {
                let Some(target) = ctx.candidates.iter().find(|c| &c.key == key) else {
                    // The population moved on; start over next pass
                    outcome.errors.push(ReconcileError::classification(
                        subject.key.as_str(),
                        format!("selected identity '{key}' is no longer resolved"),
                    ));
                    self.leave_unmatched(ctx, subject, "Selected identity no longer available", outcome);
                    self.delete_case(ctx, case, outcome);
                    return;
                };

                match ctx.collaborators.identities.correlate(&subject.key, &target.key) {
                    Ok(()) => {
                        info!(subject = %subject.key, target = %target.key, "manual_match_correlated");
                        outcome.emit(
                            MergedAccount::from_record(target, AccountRole::Subject)
                                .with_status(AccountStatus::Manual)
                                .with_entry(ctx.now, &decoded.message),
                            SubjectEvent::ManualCorrelated,
                        );
                        self.delete_case(ctx, case, outcome);
                    }
                    Err(e) => {
                        // Keep the case so the decision is applied next pass
                        outcome
                            .errors
                            .push(ReconcileError::external("correlate", subject.key.as_str(), e));
                        self.leave_unmatched(ctx, subject, "Approved correlation failed", outcome);
                    }
                }
            }
        }
    }

    /// Configured reviewers first, then the directory
    fn lookup_reviewer(&self, ctx: &PassContext<'_>, key: &str) -> Result<Option<Record>, ReconcileError> {
        if let Some(known) = ctx.reviewers.iter().find(|r| r.key == key) {
            return Ok(Some(known.clone()));
        }

        let found = ctx
            .collaborators
            .directory
            .resolve_identities_by_keys(&[key.to_string()])
            .map_err(|e| ReconcileError::external("resolve_identities_by_keys", key, e))?;
        Ok(found.into_iter().find(|r| r.key == key))
    }

    /// Terminal cases are deleted; a failed delete is only reported
    fn delete_case(&self, ctx: &PassContext<'_>, case: &ReviewCase, outcome: &mut SubjectOutcome) {
        match ctx.collaborators.cases.delete_case(&case.case_ref) {
            Ok(()) => debug!(form = %case.form_name, "review_case_deleted"),
            Err(e) => {
                warn!(form = %case.form_name, error = %e, "review_case_delete_failed");
                outcome
                    .errors
                    .push(ReconcileError::external("delete_case", case.case_ref.as_str(), e));
            }
        }
    }

    /// Surface the subject as unmatched instead of letting it vanish
    ///
    /// The history line is only written when the subject was not already
    /// unmatched on the last pass.
    fn leave_unmatched(
        &self,
        ctx: &PassContext<'_>,
        subject: &Record,
        message: &str,
        outcome: &mut SubjectOutcome,
    ) {
        let mut account = ctx.rebuild(subject, AccountStatus::Unmatched);
        let already_unmatched = ctx
            .unsettled
            .get(&subject.key)
            .is_some_and(|prior| prior.has_status(AccountStatus::Unmatched));
        if !already_unmatched {
            account.record(ctx.now, message);
        }
        outcome.emit(account, SubjectEvent::Unmatched);
    }

    /// Individual reviewers plus group members, resolved to records
    fn resolve_reviewers(
        &self,
        collaborators: Collaborators<'_>,
        errors: &mut Vec<ReconcileError>,
    ) -> Result<Vec<Record>, ReconcileError> {
        let mut keys = self.config.reviewers.clone();
        for group in &self.config.reviewer_groups {
            match collaborators.directory.resolve_group_members(group) {
                Ok(members) => keys.extend(members),
                Err(e) => errors.push(ReconcileError::external(
                    "resolve_group_members",
                    group.as_str(),
                    e,
                )),
            }
        }

        let mut seen = HashSet::new();
        keys.retain(|k| seen.insert(k.clone()));

        let found = if keys.is_empty() {
            Vec::new()
        } else {
            collaborators
                .directory
                .resolve_identities_by_keys(&keys)
                .map_err(|e| ReconcileError::Configuration(format!("cannot resolve reviewers: {e:#}")))?
        };

        if found.is_empty() {
            return Err(ReconcileError::Configuration(
                "no reviewers were found; check the configured reviewer keys and groups".into(),
            ));
        }

        let missing: Vec<&str> = keys
            .iter()
            .filter(|k| !found.iter().any(|r| &r.key == *k))
            .map(|k| k.as_str())
            .collect();
        if !missing.is_empty() {
            warn!(missing = ?missing, "some reviewers were not found");
            errors.push(ReconcileError::ExternalCall {
                operation: "resolve_identities_by_keys",
                target: missing.join(", "),
                message: "some reviewers were not found".into(),
            });
        }

        Ok(found)
    }

    /// Best effort: a failed report is logged, never raised
    fn report_errors(
        &self,
        collaborators: Collaborators<'_>,
        pass_id: &str,
        now: DateTime<Utc>,
        errors: &[ReconcileError],
    ) {
        if self.config.error_recipients.is_empty() {
            warn!(errors = errors.len(), "no error recipients configured, report not sent");
            return;
        }

        let notice = Notice::error_report(
            &self.config.name,
            pass_id,
            now,
            errors,
            self.config.error_recipients.clone(),
        );
        if let Err(e) = notice.send(collaborators.notifier) {
            warn!(error = %e, "error report could not be sent");
        }
    }
}

/// A subject still waiting (open case, failed call) keeps last pass's account
///
/// Its account only goes away once the subject merged into another identity
/// or a new account for it was emitted.
fn keep_waiting_account(ctx: &PassContext<'_>, subject: &Record, outcome: &mut SubjectOutcome) {
    let merged = matches!(
        outcome.event,
        Some(SubjectEvent::AutoCorrelated | SubjectEvent::ManualCorrelated)
    );
    if merged || outcome.accounts.iter().any(|a| a.id == subject.key) {
        return;
    }
    if let Some(prior) = ctx.unsettled.get(&subject.key) {
        let mut kept = prior.clone();
        kept.status.remove(&AccountStatus::Reviewer);
        if !kept.status.is_empty() {
            outcome.accounts.push(kept);
        }
    }
}

/// Fold per-subject outcomes into the pass, in subject order
fn absorb(
    outcomes: Vec<SubjectOutcome>,
    stats: &mut PassStats,
    errors: &mut Vec<ReconcileError>,
    outstanding: &mut Vec<OutstandingReview>,
    view: &mut AccountView,
) {
    for outcome in outcomes {
        if let Some(event) = outcome.event {
            count_event(stats, event);
        }
        errors.extend(outcome.errors);
        outstanding.extend(outcome.outstanding);
        view.merge_all(outcome.accounts);
    }
}

fn count_event(stats: &mut PassStats, event: SubjectEvent) {
    match event {
        SubjectEvent::AutoCorrelated => stats.auto_correlated += 1,
        SubjectEvent::CaseCreated => stats.cases_created += 1,
        SubjectEvent::CaseAssigned => stats.cases_assigned += 1,
        SubjectEvent::Pending => stats.cases_pending += 1,
        SubjectEvent::ManualCorrelated => stats.manual_correlated += 1,
        SubjectEvent::Authorized => stats.authorized += 1,
        SubjectEvent::Cancelled => stats.cancelled += 1,
        SubjectEvent::Unmatched => stats.unmatched += 1,
        SubjectEvent::OrphanConfirmed => stats.orphans_confirmed += 1,
        SubjectEvent::Skipped => stats.skipped += 1,
    }
}

// ============================================================================
// TESTS
// ============================================================================
