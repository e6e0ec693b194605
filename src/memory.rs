// 🧪 In-Memory Store - every collaborator role behind one Mutex
//
// Used by tests and by embedders that keep their population in memory.
// Failure switches let a caller exercise each error path of a pass.

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::entities::{MergedAccount, Record};
use crate::notification::Notice;
use crate::review::{Decision, NewReviewCase, ReviewCase, ReviewState};
use crate::store::{AccountSource, IdentityStore, Notifier, ReviewCaseStore, ReviewerDirectory};

#[derive(Debug, Default)]
struct MemoryState {
    population: Vec<Record>,
    /// subject key -> target key
    correlations: HashMap<String, String>,
    outputs: BTreeMap<String, MergedAccount>,
    /// Accounts on other sources, with the identity that owns them
    accounts: Vec<(Record, Option<String>)>,
    orphan_outputs: BTreeMap<String, MergedAccount>,
    /// form name -> case
    cases: BTreeMap<String, ReviewCase>,
    directory: Vec<Record>,
    groups: HashMap<String, Vec<String>>,
    sent: Vec<Notice>,

    fail_correlate: HashSet<String>,
    fail_creates: bool,
    fail_deletes: bool,
    fail_notify: bool,
    create_calls: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    // ========================================================================
    // SETUP
    // ========================================================================

    pub fn add_record(&self, record: Record) -> Result<()> {
        self.lock()?.population.push(record);
        Ok(())
    }

    pub fn add_records<I>(&self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        self.lock()?.population.extend(records);
        Ok(())
    }

    /// Account on another source, not yet owned by any identity
    pub fn add_account(&self, record: Record) -> Result<()> {
        self.lock()?.accounts.push((record, None));
        Ok(())
    }

    /// Reviewer known to the directory but not part of the population
    pub fn add_reviewer(&self, record: Record) -> Result<()> {
        self.lock()?.directory.push(record);
        Ok(())
    }

    pub fn add_group(&self, group: &str, members: &[&str]) -> Result<()> {
        self.lock()?
            .groups
            .insert(group.to_string(), members.iter().map(|m| m.to_string()).collect());
        Ok(())
    }

    /// Replace the authoritative view with a pass's accounts
    pub fn save_outputs(&self, accounts: &[MergedAccount]) -> Result<()> {
        let mut state = self.lock()?;
        state.outputs = accounts
            .iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect();
        Ok(())
    }

    /// Replace the orphan-account view with a pass's accounts
    pub fn save_orphan_outputs(&self, accounts: &[MergedAccount]) -> Result<()> {
        let mut state = self.lock()?;
        state.orphan_outputs = accounts
            .iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect();
        Ok(())
    }

    // ========================================================================
    // REVIEWER SIDE
    // ========================================================================

    /// Record a reviewer's decision on an open case
    pub fn decide(&self, form_name: &str, raw_decision: &str, reviewer: &str) -> Result<()> {
        let mut state = self.lock()?;
        let case = state
            .cases
            .get_mut(form_name)
            .ok_or_else(|| anyhow!("no review case named '{form_name}'"))?;
        if case.state.is_terminal() {
            bail!("review case '{form_name}' is already {}", case.state);
        }
        case.state = ReviewState::Completed;
        case.decision = Decision::decode(raw_decision);
        case.decided_by = Some(reviewer.to_string());
        Ok(())
    }

    pub fn set_in_progress(&self, form_name: &str) -> Result<()> {
        self.set_state(form_name, ReviewState::InProgress)
    }

    pub fn cancel(&self, form_name: &str) -> Result<()> {
        self.set_state(form_name, ReviewState::Cancelled)
    }

    fn set_state(&self, form_name: &str, new_state: ReviewState) -> Result<()> {
        let mut state = self.lock()?;
        let case = state
            .cases
            .get_mut(form_name)
            .ok_or_else(|| anyhow!("no review case named '{form_name}'"))?;
        case.state = new_state;
        Ok(())
    }

    /// Compare-and-set on a case's state; false when it was not in `from`
    fn transition(&self, case_ref: &str, from: ReviewState, to: ReviewState) -> Result<bool> {
        let mut state = self.lock()?;
        match state.cases.values_mut().find(|c| c.case_ref == case_ref) {
            Some(case) if case.state == from => {
                case.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ========================================================================
    // FAILURE SWITCHES
    // ========================================================================

    /// Reject correlating this record or account
    pub fn fail_correlate_for(&self, subject_key: &str) -> Result<()> {
        self.lock()?.fail_correlate.insert(subject_key.to_string());
        Ok(())
    }

    pub fn fail_creates(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_creates = fail;
        Ok(())
    }

    pub fn fail_deletes(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_deletes = fail;
        Ok(())
    }

    pub fn fail_notify(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_notify = fail;
        Ok(())
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn notifications(&self) -> Result<Vec<Notice>> {
        Ok(self.lock()?.sent.clone())
    }

    pub fn cases(&self) -> Result<Vec<ReviewCase>> {
        Ok(self.lock()?.cases.values().cloned().collect())
    }

    pub fn case(&self, form_name: &str) -> Result<Option<ReviewCase>> {
        Ok(self.lock()?.cases.get(form_name).cloned())
    }

    /// Authoritative view saved by the last pass
    pub fn outputs(&self) -> Result<Vec<MergedAccount>> {
        Ok(self.lock()?.outputs.values().cloned().collect())
    }

    /// Identity an account was assigned to
    pub fn account_owner(&self, account_key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .accounts
            .iter()
            .find(|(a, _)| a.key == account_key)
            .and_then(|(_, owner)| owner.clone()))
    }

    pub fn correlation(&self, subject_key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.correlations.get(subject_key).cloned())
    }

    /// Times create_case stored a new case
    pub fn create_calls(&self) -> Result<usize> {
        Ok(self.lock()?.create_calls)
    }
}

// ============================================================================
// COLLABORATOR ROLES
// ============================================================================

impl IdentityStore for MemoryStore {
    fn list_population(&self) -> Result<Vec<Record>> {
        let state = self.lock()?;
        Ok(state
            .population
            .iter()
            .filter(|r| !state.correlations.contains_key(&r.key))
            .map(|r| {
                let resolved = state
                    .outputs
                    .get(&r.key)
                    .map(|a| a.is_authoritative())
                    .unwrap_or(false);
                r.clone().resolved(resolved)
            })
            .collect())
    }

    fn list_resolved_outputs(&self) -> Result<Vec<MergedAccount>> {
        Ok(self.lock()?.outputs.values().cloned().collect())
    }

    fn correlate(&self, subject_key: &str, target_key: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_correlate.contains(subject_key) {
            bail!("correlation of '{subject_key}' rejected");
        }
        state
            .correlations
            .insert(subject_key.to_string(), target_key.to_string());
        Ok(())
    }
}

impl AccountSource for MemoryStore {
    fn list_uncorrelated_accounts(&self) -> Result<Vec<Record>> {
        Ok(self
            .lock()?
            .accounts
            .iter()
            .filter(|(_, owner)| owner.is_none())
            .map(|(a, _)| a.clone())
            .collect())
    }

    fn list_orphan_outputs(&self) -> Result<Vec<MergedAccount>> {
        Ok(self.lock()?.orphan_outputs.values().cloned().collect())
    }

    fn correlate_account(&self, account_key: &str, identity_key: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_correlate.contains(account_key) {
            bail!("correlation of account '{account_key}' rejected");
        }
        let (_, owner) = state
            .accounts
            .iter_mut()
            .find(|(a, _)| a.key == account_key)
            .ok_or_else(|| anyhow!("no account '{account_key}'"))?;
        *owner = Some(identity_key.to_string());
        Ok(())
    }
}

impl ReviewCaseStore for MemoryStore {
    fn find_case(&self, form_name: &str) -> Result<Option<ReviewCase>> {
        Ok(self.lock()?.cases.get(form_name).cloned())
    }

    fn create_case(&self, case: NewReviewCase) -> Result<ReviewCase> {
        let mut state = self.lock()?;
        if state.fail_creates {
            bail!("case store unavailable");
        }
        if let Some(existing) = state.cases.get(&case.form_name) {
            return Ok(existing.clone());
        }
        let created = case.into_case(Utc::now());
        state.create_calls += 1;
        state.cases.insert(created.form_name.clone(), created.clone());
        Ok(created)
    }

    fn mark_assigned(&self, case_ref: &str) -> Result<bool> {
        self.transition(case_ref, ReviewState::Created, ReviewState::Assigned)
    }

    fn release_assignment(&self, case_ref: &str) -> Result<bool> {
        self.transition(case_ref, ReviewState::Assigned, ReviewState::Created)
    }

    fn delete_case(&self, case_ref: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_deletes {
            bail!("case store refused delete");
        }
        state.cases.retain(|_, c| c.case_ref != case_ref);
        Ok(())
    }
}

impl Notifier for MemoryStore {
    fn notify(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_notify {
            bail!("mail relay unavailable");
        }
        state.sent.push(Notice {
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

impl ReviewerDirectory for MemoryStore {
    fn resolve_identities_by_keys(&self, keys: &[String]) -> Result<Vec<Record>> {
        let state = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .directory
                    .iter()
                    .chain(state.population.iter())
                    .find(|r| &r.key == key)
                    .cloned()
            })
            .collect())
    }

    fn resolve_group_members(&self, group: &str) -> Result<Vec<String>> {
        self.lock()?
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| anyhow!("unknown reviewer group '{group}'"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
