// 🧬 Merge Engine - fold accounts into one view, one entry per id
//
// Merging an incoming account with an existing id:
//   status  -> set union (order of merges does not matter)
//   history -> appended in arrival order (a log, duplicates kept)
//   id      -> untouched

use std::collections::{BTreeMap, BTreeSet};

use crate::entities::MergedAccount;

/// Fold `incoming` into `existing`, keyed by account id
pub fn merge(existing: &mut BTreeMap<String, MergedAccount>, incoming: MergedAccount) {
    match existing.get_mut(&incoming.id) {
        Some(current) => {
            current.status.extend(incoming.status);
            current.history.extend(incoming.history);
            current.reviews.extend(incoming.reviews);
            if current.display_name.is_none() {
                current.display_name = incoming.display_name;
            }
            if current.source.is_none() {
                current.source = incoming.source;
            }
        }
        None => {
            existing.insert(incoming.id.clone(), incoming);
        }
    }
}

// ============================================================================
// ACCOUNT VIEW
// ============================================================================

/// The output mapping of one pass
#[derive(Debug, Clone, Default)]
pub struct AccountView {
    accounts: BTreeMap<String, MergedAccount>,
}

impl AccountView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, incoming: MergedAccount) {
        merge(&mut self.accounts, incoming);
    }

    pub fn merge_all<I>(&mut self, incoming: I)
    where
        I: IntoIterator<Item = MergedAccount>,
    {
        for account in incoming {
            self.merge(account);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.accounts.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&MergedAccount> {
        self.accounts.get(id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Replace reviewer workloads with this pass's outstanding cases
    ///
    /// Accounts of this pass's reviewers get exactly `outstanding`;
    /// every other account is cleared.
    pub fn assign_reviews(&mut self, reviewer_keys: &BTreeSet<String>, outstanding: &BTreeSet<String>) {
        for account in self.accounts.values_mut() {
            if reviewer_keys.contains(&account.id) {
                account.reviews = outstanding.clone();
            } else {
                account.reviews.clear();
            }
        }
    }

    /// Accounts ordered by id
    pub fn into_accounts(self) -> Vec<MergedAccount> {
        self.accounts.into_values().collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::AccountStatus;

    fn account(id: &str, status: AccountStatus, entry: &str) -> MergedAccount {
        let mut account = MergedAccount::new(id).with_status(status);
        account.history.push(entry.to_string());
        account
    }

    #[test]
    fn test_insert_new_id() {
        let mut view = AccountView::new();
        view.merge(account("jdoe", AccountStatus::Initial, "first"));
        view.merge(account("asmith", AccountStatus::Initial, "first"));

        assert_eq!(view.len(), 2);
        let ids: Vec<String> = view.into_accounts().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["asmith", "jdoe"]);
    }

    #[test]
    fn test_same_id_unions_status_and_appends_history() {
        let mut view = AccountView::new();
        view.merge(account("jdoe", AccountStatus::Initial, "first"));
        view.merge(account("jdoe", AccountStatus::Auto, "second"));

        let merged = view.get("jdoe").unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(merged.id, "jdoe");
        assert!(merged.has_status(AccountStatus::Initial));
        assert!(merged.has_status(AccountStatus::Auto));
        assert_eq!(merged.history, vec!["first", "second"]);
    }

    #[test]
    fn test_merge_twice_is_idempotent_for_status_not_history() {
        // The status set behaves like a set, the history like a log.
        let incoming = account("jdoe", AccountStatus::Manual, "approved");

        let mut once = AccountView::new();
        once.merge(account("jdoe", AccountStatus::Initial, "first"));
        once.merge(incoming.clone());

        let mut twice = once.clone();
        twice.merge(incoming);

        let once = once.get("jdoe").unwrap();
        let twice = twice.get("jdoe").unwrap();
        assert_eq!(once.status, twice.status);
        assert_eq!(once.history, vec!["first", "approved"]);
        assert_eq!(twice.history, vec!["first", "approved", "approved"]);
    }

    #[test]
    fn test_status_order_insensitive_history_order_sensitive() {
        let a = account("jdoe", AccountStatus::Initial, "a");
        let b = account("jdoe", AccountStatus::Auto, "b");
        let c = account("jdoe", AccountStatus::Manual, "c");

        let mut forward = AccountView::new();
        forward.merge_all(vec![a.clone(), b.clone(), c.clone()]);
        let mut backward = AccountView::new();
        backward.merge_all(vec![c, b, a]);

        let forward = forward.get("jdoe").unwrap();
        let backward = backward.get("jdoe").unwrap();
        assert_eq!(forward.status, backward.status);
        assert_eq!(forward.history, vec!["a", "b", "c"]);
        assert_eq!(backward.history, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_keeps_first_display_name() {
        let mut first = MergedAccount::new("jdoe");
        first.display_name = Some("John Doe".into());
        let mut second = MergedAccount::new("jdoe");
        second.display_name = Some("J. Doe".into());
        second.source = Some("HR".into());

        let mut view = AccountView::new();
        view.merge(first);
        view.merge(second);

        let merged = view.get("jdoe").unwrap();
        assert_eq!(merged.display_name.as_deref(), Some("John Doe"));
        assert_eq!(merged.source.as_deref(), Some("HR"));
    }

    #[test]
    fn test_assign_reviews_only_to_reviewers() {
        let mut stale = account("jdoe", AccountStatus::Initial, "first");
        stale.reviews.insert("old-case".into());

        let mut view = AccountView::new();
        view.merge(stale);
        view.merge(MergedAccount::new("alice").with_status(AccountStatus::Reviewer));
        view.merge(account("bob", AccountStatus::Initial, "first"));
        // tagged by an earlier pass, no longer configured
        view.merge(MergedAccount::new("carol").with_status(AccountStatus::Reviewer));

        let reviewers: BTreeSet<String> = ["alice", "bob"].iter().map(|s| s.to_string()).collect();
        let outstanding: BTreeSet<String> = ["case-1", "case-2"].iter().map(|s| s.to_string()).collect();
        view.assign_reviews(&reviewers, &outstanding);

        assert_eq!(view.get("alice").unwrap().reviews, outstanding);
        assert_eq!(view.get("bob").unwrap().reviews, outstanding);
        assert!(view.get("jdoe").unwrap().reviews.is_empty());
        assert!(view.get("carol").unwrap().reviews.is_empty());
    }
}
