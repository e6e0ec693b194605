// Identity Reconciliation - Core Library
// Exposes all modules for use in the CLI, connector adapters, and tests

pub mod error;
pub mod config;
pub mod entities;       // Record + MergedAccount
pub mod similarity;     // Edit-distance scoring
pub mod matching;       // Exact / fuzzy classification
pub mod review;         // Review case state machine
pub mod merge;          // Account merge engine
pub mod store;          // Collaborator contracts
pub mod notification;
pub mod reconciliation; // Pass orchestrator (identity and orphan passes)
pub mod memory;
pub mod db;
pub mod schema;

// Re-export commonly used types
pub use error::ReconcileError;
pub use config::ReconcileConfig;
pub use entities::{history_entry, AccountRole, AccountStatus, MergedAccount, Record};
pub use similarity::{combined_score, score};
pub use matching::{
    find_exact_match, find_similar_matches,
    Classification, MatchCandidate, MatchClassifier, MatchStrategy,
};
pub use review::{
    case_reference, decode_decision, form_name, next_action,
    orphan_form_name,
    Decision, DecodedDecision, NewReviewCase, ReviewAction, ReviewCase, ReviewState,
    NEW_IDENTITY, ORPHAN_ACCOUNT,
};
pub use merge::{merge, AccountView};
pub use store::{
    AccountSource, Collaborators, IdentityStore, Notifier, ReviewCaseStore, ReviewerDirectory,
};
pub use notification::{reviewer_addresses, Notice};
pub use reconciliation::{
    CancellationToken, OutstandingReview, PassReport, PassStats, ReconciliationEngine,
};
pub use memory::MemoryStore;
pub use db::{
    compute_record_hash, load_population_csv, setup_database,
    Event, ImportStats, SqliteStore,
};
pub use schema::{account_schema, to_attributes, validate_attributes, AccountSchema, SchemaAttribute};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
