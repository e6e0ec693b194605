use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::entities::{AccountStatus, MergedAccount, Record};
use crate::notification::Notice;
use crate::review::{Decision, NewReviewCase, ReviewCase, ReviewState};
use crate::store::{AccountSource, IdentityStore, Notifier, ReviewCaseStore, ReviewerDirectory};

// Columns of a population CSV that are not attributes
const KEY_COLUMN: &str = "key";
const NAME_COLUMN: &str = "display_name";
const SOURCE_COLUMN: &str = "source";

/// Content hash of a record, used to skip unchanged rows on re-import
/// NOTE: This is for CHANGE DETECTION, not IDENTITY (identity = key)
pub fn compute_record_hash(record: &Record) -> String {
    let attributes: std::collections::BTreeMap<&String, &serde_json::Value> =
        record.attributes.iter().collect();
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}{}{}{}",
        record.key,
        record.display_name,
        record.source,
        serde_json::json!(attributes)
    ));
    format!("{:x}", hasher.finalize())
}

/// Event for audit trail ("Every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Population (one row per record key, attributes as JSON)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            key TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            source TEXT NOT NULL,
            attributes TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            imported_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS correlations (
            subject_key TEXT PRIMARY KEY,
            target_key TEXT NOT NULL,
            correlated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Authoritative view (output of the last completed pass)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            display_name TEXT,
            source TEXT,
            history TEXT NOT NULL,
            status TEXT NOT NULL,
            reviews TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Accounts on other sources, and the view of the orphan pass
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS external_accounts (
            key TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            source TEXT NOT NULL,
            attributes TEXT NOT NULL,
            owner_key TEXT,
            imported_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS orphan_outputs (
            id TEXT PRIMARY KEY,
            display_name TEXT,
            source TEXT,
            history TEXT NOT NULL,
            status TEXT NOT NULL,
            reviews TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Review cases (decision kept raw, decoded on read)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS review_cases (
            case_ref TEXT PRIMARY KEY,
            form_name TEXT UNIQUE NOT NULL,
            subject_key TEXT NOT NULL,
            candidates TEXT NOT NULL,
            reviewers TEXT NOT NULL,
            state TEXT NOT NULL,
            decision TEXT,
            decided_by TEXT,
            expiry TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reviewer_groups (
            group_name TEXT NOT NULL,
            member_key TEXT NOT NULL,
            PRIMARY KEY (group_name, member_key)
        )",
        [],
    )?;

    // Outbox: a mail relay drains this table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recipients TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            queued_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Load a population CSV: `key,display_name,source,<attribute>...`
///
/// Every column other than the three fixed ones becomes an attribute.
/// Empty cells are treated as a missing attribute.
pub fn load_population_csv(csv_path: &Path) -> Result<Vec<Record>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file {}", csv_path.display()))?;
    let headers = rdr.headers().context("Failed to read CSV header")?.clone();

    let key_index = headers
        .iter()
        .position(|h| h == KEY_COLUMN)
        .ok_or_else(|| anyhow!("CSV has no '{KEY_COLUMN}' column"))?;

    let mut records = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let row = result.with_context(|| format!("Failed to read CSV row {}", line + 2))?;
        let key = row.get(key_index).unwrap_or_default().trim();
        if key.is_empty() {
            bail!("CSV row {} has an empty key", line + 2);
        }

        let mut record = Record::new(key);
        for (header, value) in headers.iter().zip(row.iter()) {
            match header {
                KEY_COLUMN => {}
                NAME_COLUMN if !value.is_empty() => record.display_name = value.to_string(),
                SOURCE_COLUMN => record.source = value.to_string(),
                NAME_COLUMN => {}
                _ if value.is_empty() => {}
                attribute => {
                    record = record.with_attribute(attribute, value);
                }
            }
        }
        records.push(record);
    }

    Ok(records)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            Ok(Event {
                event_id,
                timestamp: parse_time(&timestamp)?,
                event_type,
                entity_type,
                entity_id,
                data: serde_json::from_str(&data).context("Invalid event data")?,
                actor,
            })
        })
        .collect()
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("Invalid timestamp '{text}'"))?
        .with_timezone(&Utc))
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Every collaborator role backed by one SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const ACTOR: &str = "identity-reconcile";
const ACCOUNTS_TABLE: &str = "accounts";
const ORPHAN_OUTPUTS_TABLE: &str = "orphan_outputs";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("database lock poisoned"))
    }

    /// Upsert records by key; unchanged rows are left alone
    pub fn import_population(&self, records: &[Record]) -> Result<ImportStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stats = ImportStats::default();
        let now = Utc::now().to_rfc3339();

        for record in records {
            let hash = compute_record_hash(record);
            let existing: Option<String> = tx
                .query_row(
                    "SELECT content_hash FROM records WHERE key = ?1",
                    params![record.key],
                    |row| row.get(0),
                )
                .optional()?;

            if existing.as_deref() == Some(hash.as_str()) {
                stats.unchanged += 1;
                continue;
            }

            tx.execute(
                "INSERT INTO records (key, display_name, source, attributes, content_hash, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    display_name = excluded.display_name,
                    source = excluded.source,
                    attributes = excluded.attributes,
                    content_hash = excluded.content_hash,
                    imported_at = excluded.imported_at",
                params![
                    record.key,
                    record.display_name,
                    record.source,
                    serde_json::to_string(&record.attributes)?,
                    hash,
                    now,
                ],
            )?;

            if existing.is_some() {
                stats.updated += 1;
            } else {
                stats.inserted += 1;
            }
        }

        tx.commit()?;
        info!(
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "population_imported"
        );
        Ok(stats)
    }

    /// Replace the authoritative view with a pass's accounts
    pub fn save_outputs(&self, accounts: &[MergedAccount]) -> Result<()> {
        self.write_accounts(ACCOUNTS_TABLE, accounts)
    }

    /// Replace the orphan-account view with a pass's accounts
    pub fn save_orphan_outputs(&self, accounts: &[MergedAccount]) -> Result<()> {
        self.write_accounts(ORPHAN_OUTPUTS_TABLE, accounts)
    }

    fn write_accounts(&self, table: &str, accounts: &[MergedAccount]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(&format!("DELETE FROM {table}"), [])?;
        for account in accounts {
            tx.execute(
                &format!(
                    "INSERT INTO {table} (id, display_name, source, history, status, reviews, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    account.id,
                    account.display_name,
                    account.source,
                    serde_json::to_string(&account.history)?,
                    serde_json::to_string(&account.status)?,
                    serde_json::to_string(&account.reviews)?,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        debug!(table = table, accounts = accounts.len(), "outputs_saved");
        Ok(())
    }

    /// Upsert accounts of other sources; an owner already recorded is kept
    pub fn import_accounts(&self, records: &[Record]) -> Result<ImportStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stats = ImportStats::default();
        let now = Utc::now().to_rfc3339();

        for record in records {
            let attributes = serde_json::to_string(&record.attributes)?;
            let existing: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT display_name, source, attributes FROM external_accounts WHERE key = ?1",
                    params![record.key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match existing {
                Some((name, source, stored))
                    if name == record.display_name && source == record.source && stored == attributes =>
                {
                    stats.unchanged += 1;
                    continue;
                }
                Some(_) => stats.updated += 1,
                None => stats.inserted += 1,
            }

            tx.execute(
                "INSERT INTO external_accounts (key, display_name, source, attributes, owner_key, imported_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    display_name = excluded.display_name,
                    source = excluded.source,
                    attributes = excluded.attributes,
                    imported_at = excluded.imported_at",
                params![record.key, record.display_name, record.source, attributes, now],
            )?;
        }

        tx.commit()?;
        info!(
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "accounts_imported"
        );
        Ok(stats)
    }

    pub fn add_group_member(&self, group: &str, member_key: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO reviewer_groups (group_name, member_key) VALUES (?1, ?2)",
            params![group, member_key],
        )?;
        Ok(())
    }

    /// Record a reviewer's decision on an open case
    pub fn decide(&self, form_name: &str, raw_decision: &str, reviewer: &str) -> Result<()> {
        let case = self
            .find_case(form_name)?
            .ok_or_else(|| anyhow!("no review case named '{form_name}'"))?;
        if case.state.is_terminal() {
            bail!("review case '{form_name}' is already {}", case.state);
        }

        let conn = self.conn()?;
        conn.execute(
            "UPDATE review_cases SET state = ?1, decision = ?2, decided_by = ?3 WHERE form_name = ?4",
            params![ReviewState::Completed.as_str(), raw_decision, reviewer, form_name],
        )?;
        insert_event(
            &conn,
            &Event::new(
                "case_decided",
                "review_case",
                &case.case_ref,
                serde_json::json!({ "decision": raw_decision, "reviewer": reviewer }),
                reviewer,
            ),
        )?;
        Ok(())
    }

    pub fn cancel(&self, form_name: &str) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE review_cases SET state = ?1 WHERE form_name = ?2",
            params![ReviewState::Cancelled.as_str(), form_name],
        )?;
        if updated == 0 {
            bail!("no review case named '{form_name}'");
        }
        Ok(())
    }

    pub fn list_cases(&self) -> Result<Vec<ReviewCase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{CASE_SELECT} ORDER BY created_at, form_name"))?;
        let rows = stmt
            .query_map([], read_case_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CaseRow::into_case).collect()
    }

    pub fn list_accounts(&self) -> Result<Vec<MergedAccount>> {
        self.read_accounts(ACCOUNTS_TABLE)
    }

    fn read_accounts(&self, table: &str) -> Result<Vec<MergedAccount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, display_name, source, history, status, reviews FROM {table} ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, display_name, source, history, status, reviews)| {
                let status: BTreeSet<AccountStatus> = serde_json::from_str(&status)
                    .with_context(|| format!("Invalid status for account '{id}'"))?;
                Ok(MergedAccount {
                    display_name,
                    source,
                    history: serde_json::from_str(&history)
                        .with_context(|| format!("Invalid history for account '{id}'"))?,
                    status,
                    reviews: serde_json::from_str(&reviews)
                        .with_context(|| format!("Invalid reviews for account '{id}'"))?,
                    id,
                })
            })
            .collect()
    }

    /// Queued notices, oldest first
    pub fn outbox(&self) -> Result<Vec<Notice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT recipients, subject, body FROM notifications ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(recipients, subject, body)| {
                Ok(Notice {
                    recipients: serde_json::from_str(&recipients).context("Invalid recipients")?,
                    subject,
                    body,
                })
            })
            .collect()
    }

    /// Compare-and-set on a case's state; false when it was not in `from`
    fn transition(&self, case_ref: &str, from: ReviewState, to: ReviewState, event_type: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE review_cases SET state = ?1 WHERE case_ref = ?2 AND state = ?3",
            params![to.as_str(), case_ref, from.as_str()],
        )?;
        if updated > 0 {
            insert_event(
                &conn,
                &Event::new(event_type, "review_case", case_ref, serde_json::json!({}), ACTOR),
            )?;
        }
        Ok(updated > 0)
    }

    pub fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        get_events_for_entity(&conn, entity_type, entity_id)
    }

    fn load_records(conn: &Connection, sql: &str) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, display_name, source, attributes)| {
                let attributes: HashMap<String, serde_json::Value> = serde_json::from_str(&attributes)
                    .with_context(|| format!("Invalid attributes for record '{key}'"))?;
                Ok(Record {
                    key,
                    display_name,
                    source,
                    attributes,
                    resolved: false,
                })
            })
            .collect()
    }
}

// ============================================================================
// REVIEW CASE ROWS
// ============================================================================

const CASE_SELECT: &str = "SELECT case_ref, form_name, subject_key, candidates, reviewers, state,
        decision, decided_by, expiry, created_at FROM review_cases";

struct CaseRow {
    case_ref: String,
    form_name: String,
    subject_key: String,
    candidates: String,
    reviewers: String,
    state: String,
    decision: Option<String>,
    decided_by: Option<String>,
    expiry: String,
    created_at: String,
}

fn read_case_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaseRow> {
    Ok(CaseRow {
        case_ref: row.get(0)?,
        form_name: row.get(1)?,
        subject_key: row.get(2)?,
        candidates: row.get(3)?,
        reviewers: row.get(4)?,
        state: row.get(5)?,
        decision: row.get(6)?,
        decided_by: row.get(7)?,
        expiry: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl CaseRow {
    /// The raw decision is decoded here and nowhere else
    fn into_case(self) -> Result<ReviewCase> {
        let state: ReviewState = self
            .state
            .parse()
            .map_err(|e: String| anyhow!("{e} (case '{}')", self.form_name))?;
        Ok(ReviewCase {
            state,
            decision: self.decision.as_deref().and_then(Decision::decode),
            decided_by: self.decided_by.filter(|r| !r.trim().is_empty()),
            candidates: serde_json::from_str(&self.candidates)
                .with_context(|| format!("Invalid candidates for case '{}'", self.form_name))?,
            reviewers: serde_json::from_str(&self.reviewers)
                .with_context(|| format!("Invalid reviewers for case '{}'", self.form_name))?,
            expiry: parse_time(&self.expiry)?,
            created_at: parse_time(&self.created_at)?,
            case_ref: self.case_ref,
            form_name: self.form_name,
            subject_key: self.subject_key,
        })
    }
}

// ============================================================================
// COLLABORATOR ROLES
// ============================================================================

impl IdentityStore for SqliteStore {
    fn list_population(&self) -> Result<Vec<Record>> {
        let authoritative: HashSet<String> = self
            .list_accounts()?
            .into_iter()
            .filter(|a| a.is_authoritative())
            .map(|a| a.id)
            .collect();

        let conn = self.conn()?;
        let records = Self::load_records(
            &conn,
            "SELECT key, display_name, source, attributes FROM records
             WHERE key NOT IN (SELECT subject_key FROM correlations)
             ORDER BY rowid",
        )?;

        Ok(records
            .into_iter()
            .map(|r| {
                let resolved = authoritative.contains(&r.key);
                r.resolved(resolved)
            })
            .collect())
    }

    fn list_resolved_outputs(&self) -> Result<Vec<MergedAccount>> {
        self.list_accounts()
    }

    fn correlate(&self, subject_key: &str, target_key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO correlations (subject_key, target_key, correlated_at)
             VALUES (?1, ?2, ?3)",
            params![subject_key, target_key, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to correlate '{subject_key}'"))?;
        insert_event(
            &conn,
            &Event::new(
                "record_correlated",
                "record",
                subject_key,
                serde_json::json!({ "target": target_key }),
                ACTOR,
            ),
        )?;
        Ok(())
    }
}

impl AccountSource for SqliteStore {
    fn list_uncorrelated_accounts(&self) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        Self::load_records(
            &conn,
            "SELECT key, display_name, source, attributes FROM external_accounts
             WHERE owner_key IS NULL
             ORDER BY rowid",
        )
    }

    fn list_orphan_outputs(&self) -> Result<Vec<MergedAccount>> {
        self.read_accounts(ORPHAN_OUTPUTS_TABLE)
    }

    fn correlate_account(&self, account_key: &str, identity_key: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE external_accounts SET owner_key = ?1 WHERE key = ?2",
                params![identity_key, account_key],
            )
            .with_context(|| format!("Failed to correlate account '{account_key}'"))?;
        if updated == 0 {
            bail!("no account '{account_key}'");
        }
        insert_event(
            &conn,
            &Event::new(
                "account_correlated",
                "account",
                account_key,
                serde_json::json!({ "identity": identity_key }),
                ACTOR,
            ),
        )?;
        Ok(())
    }
}

impl ReviewCaseStore for SqliteStore {
    fn find_case(&self, form_name: &str) -> Result<Option<ReviewCase>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("{CASE_SELECT} WHERE form_name = ?1"),
                params![form_name],
                read_case_row,
            )
            .optional()?;
        row.map(CaseRow::into_case).transpose()
    }

    fn create_case(&self, case: NewReviewCase) -> Result<ReviewCase> {
        let form_name = case.form_name.clone();
        let created = case.into_case(Utc::now());
        {
            let conn = self.conn()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO review_cases (
                    case_ref, form_name, subject_key, candidates, reviewers, state,
                    decision, decided_by, expiry, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?8)",
                params![
                    created.case_ref,
                    created.form_name,
                    created.subject_key,
                    serde_json::to_string(&created.candidates)?,
                    serde_json::to_string(&created.reviewers)?,
                    created.state.as_str(),
                    created.expiry.to_rfc3339(),
                    created.created_at.to_rfc3339(),
                ],
            )?;
            if inserted > 0 {
                insert_event(
                    &conn,
                    &Event::new(
                        "case_created",
                        "review_case",
                        &created.case_ref,
                        serde_json::json!({
                            "form_name": created.form_name,
                            "candidates": created.candidates.len(),
                        }),
                        ACTOR,
                    ),
                )?;
            }
        }

        self.find_case(&form_name)?
            .ok_or_else(|| anyhow!("review case '{form_name}' vanished after create"))
    }

    fn mark_assigned(&self, case_ref: &str) -> Result<bool> {
        self.transition(case_ref, ReviewState::Created, ReviewState::Assigned, "case_assigned")
    }

    fn release_assignment(&self, case_ref: &str) -> Result<bool> {
        self.transition(case_ref, ReviewState::Assigned, ReviewState::Created, "case_released")
    }

    fn delete_case(&self, case_ref: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM review_cases WHERE case_ref = ?1", params![case_ref])?;
        insert_event(
            &conn,
            &Event::new("case_deleted", "review_case", case_ref, serde_json::json!({}), ACTOR),
        )?;
        Ok(())
    }
}

impl Notifier for SqliteStore {
    fn notify(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO notifications (recipients, subject, body, queued_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                serde_json::to_string(recipients)?,
                subject,
                body,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

impl ReviewerDirectory for SqliteStore {
    fn resolve_identities_by_keys(&self, keys: &[String]) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let all = Self::load_records(
            &conn,
            "SELECT key, display_name, source, attributes FROM records ORDER BY rowid",
        )?;
        Ok(keys
            .iter()
            .filter_map(|key| all.iter().find(|r| &r.key == key).cloned())
            .collect())
    }

    fn resolve_group_members(&self, group: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT member_key FROM reviewer_groups WHERE group_name = ?1 ORDER BY rowid",
        )?;
        let members = stmt
            .query_map(params![group], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if members.is_empty() {
            bail!("unknown reviewer group '{group}'");
        }
        Ok(members)
    }
}
