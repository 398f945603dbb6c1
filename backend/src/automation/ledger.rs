// Audit Ledger - append-only automation history and per-key serialization

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::error::LedgerError;
use ndis_shared::{AuditEntry, AuditOutcome, EntityType};

const UNIQUE_VIOLATION: &str = "23505";

/// Dedup key: one `completed` entry at most per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub workflow: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub epoch: String,
}

impl LedgerKey {
    pub fn new(
        workflow: impl Into<String>,
        entity_type: EntityType,
        entity_id: i64,
        epoch: impl Into<String>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            entity_type,
            entity_id,
            epoch: epoch.into(),
        }
    }

    pub fn of(entry: &AuditEntry) -> Self {
        Self::new(
            entry.workflow_name.clone(),
            entry.entity_type,
            entry.entity_id,
            entry.epoch_key.clone(),
        )
    }

    pub fn entry(&self, outcome: AuditOutcome, details: impl Into<String>, at: DateTime<Utc>) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            workflow_name: self.workflow.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            epoch_key: self.epoch.clone(),
            outcome,
            details: details.into(),
            created_at: at,
        }
    }

    pub fn duplicate_error(&self) -> LedgerError {
        LedgerError::DuplicateCompleted {
            workflow: self.workflow.clone(),
            entity_type: self.entity_type.to_string(),
            entity_id: self.entity_id,
            epoch: self.epoch.clone(),
        }
    }
}

#[async_trait]
pub trait AuditLedger: Send + Sync {
    /// Durably append one entry. A second `completed` entry for the same key
    /// is rejected with `LedgerError::DuplicateCompleted`.
    async fn append(&self, entry: &AuditEntry) -> Result<(), LedgerError>;

    /// `Completed` if any completed entry exists for the key, otherwise the
    /// newest outcome, or `None` when the key has no history.
    async fn latest_outcome(&self, key: &LedgerKey) -> Result<Option<AuditOutcome>, LedgerError>;

    /// Newest entries for one workflow.
    async fn recent(&self, workflow: &str, limit: i64) -> Result<Vec<AuditEntry>, LedgerError>;
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    workflow_name: String,
    entity_type: String,
    entity_id: i64,
    epoch_key: String,
    outcome: String,
    details: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for AuditEntry {
    type Error = LedgerError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            id: row.id,
            workflow_name: row.workflow_name,
            entity_type: row.entity_type.parse().map_err(LedgerError::Corrupt)?,
            entity_id: row.entity_id,
            epoch_key: row.epoch_key,
            outcome: row.outcome.parse().map_err(LedgerError::Corrupt)?,
            details: row.details,
            created_at: row.created_at,
        })
    }
}

/// Ledger backed by the `automation_logs` table.
#[derive(Clone)]
pub struct PgAuditLedger {
    pool: PgPool,
}

impl PgAuditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLedger for PgAuditLedger {
    async fn append(&self, entry: &AuditEntry) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO automation_logs (
                id, workflow_name, entity_type, entity_id, epoch_key, outcome, details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.workflow_name)
        .bind(entry.entity_type.as_str())
        .bind(entry.entity_id)
        .bind(&entry.epoch_key)
        .bind(entry.outcome.as_str())
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(LedgerKey::of(entry).duplicate_error())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn latest_outcome(&self, key: &LedgerKey) -> Result<Option<AuditOutcome>, LedgerError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT outcome
            FROM automation_logs
            WHERE workflow_name = $1 AND entity_type = $2 AND entity_id = $3 AND epoch_key = $4
            ORDER BY (outcome = 'completed') DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(&key.workflow)
        .bind(key.entity_type.as_str())
        .bind(key.entity_id)
        .bind(&key.epoch)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(outcome,)| outcome.parse().map_err(LedgerError::Corrupt))
            .transpose()
    }

    async fn recent(&self, workflow: &str, limit: i64) -> Result<Vec<AuditEntry>, LedgerError> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_name, entity_type, entity_id, epoch_key, outcome, details, created_at
            FROM automation_logs
            WHERE workflow_name = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(workflow)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}

/// Async mutex per ledger key. Entries are dropped once no task holds or
/// waits on the lock.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<LedgerKey, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &LedgerKey) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(AsyncMutex::new(()));
                    locks.insert(key.clone(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    pub fn tracked(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, weak| weak.strong_count() > 0);
        locks.len()
    }
}

/// Entries whose notification went out but whose append was not confirmed.
/// Keys held here are treated as already notified until the append lands.
#[derive(Debug, Default)]
pub struct PendingAppends {
    entries: Mutex<HashMap<LedgerKey, AuditEntry>>,
}

impl PendingAppends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(LedgerKey::of(&entry), entry);
    }

    pub fn contains(&self, key: &LedgerKey) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(key)
    }

    pub fn release(&self, key: &LedgerKey) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Snapshot of held entries for one workflow.
    pub fn for_workflow(&self, workflow: &str) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|entry| entry.workflow_name == workflow)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
