// Record Store - read-only candidate queries against the domain tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::error::StoreError;
use super::registry::WorkflowDefinition;
use ndis_shared::{Entity, EntityType};

/// Coarse pre-filter pushed down to the store. The eligibility predicate is
/// re-applied to every row returned, so this only has to be a superset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub entity_type: EntityType,
    /// Exclusive lower bound on the reference timestamp.
    pub reference_after: DateTime<Utc>,
    /// Inclusive upper bound on the reference timestamp.
    pub reference_until: DateTime<Utc>,
    pub incomplete_profiles_only: bool,
}

impl CandidateQuery {
    pub fn for_workflow(workflow: &WorkflowDefinition, now: DateTime<Utc>) -> Self {
        let (reference_after, reference_until) = workflow.window.reference_range(now);
        Self {
            entity_type: workflow.entity_type,
            reference_after,
            reference_until,
            incomplete_profiles_only: workflow.require_incomplete_profile,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        entity.entity_type == self.entity_type
            && entity.active
            && entity.reference_at > self.reference_after
            && entity.reference_at <= self.reference_until
            && !(self.incomplete_profiles_only && entity.profile_complete)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Active entities of one type whose reference timestamp is in range.
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Entity>, StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    entity_id: i64,
    reference_at: DateTime<Utc>,
    active: bool,
    email: Option<String>,
    first_name: String,
    last_name: String,
    profile_complete: bool,
    document_name: Option<String>,
}

impl EntityRow {
    fn into_entity(self, entity_type: EntityType) -> Entity {
        Entity {
            entity_type,
            entity_id: self.entity_id,
            reference_at: self.reference_at,
            active: self.active,
            recipient_email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            profile_complete: self.profile_complete,
            document_name: self.document_name,
        }
    }
}

const STAFF_CANDIDATES: &str = r#"
    SELECT
        s.id::bigint AS entity_id,
        (s.hire_date AT TIME ZONE 'UTC') AS reference_at,
        (s.status = 'active') AS active,
        u.email AS email,
        s.first_name,
        s.last_name,
        COALESCE(s.profile_completed, false) AS profile_complete,
        NULL::text AS document_name
    FROM staff s
    JOIN users u ON s.user_id = u.id
    WHERE s.status = 'active'
      AND (s.hire_date AT TIME ZONE 'UTC') > $1
      AND (s.hire_date AT TIME ZONE 'UTC') <= $2
      AND ($3 = false OR COALESCE(s.profile_completed, false) = false)
    ORDER BY s.id
"#;

const PARTICIPANT_CANDIDATES: &str = r#"
    SELECT
        p.id::bigint AS entity_id,
        (p.created_at AT TIME ZONE 'UTC') AS reference_at,
        (p.status = 'active') AS active,
        p.email AS email,
        p.first_name,
        p.last_name,
        true AS profile_complete,
        NULL::text AS document_name
    FROM participants p
    WHERE p.status = 'active'
      AND (p.created_at AT TIME ZONE 'UTC') > $1
      AND (p.created_at AT TIME ZONE 'UTC') <= $2
      AND $3 = false
    ORDER BY p.id
"#;

const COMPLIANCE_CANDIDATES: &str = r#"
    SELECT
        d.id::bigint AS entity_id,
        (d.expiry_date::timestamp AT TIME ZONE 'UTC') AS reference_at,
        (d.status = 'active' AND s.status = 'active') AS active,
        u.email AS email,
        s.first_name,
        s.last_name,
        true AS profile_complete,
        d.document_name
    FROM compliance_documents d
    JOIN staff s ON d.staff_id = s.id
    JOIN users u ON s.user_id = u.id
    WHERE d.status = 'active'
      AND s.status = 'active'
      AND (d.expiry_date::timestamp AT TIME ZONE 'UTC') > $1
      AND (d.expiry_date::timestamp AT TIME ZONE 'UTC') <= $2
      AND $3 = false
    ORDER BY d.id
"#;

/// Postgres-backed record store. Each query borrows one pooled connection for
/// a single statement.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Entity>, StoreError> {
        let sql = match query.entity_type {
            EntityType::Staff => STAFF_CANDIDATES,
            EntityType::Participant => PARTICIPANT_CANDIDATES,
            EntityType::ComplianceDocument => COMPLIANCE_CANDIDATES,
        };

        let rows: Vec<EntityRow> = sqlx::query_as(sql)
            .bind(query.reference_after)
            .bind(query.reference_until)
            .bind(query.incomplete_profiles_only)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.into_entity(query.entity_type))
            .collect())
    }
}
