use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of domain row an automation workflow can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Staff,
    Participant,
    ComplianceDocument,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staff => "staff",
            Self::Participant => "participant",
            Self::ComplianceDocument => "compliance_document",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staff" => Ok(Self::Staff),
            "participant" => Ok(Self::Participant),
            "compliance_document" => Ok(Self::ComplianceDocument),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// A record-store row as seen by the automation engine. Read-only: the
/// engine never writes these back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub entity_id: i64,
    /// Hire date, creation date or expiry date depending on `entity_type`.
    pub reference_at: DateTime<Utc>,
    pub active: bool,
    pub recipient_email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub profile_complete: bool,
    /// Only set for compliance documents (e.g. "WWCC", "First Aid").
    pub document_name: Option<String>,
}

impl Entity {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Completed,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown audit outcome '{}'", other)),
        }
    }
}

/// One append-only automation log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub workflow_name: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub epoch_key: String,
    pub outcome: AuditOutcome,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a scheduler trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Idle,
    Running,
    Stopped,
}

/// Per-entity tallies for one workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub eligible: u32,
    pub completed: u32,
    pub failed: u32,
    /// Dispatched, but the ledger append could not be confirmed.
    pub unconfirmed: u32,
    /// Another execution recorded `completed` first.
    pub already_completed: u32,
    /// Not started because shutdown was requested.
    pub abandoned: u32,
}

/// Introspection view of one workflow trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusView {
    pub name: String,
    pub description: Option<String>,
    pub state: TriggerState,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<OutcomeCounts>,
    pub last_error: Option<String>,
    pub skipped_overlaps: u64,
}
