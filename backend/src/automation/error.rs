// Automation error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Registration and scheduling errors. Only these can halt startup.
#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("Workflow already registered: {0}")]
    DuplicateWorkflow(String),
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),
    #[error("Workflow '{workflow}' references unknown template '{template}'")]
    UnknownTemplate { workflow: String, template: String },
    #[error("Invalid workflow '{workflow}': {reason}")]
    InvalidWorkflow { workflow: String, reason: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Scheduler has been shut down")]
    ShutDown,
}

pub type AutomationResult<T> = Result<T, AutomationError>;

/// Record store query failure. Abandons one firing, never the trigger.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Store query timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store query error: {0}")]
    Query(String),
}

/// Per-entity dispatch failure, folded into a `failed` audit entry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Gateway error: {0}")]
    Gateway(String),
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Template error: {0}")]
    Render(String),
    #[error("Entity has no recipient address")]
    MissingRecipient,
}

/// Ledger append/query failure.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Ledger operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Completed entry already recorded for {workflow}/{entity_type}/{entity_id} epoch {epoch}")]
    DuplicateCompleted {
        workflow: String,
        entity_type: String,
        entity_id: i64,
        epoch: String,
    },
    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}
