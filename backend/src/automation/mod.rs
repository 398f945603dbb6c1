// Automation engine - time-window workflows over the record store

pub mod clock;
pub mod dispatcher;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod recurrence;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod templates;

pub use clock::{Clock, SystemClock};
pub use dispatcher::{DeliveryGateway, LogGateway};
pub use eligibility::{is_eligible, EligibilityEngine, EligibleEntity};
pub use error::{AutomationError, DispatchError, LedgerError, StoreError};
pub use executor::{ExecutionSettings, LedgerBias, WorkflowExecutor};
pub use ledger::{AuditLedger, LedgerKey, PendingAppends, PgAuditLedger};
pub use recurrence::Recurrence;
pub use registry::{EligibilityWindow, WindowPosition, WorkflowDefinition, WorkflowRegistry};
pub use scheduler::{FireDecision, Scheduler, SchedulerConfig};
pub use store::{CandidateQuery, PgRecordStore, RecordStore};
pub use templates::TemplateCatalog;
