// Workflow Registry - the fixed catalogue of automation workflows
//
// Definitions are loaded once at startup (built-in catalogue or a JSON file)
// and never change while the process runs.

use chrono::{DateTime, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::error::{AutomationError, AutomationResult};
use super::recurrence::Recurrence;
use super::templates::{NotificationTemplate, TemplateCatalog};
use ndis_shared::{Entity, EntityType};

/// Where `now` falls relative to an entity's eligibility window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    Before,
    Open,
    /// Past the window end but inside the grace extension.
    CatchUp,
    Closed,
}

impl WindowPosition {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Open | Self::CatchUp)
    }
}

/// Half-open window `[reference + start, reference + end)` plus a grace
/// extension after `end`. Offsets may be negative (e.g. before an expiry date).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WindowHours", into = "WindowHours")]
pub struct EligibilityWindow {
    start: Duration,
    end: Duration,
    grace: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowHours {
    start_hours: i64,
    end_hours: i64,
    #[serde(default)]
    grace_hours: i64,
}

impl TryFrom<WindowHours> for EligibilityWindow {
    type Error = String;

    fn try_from(raw: WindowHours) -> Result<Self, Self::Error> {
        let hours = |value: i64| {
            Duration::try_hours(value).ok_or_else(|| format!("window offset of {} hours is out of range", value))
        };
        Self::new(hours(raw.start_hours)?, hours(raw.end_hours)?, hours(raw.grace_hours)?)
    }
}

impl From<EligibilityWindow> for WindowHours {
    fn from(window: EligibilityWindow) -> Self {
        Self {
            start_hours: window.start.num_hours(),
            end_hours: window.end.num_hours(),
            grace_hours: window.grace.num_hours(),
        }
    }
}

/// Largest offset, in either direction, a window may place from its reference.
pub const MAX_WINDOW_OFFSET_DAYS: i64 = 36_525;

impl EligibilityWindow {
    pub fn new(start: Duration, end: Duration, grace: Duration) -> Result<Self, String> {
        if end <= start {
            return Err("window end must be after window start".to_string());
        }
        if grace < Duration::zero() {
            return Err("grace extension cannot be negative".to_string());
        }
        let limit = Duration::days(MAX_WINDOW_OFFSET_DAYS);
        let grace_ends = end.checked_add(&grace);
        if start.abs() > limit || end.abs() > limit || grace_ends.is_none_or(|t| t > limit) {
            return Err(format!(
                "window offsets must stay within {} days of the reference",
                MAX_WINDOW_OFFSET_DAYS
            ));
        }
        Ok(Self { start, end, grace })
    }

    /// Window of whole days with no grace extension.
    pub fn days(start: i64, end: i64) -> Result<Self, String> {
        let days = |value: i64| {
            Duration::try_days(value).ok_or_else(|| format!("window offset of {} days is out of range", value))
        };
        Self::new(days(start)?, days(end)?, Duration::zero())
    }

    pub fn with_grace(self, grace: Duration) -> Result<Self, String> {
        Self::new(self.start, self.end, grace)
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn end(&self) -> Duration {
        self.end
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn classify(&self, reference: DateTime<Utc>, now: DateTime<Utc>) -> WindowPosition {
        let opens = shift(reference, self.start);
        let closes = shift(reference, self.end);
        let grace_ends = shift(closes, self.grace);

        if now < opens {
            WindowPosition::Before
        } else if now < closes {
            WindowPosition::Open
        } else if now < grace_ends {
            WindowPosition::CatchUp
        } else {
            WindowPosition::Closed
        }
    }

    /// Reference-timestamp range that can be eligible at `now`:
    /// `(after, until]`, i.e. `now - end - grace < reference <= now - start`.
    pub fn reference_range(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (shift(now, -(self.end + self.grace)), shift(now, -self.start))
    }
}

/// `at + by`, saturating at the ends of the representable range.
fn shift(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(if by < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Dedup key scope for "already notified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochKind {
    /// One notification per entity, ever.
    #[default]
    Lifetime,
    /// One notification per distinct reference date (e.g. each expiry date).
    ReferenceDate,
}

impl EpochKind {
    pub fn key_for(&self, entity: &Entity) -> String {
        match self {
            Self::Lifetime => "lifetime".to_string(),
            Self::ReferenceDate => entity.reference_at.format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub entity_type: EntityType,
    pub recurrence: Recurrence,
    pub window: EligibilityWindow,
    #[serde(default)]
    pub epoch: EpochKind,
    /// Only staff whose profile is still incomplete qualify.
    #[serde(default)]
    pub require_incomplete_profile: bool,
    pub template: String,
}

impl WorkflowDefinition {
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        recurrence: Recurrence,
        window: EligibilityWindow,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            entity_type,
            recurrence,
            window,
            epoch: EpochKind::Lifetime,
            require_incomplete_profile: false,
            template: template.into(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn epoch(mut self, epoch: EpochKind) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn incomplete_profiles_only(mut self) -> Self {
        self.require_incomplete_profile = true;
        self
    }

    /// The pure eligibility predicate, minus audit history.
    pub fn window_position(&self, entity: &Entity, now: DateTime<Utc>) -> WindowPosition {
        if entity.entity_type != self.entity_type || !entity.active {
            return WindowPosition::Closed;
        }
        if self.require_incomplete_profile && entity.profile_complete {
            return WindowPosition::Closed;
        }
        self.window.classify(entity.reference_at, now)
    }
}

/// Shape of the registry configuration file.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default = "default_true")]
    include_builtin_templates: bool,
    #[serde(default)]
    templates: HashMap<String, NotificationTemplate>,
    workflows: Vec<WorkflowDefinition>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: Vec<Arc<WorkflowDefinition>>,
    templates: Arc<TemplateCatalog>,
}

impl WorkflowRegistry {
    pub fn new(templates: TemplateCatalog) -> Self {
        Self {
            workflows: Vec::new(),
            templates: Arc::new(templates),
        }
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> AutomationResult<()> {
        if self.get(&definition.name).is_some() {
            return Err(AutomationError::DuplicateWorkflow(definition.name));
        }
        if !self.templates.contains(&definition.template) {
            return Err(AutomationError::UnknownTemplate {
                workflow: definition.name,
                template: definition.template,
            });
        }
        definition
            .recurrence
            .validate()
            .map_err(|reason| AutomationError::InvalidWorkflow {
                workflow: definition.name.clone(),
                reason,
            })?;

        self.workflows.push(Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.workflows.iter().find(|w| w.name == name)
    }

    pub fn workflows(&self) -> &[Arc<WorkflowDefinition>] {
        &self.workflows
    }

    pub fn templates(&self) -> Arc<TemplateCatalog> {
        self.templates.clone()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn builtin() -> AutomationResult<Self> {
        let mut registry = Self::new(TemplateCatalog::builtin());
        let definitions = builtin_workflows()
            .map_err(|e| AutomationError::Config(format!("invalid built-in workflow: {}", e)))?;
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    pub fn from_json(json: &str) -> AutomationResult<Self> {
        let file: RegistryFile = serde_json::from_str(json)
            .map_err(|e| AutomationError::Config(format!("invalid workflow registry: {}", e)))?;

        let mut templates = if file.include_builtin_templates {
            TemplateCatalog::builtin()
        } else {
            TemplateCatalog::new()
        };
        for (name, template) in file.templates {
            templates.insert(name, template);
        }

        let mut registry = Self::new(templates);
        for definition in file.workflows {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    pub fn from_file(path: &Path) -> AutomationResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            AutomationError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }
}

fn builtin_workflows() -> Result<Vec<WorkflowDefinition>, String> {
    let reminder_grace = Duration::days(1);

    Ok(vec![
        WorkflowDefinition::new(
            "staff_welcome",
            EntityType::Staff,
            Recurrence::every(300),
            EligibilityWindow::days(0, 1)?,
            "staff_welcome",
        )
        .describe("Welcome email for newly hired staff"),
        WorkflowDefinition::new(
            "onboarding_reminder",
            EntityType::Staff,
            Recurrence::daily(9, 0)?,
            EligibilityWindow::days(3, 4)?.with_grace(reminder_grace)?,
            "profile_completion",
        )
        .describe("Day 3 profile completion reminder")
        .incomplete_profiles_only(),
        WorkflowDefinition::new(
            "document_upload_reminder",
            EntityType::Staff,
            Recurrence::daily(9, 0)?,
            EligibilityWindow::days(7, 8)?.with_grace(reminder_grace)?,
            "document_upload",
        )
        .describe("Day 7 document upload reminder")
        .incomplete_profiles_only(),
        WorkflowDefinition::new(
            "orientation_reminder",
            EntityType::Staff,
            Recurrence::daily(9, 0)?,
            EligibilityWindow::days(14, 15)?.with_grace(reminder_grace)?,
            "orientation",
        )
        .describe("Day 14 orientation scheduling reminder"),
        WorkflowDefinition::new(
            "participant_welcome",
            EntityType::Participant,
            Recurrence::every(300),
            EligibilityWindow::days(0, 1)?,
            "participant_welcome",
        )
        .describe("Welcome email for newly enrolled participants"),
        WorkflowDefinition::new(
            "compliance_renewal",
            EntityType::ComplianceDocument,
            Recurrence::weekly(Weekday::Mon, 10, 0)?,
            EligibilityWindow::days(-30, 0)?.with_grace(Duration::days(3))?,
            "compliance",
        )
        .describe("Compliance document expiring within 30 days")
        .epoch(EpochKind::ReferenceDate),
    ])
}
