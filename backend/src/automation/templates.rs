// Notification templates - plain data with {{placeholder}} substitution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::error::DispatchError;
use super::registry::WorkflowDefinition;
use ndis_shared::Entity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Values available to a template for one entity.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_entity(workflow: &WorkflowDefinition, entity: &Entity, now: DateTime<Utc>) -> Self {
        let days_remaining = (entity.reference_at - now).num_days().max(0);

        let mut ctx = Self::new();
        ctx.insert("workflow", &workflow.name);
        ctx.insert("entity_type", entity.entity_type.as_str());
        ctx.insert("entity_id", entity.entity_id.to_string());
        ctx.insert("first_name", &entity.first_name);
        ctx.insert("last_name", &entity.last_name);
        ctx.insert("display_name", entity.display_name());
        ctx.insert("email", entity.recipient_email.as_deref().unwrap_or(""));
        ctx.insert("reference_date", entity.reference_at.format("%Y-%m-%d").to_string());
        ctx.insert("document_name", entity.document_name.as_deref().unwrap_or("document"));
        ctx.insert("days_remaining", days_remaining.to_string());
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl NotificationTemplate {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn render(&self, ctx: &TemplateContext) -> Result<RenderedMessage, DispatchError> {
        Ok(RenderedMessage {
            subject: substitute(&self.subject, ctx)?,
            body: substitute(&self.body, ctx)?,
        })
    }
}

fn substitute(text: &str, ctx: &TemplateContext) -> Result<String, DispatchError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| DispatchError::Render("unterminated placeholder".to_string()))?;
        let key = after[..close].trim();
        let value = ctx
            .get(key)
            .ok_or_else(|| DispatchError::Render(format!("unknown placeholder '{}'", key)))?;
        out.push_str(value);
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Named templates referenced by workflow definitions.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, NotificationTemplate>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, template: NotificationTemplate) {
        self.templates.insert(name.into(), template);
    }

    pub fn get(&self, name: &str) -> Option<&NotificationTemplate> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::new();

        catalog.insert(
            "staff_welcome",
            NotificationTemplate::new(
                "Welcome to NDIS Platform!",
                "Dear {{display_name}},\n\n\
                 Welcome to our NDIS platform! We're excited to have you join our team.\n\n\
                 Your account details:\n\
                 - Staff ID: {{entity_id}}\n\
                 - Login Email: {{email}}\n\n\
                 Next steps:\n\
                 1. Complete your profile information\n\
                 2. Upload required documents (ID, qualifications, WWCC)\n\
                 3. Complete NDIS worker screening\n\
                 4. Attend orientation session\n\n\
                 If you have any questions, please contact your supervisor.\n\n\
                 Best regards,\nNDIS Platform Team\n\n\
                 ---\nThis is an automated message. Please do not reply.",
            ),
        );

        catalog.insert(
            "profile_completion",
            NotificationTemplate::new(
                "Profile Completion Reminder",
                "Hello {{first_name}},\n\n\
                 This is a friendly reminder regarding: Profile Completion\n\n\
                 Details: Please complete your profile and upload required documents. \
                 Hired on: {{reference_date}}\n\n\
                 Please take action as soon as possible to ensure compliance.\n\n\
                 Best regards,\nNDIS Platform Team",
            ),
        );

        catalog.insert(
            "document_upload",
            NotificationTemplate::new(
                "Document Upload Reminder",
                "Hello {{first_name}},\n\n\
                 This is a friendly reminder regarding: Document Upload\n\n\
                 Details: Your ID, qualifications and WWCC are still outstanding. \
                 Hired on: {{reference_date}}\n\n\
                 Please take action as soon as possible to ensure compliance.\n\n\
                 Best regards,\nNDIS Platform Team",
            ),
        );

        catalog.insert(
            "orientation",
            NotificationTemplate::new(
                "Orientation Session Reminder",
                "Hello {{first_name}},\n\n\
                 This is a friendly reminder regarding: Orientation\n\n\
                 Details: Please schedule your orientation session with your supervisor.\n\n\
                 Best regards,\nNDIS Platform Team",
            ),
        );

        catalog.insert(
            "participant_welcome",
            NotificationTemplate::new(
                "Welcome to NDIS Services",
                "Welcome, {{first_name}}! We're excited to support your NDIS journey.\n\n\
                 Participant ID: {{entity_id}}\n\
                 Next steps:\n\
                 1. Schedule initial assessment\n\
                 2. Review service options\n\
                 3. Create support plan",
            ),
        );

        catalog.insert(
            "compliance",
            NotificationTemplate::new(
                "Compliance Renewal Reminder",
                "Hello {{first_name}},\n\n\
                 This is a friendly reminder regarding: Compliance\n\n\
                 Details: {{document_name}} expires on {{reference_date}} \
                 ({{days_remaining}} days remaining). Please renew immediately.\n\n\
                 Best regards,\nNDIS Platform Team",
            ),
        );

        catalog
    }
}
