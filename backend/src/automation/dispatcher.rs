// Notification Dispatcher - one outbound gateway call per dispatch

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::error::DispatchError;
use super::registry::WorkflowDefinition;
use super::templates::{TemplateCatalog, TemplateContext};
use ndis_shared::Entity;

/// Outbound transport for rendered notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    Delivered { recipient: String, subject: String },
    Failed(DispatchError),
}

impl DispatchResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Human-readable summary stored on the audit entry.
    pub fn details(&self) -> String {
        match self {
            Self::Delivered { recipient, subject } => format!("Sent '{}' to {}", subject, recipient),
            Self::Failed(e) => e.to_string(),
        }
    }
}

pub struct NotificationDispatcher {
    gateway: Arc<dyn DeliveryGateway>,
    templates: Arc<TemplateCatalog>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(gateway: Arc<dyn DeliveryGateway>, templates: Arc<TemplateCatalog>, timeout: Duration) -> Self {
        Self {
            gateway,
            templates,
            timeout,
        }
    }

    /// Render the workflow's template for `entity` and make exactly one
    /// gateway call. Never retries; a failure is reported, not raised.
    pub async fn dispatch(
        &self,
        workflow: &WorkflowDefinition,
        entity: &Entity,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        let recipient = match entity.recipient_email.as_deref().map(str::trim) {
            Some(email) if email.contains('@') => email.to_string(),
            _ => return DispatchResult::Failed(DispatchError::MissingRecipient),
        };

        let template = match self.templates.get(&workflow.template) {
            Some(template) => template,
            None => {
                return DispatchResult::Failed(DispatchError::Render(format!(
                    "template '{}' not found",
                    workflow.template
                )));
            }
        };

        let message = match template.render(&TemplateContext::for_entity(workflow, entity, now)) {
            Ok(message) => message,
            Err(e) => return DispatchResult::Failed(e),
        };

        debug!(
            workflow = %workflow.name,
            entity_id = entity.entity_id,
            recipient = %recipient,
            "Dispatching notification"
        );

        let send = self.gateway.send(&recipient, &message.subject, &message.body);
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(())) => DispatchResult::Delivered {
                recipient,
                subject: message.subject,
            },
            Ok(Err(e)) => DispatchResult::Failed(e),
            Err(_) => DispatchResult::Failed(DispatchError::Timeout(self.timeout)),
        }
    }
}

/// Development gateway used when SMTP is not configured. Logs the message
/// and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogGateway;

#[async_trait]
impl DeliveryGateway for LogGateway {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DispatchError> {
        info!(recipient, subject, body_len = body.len(), "Notification delivered to log gateway");
        Ok(())
    }
}
