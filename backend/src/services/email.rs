use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

use crate::automation::{DeliveryGateway, DispatchError};
use crate::config::SmtpConfig;

/// SMTP delivery gateway for automation notifications
#[derive(Debug, Clone)]
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailService {
    pub fn new(smtp_config: &SmtpConfig) -> Result<Self, DispatchError> {
        // Checked before the transport exists: building the pool needs a runtime.
        let from = format!("{} <{}>", smtp_config.from_name, smtp_config.from_email)
            .parse::<Mailbox>()
            .map_err(|e| DispatchError::Gateway(format!("invalid sender address: {}", e)))?;

        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host)
                .map_err(|e| DispatchError::Gateway(format!("invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let transport = builder
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(EmailService { transport, from })
    }

    fn build_message(&self, recipient: &str, subject: &str, body: &str) -> Result<Message, DispatchError> {
        let to = recipient
            .parse::<Mailbox>()
            .map_err(|e| DispatchError::Gateway(format!("invalid recipient '{}': {}", recipient, e)))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DispatchError::Gateway(format!("failed to build message: {}", e)))
    }
}

#[async_trait]
impl DeliveryGateway for EmailService {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DispatchError> {
        let message = self.build_message(recipient, subject, body)?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", recipient);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", recipient, e);
                Err(DispatchError::Gateway(e.to_string()))
            }
        }
    }
}
