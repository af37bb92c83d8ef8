use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::models::AlertMessage;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("alert relay rejected message with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(&self, alert: &AlertMessage) -> Result<(), AlertError>;
}

/// Posts `{chat_id, message}` to the message relay.
pub struct HttpRelay {
    url: String,
    client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl AlertTransport for HttpRelay {
    async fn deliver(&self, alert: &AlertMessage) -> Result<(), AlertError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Fans one text out to every configured recipient, best effort.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn AlertTransport>,
    recipients: Arc<Vec<String>>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn AlertTransport>, recipients: Vec<String>) -> Self {
        Self { transport, recipients: Arc::new(recipients) }
    }

    /// Returns how many recipients accepted the message.
    pub async fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for chat_id in self.recipients.iter() {
            let alert = AlertMessage { chat_id: chat_id.clone(), message: text.to_string() };
            match self.transport.deliver(&alert).await {
                Ok(()) => delivered += 1,
                Err(e) => error!("Alert to {} not delivered: {}", chat_id, e),
            }
        }
        info!("Alert broadcast to {}/{} recipients", delivered, self.recipients.len());
        delivered
    }
}
