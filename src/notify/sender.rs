//! Delivery of rendered messages to notifier channels.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_common::{Notifier, NotifierKind};
use serde_json::json;
use tracing::debug;

use crate::errors::NotifyError;
use crate::notify::message::Message;

const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Delivers one message to one recipient through one notifier.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, notifier: &Notifier, recipient: &str, message: &Message) -> Result<(), NotifyError>;
}

/// Sends to HTTP-based channels (Slack incoming webhooks and generic webhooks).
pub struct HttpMessageSender {
    client: reqwest::Client,
}

impl HttpMessageSender {
    pub fn new() -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, notifier: &Notifier, recipient: &str, message: &Message) -> Result<(), NotifyError> {
        let (url, body) = match &notifier.kind {
            NotifierKind::Slack {
                url,
                default_recipient,
            } => {
                let channel = if recipient.is_empty() {
                    default_recipient.as_str()
                } else {
                    recipient
                };
                let mut body = json!({ "text": message.content });
                if !channel.is_empty() {
                    body["channel"] = json!(channel);
                }
                (url, body)
            }
            NotifierKind::Webhook { url } => (
                url,
                json!({
                    "title": message.title,
                    "content": message.content,
                    "recipient": recipient,
                }),
            ),
            NotifierKind::Email { .. } => {
                return Err(NotifyError::UnsupportedChannel(notifier.metadata.name.clone()));
            }
        };

        let resp = self.client.post(url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Delivery {
                notifier: notifier.metadata.name.clone(),
                message: format!("{}: {}", status, text),
            });
        }
        debug!(notifier = %notifier.metadata.name, recipient = %recipient, "Notification delivered");
        Ok(())
    }
}
