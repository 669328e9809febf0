use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

/// One notification addressed to one device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("device token is no longer registered")]
    Unregistered,
    #[error("push transport unavailable: {0}")]
    Transport(String),
}

/// Delivery transport for push notifications.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), PushError>;
}

/// Writes every message to the log instead of delivering it.
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl PushSender for LogSender {
    async fn send(&self, message: &PushMessage) -> Result<(), PushError> {
        info!(
            token = %message.token,
            title = %message.title,
            body = %message.body,
            data = ?message.data,
            "push"
        );
        Ok(())
    }
}
