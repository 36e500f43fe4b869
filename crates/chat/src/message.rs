use std::time::{SystemTime, UNIX_EPOCH};

use parley_llm::{ProviderAttachment, ProviderMessage, Role};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Opaque payload, typically a data URL.
    pub data: String,
}

impl Attachment {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub text: String,
    /// Unix milliseconds.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    /// User message this bot reply answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responds_to: Option<MessageId>,
}

impl Message {
    pub fn user(id: MessageId, text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id,
            sender: Sender::User,
            text: text.into(),
            timestamp: now_millis(),
            attachments,
            error: false,
            responds_to: None,
        }
    }

    pub fn bot_placeholder(id: MessageId, responds_to: MessageId) -> Self {
        Self {
            id,
            sender: Sender::Bot,
            text: String::new(),
            timestamp: now_millis(),
            attachments: Vec::new(),
            error: false,
            responds_to: Some(responds_to),
        }
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }

    pub fn mark_failed(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.error = true;
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        let role = match self.sender {
            Sender::User => Role::User,
            Sender::Bot => Role::Assistant,
        };
        ProviderMessage::new(role, self.text.clone()).with_attachments(
            self.attachments
                .iter()
                .map(|attachment| ProviderAttachment {
                    name: attachment.name.clone(),
                    mime_type: attachment.mime_type.clone(),
                    data: attachment.data.clone(),
                })
                .collect(),
        )
    }
}

/// Converts history for a transport request, skipping failed or cancelled
/// replies.
pub fn provider_history(messages: &[Message]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .filter(|message| !message.error)
        .map(Message::to_provider_message)
        .collect()
}

fn now_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis())
        .to_string()
}
