#![forbid(unsafe_code)]

use shadow_domain::{Message, MessageId, ParseIdError};
use thiserror::Error;

use crate::pb;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatMessageError {
	#[error("invalid message id: {0}")]
	InvalidId(#[from] ParseIdError),
}

/// Wire form of a domain message. Copies fields verbatim.
pub fn chat_message_from_domain(m: &Message) -> pb::ChatMessage {
	pb::ChatMessage {
		id: m.id.as_str().to_string(),
		username: m.username.clone(),
		text: m.text.clone(),
		timestamp: m.timestamp,
		expires_at: m.expires_at,
	}
}

/// Domain form of a wire message. Only the id is checked here; expiry and
/// content rules belong to whoever consumes the message.
pub fn message_from_chat(m: pb::ChatMessage) -> Result<Message, ChatMessageError> {
	Ok(Message {
		id: MessageId::new(m.id)?,
		username: m.username,
		text: m.text,
		timestamp: m.timestamp,
		expires_at: m.expires_at,
	})
}
