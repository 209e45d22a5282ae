use crate::{
    chat::{validate_id, validate_text, Chat, ChatStatus, Message},
    entity::Role,
    error::{Conflict, Error, Result},
    store::{ChatStore, MessageStore},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// A message post as it arrives from the routing layer.
#[derive(Debug, Clone, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatHistory {
    pub chat_id: String,
    pub status: ChatStatus,
    pub messages: Vec<Message>,
}

/// Decides who may post into a chat in which state, and records what they post.
pub struct MessageGateway {
    chats: Arc<dyn ChatStore>,
    messages: Arc<dyn MessageStore>,
}

impl MessageGateway {
    pub fn new(chats: Arc<dyn ChatStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self { chats, messages }
    }

    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<Message> {
        let OutgoingMessage {
            chat_id,
            sender_id,
            receiver_id,
            text,
            role,
        } = outgoing;
        match role {
            Role::User => {
                self.send_as_user(&chat_id, &sender_id, &text, &receiver_id)
                    .await
            }
            Role::Cse => {
                self.send_as_cse(&chat_id, &sender_id, &text, &receiver_id)
                    .await
            }
        }
    }

    /// The owning user may post into any chat that is not closed.
    pub async fn send_as_user(
        &self,
        chat_id: &str,
        sender_id: &str,
        text: &str,
        receiver_id: &str,
    ) -> Result<Message> {
        let chat = self.authorize(chat_id, sender_id, text, receiver_id).await?;
        if chat.status == ChatStatus::Closed {
            return Err(Conflict::InvalidChatState.into());
        }
        if chat.user_id != sender_id {
            return Err(Conflict::AccessDenied.into());
        }
        self.record(&chat, sender_id, text, receiver_id).await
    }

    /// The assigned agent may post only while the chat is active.
    pub async fn send_as_cse(
        &self,
        chat_id: &str,
        sender_id: &str,
        text: &str,
        receiver_id: &str,
    ) -> Result<Message> {
        let chat = self.authorize(chat_id, sender_id, text, receiver_id).await?;
        if chat.status != ChatStatus::Active {
            return Err(Conflict::InvalidChatState.into());
        }
        if !chat.is_assigned_to(sender_id) {
            return Err(Conflict::AccessDenied.into());
        }
        self.record(&chat, sender_id, text, receiver_id).await
    }

    /// Status plus every message, oldest first. No participant check is made here;
    /// callers that need one must do it before calling.
    pub async fn history(&self, chat_id: &str) -> Result<ChatHistory> {
        validate_id("chat id", chat_id)?;
        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| Error::not_found("chat", chat_id))?;
        let messages = self.messages.list_by_chat(chat_id).await?;

        Ok(ChatHistory {
            chat_id: chat.id,
            status: chat.status,
            messages,
        })
    }

    async fn authorize(
        &self,
        chat_id: &str,
        sender_id: &str,
        text: &str,
        receiver_id: &str,
    ) -> Result<Chat> {
        validate_id("chat id", chat_id)?;
        validate_id("sender id", sender_id)?;
        validate_id("receiver id", receiver_id)?;
        validate_text(text)?;

        self.chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| Error::not_found("chat", chat_id))
    }

    async fn record(
        &self,
        chat: &Chat,
        sender_id: &str,
        text: &str,
        receiver_id: &str,
    ) -> Result<Message> {
        let message = Message::new(&chat.id, sender_id, receiver_id, text);
        self.messages.append(&message).await?;

        if let Err(e) = self
            .chats
            .append_message(&chat.id, &message.id, message.timestamp)
            .await
        {
            // The chat closed after it was checked; drop the orphaned row.
            warn!(chat_id = %chat.id, message_id = %message.id, error = %e, "Failed to link message onto chat");
            if let Err(remove_err) = self.messages.remove(&message.id).await {
                warn!(message_id = %message.id, error = %remove_err, "Failed to delete unlinked message");
            }
            return Err(e);
        }

        debug!(chat_id = %chat.id, message_id = %message.id, "Message recorded");
        Ok(message)
    }
}
