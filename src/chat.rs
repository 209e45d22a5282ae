use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_ID_LEN: usize = 64;
pub const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Waiting,
    Pending,
    Active,
    Closed,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Waiting => "waiting",
            ChatStatus::Pending => "pending",
            ChatStatus::Active => "active",
            ChatStatus::Closed => "closed",
        }
    }

    /// Legal edges of the chat state machine.
    ///
    /// waiting -> pending | active, pending -> active,
    /// pending | active -> closed, closed -> waiting.
    pub fn can_transition_to(self, next: ChatStatus) -> bool {
        use ChatStatus::*;
        matches!(
            (self, next),
            (Waiting, Pending)
                | (Waiting, Active)
                | (Pending, Active)
                | (Pending, Closed)
                | (Active, Closed)
                | (Closed, Waiting)
        )
    }

    /// Statuses where an agent is engaged; these are subject to the idle timeout.
    pub const ENGAGED: [ChatStatus; 2] = [ChatStatus::Active, ChatStatus::Pending];
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(ChatStatus::Waiting),
            "pending" => Ok(ChatStatus::Pending),
            "active" => Ok(ChatStatus::Active),
            "closed" => Ok(ChatStatus::Closed),
            other => Err(Error::validation(
                "chat status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// A support chat tied to one purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub cse_id: Option<String>,
    pub status: ChatStatus,
    pub date_created: DateTime<Utc>,
    pub date_closed: Option<DateTime<Utc>>,
    pub last_message_time: DateTime<Utc>,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

impl Chat {
    pub fn new(order_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            user_id: user_id.into(),
            cse_id: None,
            status: ChatStatus::Waiting,
            date_created: now,
            date_closed: None,
            last_message_time: now,
            message_ids: Vec::new(),
        }
    }

    pub fn is_assigned_to(&self, cse_id: &str) -> bool {
        self.cse_id.as_deref() == Some(cse_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Reject empty, oversized or whitespace-bearing identifiers.
pub fn validate_id(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    if value.len() > MAX_ID_LEN {
        return Err(Error::validation(
            field,
            format!("must be at most {MAX_ID_LEN} characters"),
        ));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(Error::validation(field, "must not contain whitespace"));
    }
    Ok(())
}

pub fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::validation("text", "must not be empty"));
    }
    if text.chars().count() > MAX_MESSAGE_LEN {
        return Err(Error::validation(
            "text",
            format!("must be at most {MAX_MESSAGE_LEN} characters"),
        ));
    }
    Ok(())
}
