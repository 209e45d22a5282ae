use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Who is posting into a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Cse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(Error::validation(
                "agent status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// One of the three per-agent chat lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentList {
    Active,
    Pending,
    Closed,
}

impl AgentList {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentList::Active => "active",
            AgentList::Pending => "pending",
            AgentList::Closed => "closed",
        }
    }

    /// Column holding this list's counter. The closed list is not counted.
    pub fn counter_column(&self) -> Option<&'static str> {
        match self {
            AgentList::Active => Some("active_count"),
            AgentList::Pending => Some("pending_count"),
            AgentList::Closed => None,
        }
    }
}

impl fmt::Display for AgentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AgentList::Active),
            "pending" => Ok(AgentList::Pending),
            "closed" => Ok(AgentList::Closed),
            other => Err(Error::validation(
                "agent list",
                format!("unknown list '{other}'"),
            )),
        }
    }
}

/// Per-agent simultaneous-chat ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub max_active: u32,
    pub max_pending: u32,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            max_active: 5,
            max_pending: 10,
        }
    }
}

impl Capacity {
    pub fn limit(&self, list: AgentList) -> Option<u32> {
        match list {
            AgentList::Active => Some(self.max_active),
            AgentList::Pending => Some(self.max_pending),
            AgentList::Closed => None,
        }
    }
}

/// A customer service executive (CSE) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Login credential identifier; unique across agents.
    pub login: String,
    pub name: String,
    pub status: AgentStatus,
    pub active_chat_ids: Vec<String>,
    pub pending_chat_ids: Vec<String>,
    pub closed_chat_ids: Vec<String>,
    pub active_count: u32,
    pub pending_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(login: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            login: login.into(),
            name: name.into(),
            status: AgentStatus::Offline,
            active_chat_ids: Vec::new(),
            pending_chat_ids: Vec::new(),
            closed_chat_ids: Vec::new(),
            active_count: 0,
            pending_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn count(&self, list: AgentList) -> Option<u32> {
        match list {
            AgentList::Active => Some(self.active_count),
            AgentList::Pending => Some(self.pending_count),
            AgentList::Closed => None,
        }
    }

    /// Whether the agent's counter for `list` is still under the cap.
    pub fn has_room(&self, list: AgentList, capacity: &Capacity) -> bool {
        match (self.count(list), capacity.limit(list)) {
            (Some(count), Some(limit)) => count < limit,
            _ => true,
        }
    }

    /// Counters agree with list lengths.
    pub fn is_consistent(&self) -> bool {
        self.active_count as usize == self.active_chat_ids.len()
            && self.pending_count as usize == self.pending_chat_ids.len()
    }
}

/// The slice of an order record the chat core reads. Orders are written by the
/// order service; the core only links a chat onto them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer_id: String,
    pub chat_id: Option<String>,
}
