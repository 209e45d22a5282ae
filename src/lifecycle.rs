use crate::{
    chat::{validate_id, Chat, ChatStatus},
    entity::{AgentList, Capacity},
    error::{Conflict, Error, Result},
    store::{AgentRegistry, ChatStore},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Legal chat transitions and their bookkeeping on agent records.
///
/// Each operation touches at most one chat and one agent. The agent-side write
/// is conditional (capacity is checked in the same write that takes the slot),
/// and the chat-side write is conditional on the status the guard observed, so
/// a lost race surfaces as a `Conflict` rather than a double assignment.
pub struct ChatLifecycle {
    chats: Arc<dyn ChatStore>,
    agents: Arc<dyn AgentRegistry>,
    capacity: Capacity,
}

impl ChatLifecycle {
    pub fn new(chats: Arc<dyn ChatStore>, agents: Arc<dyn AgentRegistry>, capacity: Capacity) -> Self {
        Self {
            chats,
            agents,
            capacity,
        }
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    async fn load(&self, chat_id: &str) -> Result<Chat> {
        validate_id("chat id", chat_id)?;
        self.chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| Error::not_found("chat", chat_id))
    }

    /// Open a waiting chat for an order. At most one chat exists per order.
    pub async fn create(&self, order_id: &str, user_id: &str) -> Result<Chat> {
        validate_id("order id", order_id)?;
        validate_id("user id", user_id)?;

        let chat = Chat::new(order_id, user_id);
        self.chats.create(&chat).await?;

        info!(chat_id = %chat.id, order_id, user_id, "Chat created");
        Ok(chat)
    }

    /// Assign a waiting chat to `cse_id` on its active or pending list.
    pub async fn assign(&self, chat_id: &str, cse_id: &str, slot: AgentList) -> Result<Chat> {
        validate_id("cse id", cse_id)?;
        let status = match slot {
            AgentList::Active => ChatStatus::Active,
            AgentList::Pending => ChatStatus::Pending,
            AgentList::Closed => {
                return Err(Error::validation("slot", "chats are assigned as active or pending"))
            }
        };

        let mut chat = self.load(chat_id).await?;
        if chat.status != ChatStatus::Waiting {
            return Err(Conflict::NotWaiting.into());
        }

        let limit = self.capacity.limit(slot).unwrap_or(u32::MAX);
        self.agents.reserve(cse_id, chat_id, slot, limit).await?;

        if !self.chats.set_assignment(chat_id, cse_id, status).await? {
            // Someone else moved the chat on; hand the slot back.
            if let Err(e) = self.agents.release(cse_id, chat_id, slot).await {
                warn!(chat_id, cse_id, error = %e, "Failed to release reserved slot");
            }
            return Err(Conflict::NotWaiting.into());
        }

        chat.status = status;
        chat.cse_id = Some(cse_id.to_string());
        info!(chat_id, cse_id, status = %status, "Chat assigned");
        Ok(chat)
    }

    /// Move a pending chat onto its agent's active list.
    pub async fn promote_to_active(&self, chat_id: &str, cse_id: &str) -> Result<Chat> {
        validate_id("cse id", cse_id)?;
        let mut chat = self.load(chat_id).await?;

        if chat.status != ChatStatus::Pending {
            return Err(Conflict::NotPending.into());
        }
        if !chat.is_assigned_to(cse_id) {
            return Err(Conflict::NotAssignedToAgent.into());
        }

        self.agents
            .promote(cse_id, chat_id, self.capacity.max_active)
            .await?;

        if !self
            .chats
            .update_status(chat_id, ChatStatus::Pending, ChatStatus::Active)
            .await?
        {
            self.undo_promotion(chat_id, cse_id).await;
            return Err(Conflict::NotPending.into());
        }

        chat.status = ChatStatus::Active;
        info!(chat_id, cse_id, "Chat promoted to active");
        Ok(chat)
    }

    /// Close an engaged (pending or active) chat. A waiting chat has never been
    /// picked up and cannot be closed.
    pub async fn close(&self, chat_id: &str) -> Result<Chat> {
        let mut chat = self.load(chat_id).await?;
        let previous = chat.status;
        if previous == ChatStatus::Closed {
            return Err(Conflict::AlreadyClosed.into());
        }
        if !previous.can_transition_to(ChatStatus::Closed) {
            return Err(Conflict::InvalidChatState.into());
        }

        let now = Utc::now();
        if !self.chats.mark_closed(chat_id, previous, now).await? {
            // Status moved under us; report against the fresh state.
            let fresh = self.load(chat_id).await?;
            return Err(if fresh.status == ChatStatus::Closed {
                Conflict::AlreadyClosed.into()
            } else {
                Conflict::InvalidChatState.into()
            });
        }

        if let Some(cse_id) = chat.cse_id.as_deref() {
            self.retire_from_agent(chat_id, cse_id, previous).await;
        } else {
            debug!(chat_id, previous = %previous, "Closed chat had no agent bookkeeping");
        }

        chat.status = ChatStatus::Closed;
        chat.date_closed = Some(now);
        info!(chat_id, previous = %previous, "Chat closed");
        Ok(chat)
    }

    /// Return a closed chat to waiting. Only the owning user may reopen.
    pub async fn reopen(&self, chat_id: &str, requester_id: &str) -> Result<Chat> {
        validate_id("requester id", requester_id)?;
        let mut chat = self.load(chat_id).await?;

        if chat.status != ChatStatus::Closed {
            return Err(Conflict::NotClosed.into());
        }
        if chat.user_id != requester_id {
            return Err(Conflict::NotOwner.into());
        }

        let now = Utc::now();
        if !self.chats.mark_reopened(chat_id, now).await? {
            return Err(Conflict::NotClosed.into());
        }

        if let Some(cse_id) = chat.cse_id.as_deref() {
            match self.agents.release_from_closed(cse_id, chat_id).await {
                Ok(()) => {}
                // The close that preceded this reopen has not moved the entry yet;
                // it drops the entry itself once it sees the chat reopened.
                Err(Error::NotFound { .. }) => {
                    debug!(chat_id, cse_id, "Reopened chat not yet on the agent's closed list")
                }
                Err(e) => {
                    warn!(chat_id, cse_id, error = %e, "Reopened chat but agent closed list was not updated")
                }
            }
        }

        chat.status = ChatStatus::Waiting;
        chat.cse_id = None;
        chat.date_closed = None;
        chat.last_message_time = now;
        info!(chat_id, "Chat reopened");
        Ok(chat)
    }

    /// The chat left `pending` after the agent-side promotion landed. If a close
    /// got there first the entry belongs on the closed list, otherwise it goes
    /// back to pending.
    async fn undo_promotion(&self, chat_id: &str, cse_id: &str) {
        let closed = match self.chats.find_by_id(chat_id).await {
            Ok(chat) => chat.map_or(false, |c| c.status == ChatStatus::Closed),
            Err(e) => {
                warn!(chat_id, cse_id, error = %e, "Failed to re-read chat while undoing promotion");
                return;
            }
        };

        let undone = if closed {
            self.agents.retire(cse_id, chat_id).await.map(|_| ())
        } else {
            self.agents
                .transfer(cse_id, chat_id, AgentList::Active, AgentList::Pending, None)
                .await
        };
        if let Err(e) = undone {
            warn!(chat_id, cse_id, closed, error = %e, "Failed to undo promotion");
        }
    }

    /// Move a just-closed chat onto the agent's closed list. The entry is looked
    /// up on whichever counted list holds it, since a promotion may have moved it
    /// after `previous` was read. If the chat was reopened in the meantime the
    /// closed entry is dropped again.
    async fn retire_from_agent(&self, chat_id: &str, cse_id: &str, previous: ChatStatus) {
        let from = if previous == ChatStatus::Pending {
            AgentList::Pending
        } else {
            AgentList::Active
        };
        let moved = match self.agents.release_to_closed(cse_id, chat_id, from).await {
            Ok(()) => Ok(Some(from)),
            Err(Error::NotFound { .. }) => self.agents.retire(cse_id, chat_id).await,
            Err(e) => Err(e),
        };

        match moved {
            Ok(Some(from)) => debug!(chat_id, cse_id, previous = %previous, list = %from, "Agent entry moved to closed"),
            Ok(None) => debug!(chat_id, cse_id, "Agent entry already retired"),
            Err(e) => {
                warn!(chat_id, cse_id, error = %e, "Closed chat but agent lists were not updated");
                return;
            }
        }

        match self.chats.find_by_id(chat_id).await {
            Ok(Some(fresh)) if fresh.status != ChatStatus::Closed => {
                match self.agents.release_from_closed(cse_id, chat_id).await {
                    Ok(()) | Err(Error::NotFound { .. }) => {}
                    Err(e) => {
                        warn!(chat_id, cse_id, error = %e, "Chat reopened during close but closed entry remains")
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(chat_id, cse_id, error = %e, "Failed to re-read chat after close"),
        }
    }
}
