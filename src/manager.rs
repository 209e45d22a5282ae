use crate::{
    chat::{validate_id, Chat, Message},
    config::Config,
    entity::{Agent, AgentStatus},
    error::{Error, Result},
    gateway::{ChatHistory, MessageGateway, OutgoingMessage},
    lifecycle::ChatLifecycle,
    reaper::IdleReaper,
    scheduler::{AssignmentScheduler, AssignmentSupervisor},
    store::{AgentRegistry, ChatStore, MessageStore},
};
use std::sync::Arc;
use tracing::info;

/// Request-path entry point: wires the stores into the lifecycle, gateway,
/// assignment supervisor and idle reaper.
pub struct SupportDesk {
    chats: Arc<dyn ChatStore>,
    agents: Arc<dyn AgentRegistry>,
    lifecycle: Arc<ChatLifecycle>,
    gateway: MessageGateway,
    supervisor: AssignmentSupervisor,
    reaper: IdleReaper,
}

impl SupportDesk {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        agents: Arc<dyn AgentRegistry>,
        messages: Arc<dyn MessageStore>,
        config: &Config,
    ) -> Self {
        let lifecycle = Arc::new(ChatLifecycle::new(
            chats.clone(),
            agents.clone(),
            config.capacity,
        ));
        let scheduler = Arc::new(AssignmentScheduler::new(
            chats.clone(),
            agents.clone(),
            lifecycle.clone(),
            config.assignment,
        ));

        Self {
            gateway: MessageGateway::new(chats.clone(), messages),
            supervisor: AssignmentSupervisor::new(scheduler),
            reaper: IdleReaper::new(chats.clone(), lifecycle.clone(), config.reaper),
            chats,
            agents,
            lifecycle,
        }
    }

    /// Open a chat for an order and start looking for an agent.
    pub async fn create_chat(&self, order_id: &str, user_id: &str) -> Result<Chat> {
        let chat = self.lifecycle.create(order_id, user_id).await?;
        self.supervisor.spawn(&chat.id);
        Ok(chat)
    }

    pub async fn send_message(&self, outgoing: OutgoingMessage) -> Result<Message> {
        self.gateway.send(outgoing).await
    }

    pub async fn history(&self, chat_id: &str) -> Result<ChatHistory> {
        self.gateway.history(chat_id).await
    }

    pub async fn accept_chat(&self, chat_id: &str, cse_id: &str) -> Result<Chat> {
        self.lifecycle.promote_to_active(chat_id, cse_id).await
    }

    pub async fn close_chat(&self, chat_id: &str) -> Result<Chat> {
        self.lifecycle.close(chat_id).await
    }

    /// Reopen a closed chat; it goes back through assignment.
    pub async fn reopen_chat(&self, chat_id: &str, requester_id: &str) -> Result<Chat> {
        let chat = self.lifecycle.reopen(chat_id, requester_id).await?;
        self.supervisor.spawn(&chat.id);
        Ok(chat)
    }

    pub async fn register_agent(&self, login: &str, name: &str) -> Result<Agent> {
        validate_id("login", login)?;
        if name.trim().is_empty() {
            return Err(Error::validation("name", "must not be empty"));
        }

        let agent = Agent::new(login, name.trim());
        self.agents.register(&agent).await?;
        info!(agent_id = %agent.id, login, "Agent registered");
        Ok(agent)
    }

    /// Login marks an agent online, logout marks it offline. Going offline keeps
    /// the agent's current chats.
    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        validate_id("agent id", agent_id)?;
        self.agents.set_status(agent_id, status).await?;
        info!(agent_id, status = status.as_str(), "Agent status changed");
        Ok(())
    }

    pub async fn find_agent(&self, agent_id: &str) -> Result<Agent> {
        validate_id("agent id", agent_id)?;
        self.agents
            .find_agent(agent_id)
            .await?
            .ok_or_else(|| Error::not_found("agent", agent_id))
    }

    /// Every registered agent with its lists and counters.
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.agents.find_all().await
    }

    /// Restart assignment for chats left waiting by a previous run.
    pub async fn resume(&self) -> Result<usize> {
        self.supervisor.resume_waiting(self.chats.as_ref()).await
    }

    /// Run the idle reaper until shutdown.
    pub async fn start_reaper(&self) {
        self.reaper.run(self.supervisor.shutdown_signal()).await;
    }

    /// Stop background work: the reaper loop and every assignment task.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    pub fn assignments_running(&self) -> usize {
        self.supervisor.running()
    }
}
