use crate::{
    chat::ChatStatus,
    entity::{Agent, AgentList, Capacity},
    error::{Error, Result},
    lifecycle::ChatLifecycle,
    store::{AgentRegistry, ChatStore},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentSettings {
    pub poll_interval: Duration,
    pub deadline: Duration,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(60 * 60),
        }
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Assigned { cse_id: String, slot: AgentList },
    /// The chat left `waiting` through some other path.
    NotWaiting,
    NoAgentsOnline,
    NoCapacity,
}

/// How an assignment task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Assigned { cse_id: String, slot: AgentList },
    AlreadyHandled,
    ChatMissing,
    DeadlineReached,
    Cancelled,
}

/// Polls the agent registry for a chat until an agent takes it, the chat stops
/// waiting, or the deadline passes.
pub struct AssignmentScheduler {
    chats: Arc<dyn ChatStore>,
    agents: Arc<dyn AgentRegistry>,
    lifecycle: Arc<ChatLifecycle>,
    settings: AssignmentSettings,
}

impl AssignmentScheduler {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        agents: Arc<dyn AgentRegistry>,
        lifecycle: Arc<ChatLifecycle>,
        settings: AssignmentSettings,
    ) -> Self {
        Self {
            chats,
            agents,
            lifecycle,
            settings,
        }
    }

    /// Candidates in scan order: every agent with active room first, then every
    /// agent with pending room, each in registry order.
    fn candidates(agents: &[Agent], capacity: &Capacity) -> Vec<(String, AgentList)> {
        let active = agents
            .iter()
            .filter(|a| a.has_room(AgentList::Active, capacity))
            .map(|a| (a.id.clone(), AgentList::Active));
        let pending = agents
            .iter()
            .filter(|a| a.has_room(AgentList::Pending, capacity))
            .map(|a| (a.id.clone(), AgentList::Pending));
        active.chain(pending).collect()
    }

    /// One poll: re-check the chat, then try eligible agents in order.
    pub async fn tick(&self, chat_id: &str) -> Result<Tick> {
        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| Error::not_found("chat", chat_id))?;
        if chat.status != ChatStatus::Waiting {
            return Ok(Tick::NotWaiting);
        }

        let agents = self.agents.find_online().await?;
        if agents.is_empty() {
            return Ok(Tick::NoAgentsOnline);
        }

        let capacity = self.lifecycle.capacity();
        for (cse_id, slot) in Self::candidates(&agents, &capacity) {
            match self.lifecycle.assign(chat_id, &cse_id, slot).await {
                Ok(_) => return Ok(Tick::Assigned { cse_id, slot }),
                // Lost the slot to a concurrent assignment; try the next agent.
                Err(Error::CapacityExhausted) => continue,
                Err(Error::NotFound { kind: "agent", .. }) => continue,
                Err(Error::Conflict(_)) => return Ok(Tick::NotWaiting),
                Err(e) => return Err(e),
            }
        }

        Ok(Tick::NoCapacity)
    }

    /// Poll until done. Errors inside a tick are logged and the loop keeps going.
    pub async fn run(&self, chat_id: &str, mut shutdown: watch::Receiver<bool>) -> Outcome {
        let deadline = Instant::now() + self.settings.deadline;
        let mut ticker = time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = time::sleep_until(deadline) => {
                    warn!(chat_id, "No agent took the chat before the deadline, leaving it waiting");
                    return Outcome::DeadlineReached;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(chat_id, "Assignment task cancelled");
                        return Outcome::Cancelled;
                    }
                    continue;
                }
            }

            match self.tick(chat_id).await {
                Ok(Tick::Assigned { cse_id, slot }) => {
                    return Outcome::Assigned { cse_id, slot };
                }
                Ok(Tick::NotWaiting) => return Outcome::AlreadyHandled,
                Ok(Tick::NoAgentsOnline) => {
                    debug!(chat_id, "No agents online, will try again later");
                }
                Ok(Tick::NoCapacity) => {
                    debug!(chat_id, "All online agents are at capacity");
                }
                Err(Error::NotFound { kind: "chat", .. }) => {
                    error!(chat_id, "Chat vanished while waiting for assignment");
                    return Outcome::ChatMissing;
                }
                Err(e) => {
                    error!(chat_id, error = %e, "Assignment attempt failed");
                }
            }
        }
    }
}

/// Owns one assignment task per waiting chat.
pub struct AssignmentSupervisor {
    scheduler: Arc<AssignmentScheduler>,
    tasks: Mutex<HashMap<String, JoinHandle<Outcome>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl AssignmentSupervisor {
    pub fn new(scheduler: Arc<AssignmentScheduler>) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        Self {
            scheduler,
            tasks: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Start assignment for `chat_id`. No-op if a live task already exists.
    pub fn spawn(&self, chat_id: &str) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if *self.shutdown_tx.borrow() {
            warn!(chat_id, "Supervisor is shutting down, not starting assignment");
            return false;
        }

        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(chat_id) {
            debug!(chat_id, "Assignment already running");
            return false;
        }

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let id = chat_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = scheduler.run(&id, shutdown).await;
            match &outcome {
                Outcome::Assigned { cse_id, slot } => {
                    info!(chat_id = %id, cse_id = %cse_id, slot = %slot, "Assignment finished");
                }
                other => debug!(chat_id = %id, outcome = ?other, "Assignment task exited"),
            }
            outcome
        });

        tasks.insert(chat_id.to_string(), handle);
        true
    }

    /// Number of tasks still running.
    pub fn running(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Start tasks for chats that were waiting when the process stopped.
    pub async fn resume_waiting(&self, chats: &dyn ChatStore) -> Result<usize> {
        let waiting = chats.find_by_status(ChatStatus::Waiting).await?;
        let mut started = 0;
        for chat in &waiting {
            if self.spawn(&chat.id) {
                started += 1;
            }
        }
        if started > 0 {
            info!(count = started, "Resumed assignment for waiting chats");
        }
        Ok(started)
    }

    /// Signal every task to stop at its next poll boundary and wait for them.
    pub async fn shutdown(&self) {
        // Stored even when nothing is subscribed, so later spawns see it.
        self.shutdown_tx.send_replace(true);
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain().map(|(_, h)| h).collect()
        };
        let count = handles.len();
        for res in futures::future::join_all(handles).await {
            if let Err(e) = res {
                error!(error = %e, "Assignment task panicked");
            }
        }
        info!(count, "Assignment supervisor stopped");
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Chat;
    use crate::entity::{AgentStatus, Order};
    use crate::store::SqliteStore;

    struct Fixture {
        store: Arc<SqliteStore>,
        lifecycle: Arc<ChatLifecycle>,
        scheduler: Arc<AssignmentScheduler>,
    }

    async fn fixture(settings: AssignmentSettings) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
        let lifecycle = Arc::new(ChatLifecycle::new(
            store.clone(),
            store.clone(),
            Capacity::default(),
        ));
        let scheduler = Arc::new(AssignmentScheduler::new(
            store.clone(),
            store.clone(),
            lifecycle.clone(),
            settings,
        ));
        Fixture {
            store,
            lifecycle,
            scheduler,
        }
    }

    fn fast() -> AssignmentSettings {
        AssignmentSettings {
            poll_interval: Duration::from_millis(10),
            deadline: Duration::from_secs(5),
        }
    }

    impl Fixture {
        async fn chat(&self, order_id: &str) -> Chat {
            self.store
                .record_order(&Order {
                    id: order_id.to_string(),
                    customer_id: "user-1".into(),
                    chat_id: None,
                })
                .await
                .unwrap();
            self.lifecycle.create(order_id, "user-1").await.unwrap()
        }

        async fn agent(&self, login: &str, active: u32, pending: u32) -> Agent {
            let agent = Agent::new(login, login);
            self.store.register(&agent).await.unwrap();
            self.store
                .set_status(&agent.id, AgentStatus::Online)
                .await
                .unwrap();
            for i in 0..active {
                self.store
                    .reserve_active(&agent.id, &format!("{login}-a{i}"), u32::MAX)
                    .await
                    .unwrap();
            }
            for i in 0..pending {
                self.store
                    .reserve_pending(&agent.id, &format!("{login}-p{i}"), u32::MAX)
                    .await
                    .unwrap();
            }
            agent
        }
    }

    #[tokio::test]
    async fn tick_without_agents_waits() {
        let fx = fixture(fast()).await;
        let chat = fx.chat("order-1").await;
        assert_eq!(fx.scheduler.tick(&chat.id).await.unwrap(), Tick::NoAgentsOnline);
    }

    #[tokio::test]
    async fn active_room_anywhere_beats_pending_room_first() {
        let fx = fixture(fast()).await;
        let chat = fx.chat("order-1").await;
        let _full = fx.agent("full", 5, 0).await;
        let open = fx.agent("open", 0, 0).await;

        let tick = fx.scheduler.tick(&chat.id).await.unwrap();
        assert_eq!(
            tick,
            Tick::Assigned {
                cse_id: open.id.clone(),
                slot: AgentList::Active
            }
        );
    }

    #[tokio::test]
    async fn falls_back_to_pending() {
        let fx = fixture(fast()).await;
        let chat = fx.chat("order-1").await;
        let busy = fx.agent("busy", 5, 3).await;

        let tick = fx.scheduler.tick(&chat.id).await.unwrap();
        assert_eq!(
            tick,
            Tick::Assigned {
                cse_id: busy.id.clone(),
                slot: AgentList::Pending
            }
        );
        let stored = fx.store.find_by_id(&chat.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChatStatus::Pending);
    }

    #[tokio::test]
    async fn saturated_agents_mean_no_capacity() {
        let fx = fixture(fast()).await;
        let chat = fx.chat("order-1").await;
        fx.agent("busy", 5, 10).await;
        assert_eq!(fx.scheduler.tick(&chat.id).await.unwrap(), Tick::NoCapacity);
    }

    #[tokio::test]
    async fn run_exits_when_chat_is_handled_elsewhere() {
        let fx = fixture(fast()).await;
        let chat = fx.chat("order-1").await;
        let agent = fx.agent("ada", 0, 0).await;
        fx.lifecycle
            .assign(&chat.id, &agent.id, AgentList::Pending)
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        assert_eq!(fx.scheduler.run(&chat.id, rx).await, Outcome::AlreadyHandled);
    }

    #[tokio::test]
    async fn run_gives_up_at_deadline() {
        let fx = fixture(AssignmentSettings {
            poll_interval: Duration::from_millis(10),
            deadline: Duration::from_millis(60),
        })
        .await;
        let chat = fx.chat("order-1").await;

        let (_tx, rx) = watch::channel(false);
        assert_eq!(fx.scheduler.run(&chat.id, rx).await, Outcome::DeadlineReached);
        let stored = fx.store.find_by_id(&chat.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChatStatus::Waiting);
    }

    #[tokio::test]
    async fn run_reports_missing_chat() {
        let fx = fixture(fast()).await;
        let (_tx, rx) = watch::channel(false);
        assert_eq!(fx.scheduler.run("ghost", rx).await, Outcome::ChatMissing);
    }

    #[tokio::test]
    async fn supervisor_deduplicates_and_cancels() {
        let fx = fixture(AssignmentSettings {
            poll_interval: Duration::from_millis(10),
            deadline: Duration::from_secs(60),
        })
        .await;
        let chat = fx.chat("order-1").await;
        let supervisor = AssignmentSupervisor::new(fx.scheduler.clone());

        assert!(supervisor.spawn(&chat.id));
        assert!(!supervisor.spawn(&chat.id));
        assert_eq!(supervisor.running(), 1);

        time::timeout(Duration::from_secs(2), supervisor.shutdown())
            .await
            .expect("tasks observe the shutdown signal");
        assert_eq!(supervisor.running(), 0);
        assert!(!supervisor.spawn(&chat.id));
    }

    #[tokio::test]
    async fn idle_supervisor_refuses_spawns_after_shutdown() {
        let fx = fixture(fast()).await;
        let chat = fx.chat("order-1").await;
        let supervisor = AssignmentSupervisor::new(fx.scheduler.clone());

        supervisor.shutdown().await;
        assert!(*supervisor.shutdown_signal().borrow());
        assert!(!supervisor.spawn(&chat.id));
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn resume_starts_tasks_for_waiting_chats() {
        let fx = fixture(fast()).await;
        let agent = fx.agent("ada", 0, 0).await;
        let closed = fx.chat("order-2").await;
        fx.lifecycle
            .assign(&closed.id, &agent.id, AgentList::Active)
            .await
            .unwrap();
        fx.lifecycle.close(&closed.id).await.unwrap();
        let waiting = fx.chat("order-1").await;

        let supervisor = AssignmentSupervisor::new(fx.scheduler.clone());
        let started = supervisor.resume_waiting(fx.store.as_ref()).await.unwrap();
        assert_eq!(started, 1);

        let assigned = time::timeout(Duration::from_secs(2), async {
            loop {
                let chat = fx.store.find_by_id(&waiting.id).await.unwrap().unwrap();
                if chat.status == ChatStatus::Active {
                    return chat;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("chat should be assigned");
        assert_eq!(assigned.cse_id.as_deref(), Some(agent.id.as_str()));
        supervisor.shutdown().await;
    }
}
