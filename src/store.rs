use crate::{
    chat::{Chat, ChatStatus, Message},
    entity::{Agent, AgentList, AgentStatus, Order},
    error::{Conflict, Error, Result},
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    ConnectOptions, Sqlite, SqlitePool, Transaction,
};
use std::{path::Path, str::FromStr, time::Duration};

/// Persisted chat records.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert a new chat and link it onto its order. Fails with
    /// `Conflict::OrderAlreadyHasChat` if the order already carries a chat.
    async fn create(&self, chat: &Chat) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Chat>>;

    async fn find_by_status(&self, status: ChatStatus) -> Result<Vec<Chat>>;

    /// Move `id` from `from` to `to`. Returns false if the chat was not in `from`.
    async fn update_status(&self, id: &str, from: ChatStatus, to: ChatStatus) -> Result<bool>;

    /// Assign a waiting chat. Returns false if the chat was no longer waiting.
    async fn set_assignment(&self, id: &str, cse_id: &str, status: ChatStatus) -> Result<bool>;

    /// Close a chat that is still in `from`. Returns false otherwise.
    async fn mark_closed(&self, id: &str, from: ChatStatus, at: DateTime<Utc>) -> Result<bool>;

    /// Return a closed chat to waiting, clearing its assignment.
    async fn mark_reopened(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Link a message onto an open chat. A closed chat is left untouched and the
    /// call fails with `Conflict::InvalidChatState`.
    async fn append_message(&self, id: &str, message_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Chats in any of `statuses` whose last message is older than `older_than`.
    async fn find_idle(
        &self,
        statuses: &[ChatStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Chat>>;
}

/// Persisted agent records with their chat lists and counters.
///
/// Every mutation is atomic per agent: a capacity-limited move only lands if the
/// counter is under the limit at write time.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn register(&self, agent: &Agent) -> Result<()>;

    async fn find_agent(&self, id: &str) -> Result<Option<Agent>>;

    async fn set_status(&self, id: &str, status: AgentStatus) -> Result<()>;

    /// Every agent in registration order.
    async fn find_all(&self) -> Result<Vec<Agent>>;

    /// Online agents in registration order.
    async fn find_online(&self) -> Result<Vec<Agent>>;

    /// Append `chat_id` to a counted list of an online agent if the counter is
    /// below `limit`, else `Error::CapacityExhausted`.
    async fn reserve(&self, cse_id: &str, chat_id: &str, list: AgentList, limit: u32)
        -> Result<()>;

    /// Move `chat_id` between two of the agent's lists, adjusting counters. A
    /// `limit` caps the destination counter.
    async fn transfer(
        &self,
        cse_id: &str,
        chat_id: &str,
        from: AgentList,
        to: AgentList,
        limit: Option<u32>,
    ) -> Result<()>;

    /// Drop `chat_id` from one of the agent's lists.
    async fn release(&self, cse_id: &str, chat_id: &str, list: AgentList) -> Result<()>;

    /// Move `chat_id` to the closed list from whichever counted list holds it.
    /// Returns the list it left, or `None` if neither counted list had it.
    async fn retire(&self, cse_id: &str, chat_id: &str) -> Result<Option<AgentList>>;

    async fn reserve_active(&self, cse_id: &str, chat_id: &str, limit: u32) -> Result<()> {
        self.reserve(cse_id, chat_id, AgentList::Active, limit).await
    }

    async fn reserve_pending(&self, cse_id: &str, chat_id: &str, limit: u32) -> Result<()> {
        self.reserve(cse_id, chat_id, AgentList::Pending, limit).await
    }

    async fn promote(&self, cse_id: &str, chat_id: &str, limit: u32) -> Result<()> {
        self.transfer(cse_id, chat_id, AgentList::Pending, AgentList::Active, Some(limit))
            .await
    }

    async fn release_to_closed(&self, cse_id: &str, chat_id: &str, from: AgentList) -> Result<()> {
        self.transfer(cse_id, chat_id, from, AgentList::Closed, None)
            .await
    }

    async fn release_from_closed(&self, cse_id: &str, chat_id: &str) -> Result<()> {
        self.release(cse_id, chat_id, AgentList::Closed).await
    }
}

/// Persisted messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &Message) -> Result<()>;

    /// Delete a message that could not be linked onto its chat.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Messages of a chat, oldest first.
    async fn list_by_chat(&self, chat_id: &str) -> Result<Vec<Message>>;
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: String,
    order_id: String,
    user_id: String,
    cse_id: Option<String>,
    status: String,
    date_created: DateTime<Utc>,
    date_closed: Option<DateTime<Utc>>,
    last_message_time: DateTime<Utc>,
    message_ids: String,
}

impl ChatRow {
    fn into_chat(self) -> Result<Chat> {
        let message_ids: Vec<String> = serde_json::from_str(&self.message_ids)
            .with_context(|| format!("Failed to decode message ids of chat {}", self.id))?;

        Ok(Chat {
            status: self.status.parse()?,
            id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            cse_id: self.cse_id,
            date_created: self.date_created,
            date_closed: self.date_closed,
            last_message_time: self.last_message_time,
            message_ids,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    login: String,
    name: String,
    status: String,
    active_count: i64,
    pending_count: i64,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    sender_id: String,
    receiver_id: String,
    text: String,
    timestamp: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            text: row.text,
            timestamp: row.timestamp,
        }
    }
}

const CHAT_COLUMNS: &str = "id, order_id, user_id, cse_id, status, date_created, date_closed, last_message_time, message_ids";

fn counter(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .with_context(|| format!("Agent {field} out of range: {value}"))
        .map_err(Error::from)
}

impl SqliteStore {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database on a single pinned connection.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                chat_id TEXT
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                cse_id TEXT,
                status TEXT NOT NULL,
                date_created DATETIME NOT NULL,
                date_closed DATETIME,
                last_message_time DATETIME NOT NULL,
                message_ids TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_chats_status_last ON chats(status, last_message_time);

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                login TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'offline',
                active_count INTEGER NOT NULL DEFAULT 0,
                pending_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_chats (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                list TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_chats_agent ON agent_chats(agent_id, list);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_timestamp ON messages(chat_id, timestamp);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Record or refresh an order. Orders are owned by the order service; this is
    /// the write path it uses against the shared database.
    pub async fn record_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, customer_id, chat_id)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                customer_id = excluded.customer_id,
                chat_id = excluded.chat_id
            "#,
        )
        .bind(&order.id)
        .bind(&order.customer_id)
        .bind(&order.chat_id)
        .execute(&self.pool)
        .await
        .context("Failed to save order")?;

        Ok(())
    }

    pub async fn find_order(&self, id: &str) -> Result<Option<Order>> {
        let row: Option<(String, String, Option<String>)> =
            sqlx::query_as("SELECT id, customer_id, chat_id FROM orders WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch order")?;

        Ok(row.map(|(id, customer_id, chat_id)| Order {
            id,
            customer_id,
            chat_id,
        }))
    }

    async fn agent_lists(&self, agent: AgentRow) -> Result<Agent> {
        let entries: Vec<(String, String)> = sqlx::query_as(
            "SELECT chat_id, list FROM agent_chats WHERE agent_id = ? ORDER BY seq ASC",
        )
        .bind(&agent.id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch agent chat lists")?;

        let mut active_chat_ids = Vec::new();
        let mut pending_chat_ids = Vec::new();
        let mut closed_chat_ids = Vec::new();
        for (chat_id, list) in entries {
            match list.parse::<AgentList>()? {
                AgentList::Active => active_chat_ids.push(chat_id),
                AgentList::Pending => pending_chat_ids.push(chat_id),
                AgentList::Closed => closed_chat_ids.push(chat_id),
            }
        }

        Ok(Agent {
            status: agent.status.parse()?,
            active_count: counter(agent.active_count, "active_count")?,
            pending_count: counter(agent.pending_count, "pending_count")?,
            id: agent.id,
            login: agent.login,
            name: agent.name,
            active_chat_ids,
            pending_chat_ids,
            closed_chat_ids,
            created_at: agent.created_at,
        })
    }

    async fn agent_exists(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to look up agent")?;
        Ok(found.is_some())
    }

    /// Remove one list entry and decrement its counter. Returns false if the
    /// entry did not exist.
    async fn take_entry(
        tx: &mut Transaction<'_, Sqlite>,
        cse_id: &str,
        chat_id: &str,
        list: AgentList,
    ) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM agent_chats WHERE agent_id = ? AND chat_id = ? AND list = ?",
        )
        .bind(cse_id)
        .bind(chat_id)
        .bind(list.as_str())
        .execute(&mut **tx)
        .await
        .context("Failed to remove agent chat entry")?
        .rows_affected();

        if removed == 0 {
            return Ok(false);
        }

        if let Some(column) = list.counter_column() {
            sqlx::query(&format!(
                "UPDATE agents SET {column} = {column} - ? WHERE id = ? AND {column} >= ?"
            ))
            .bind(removed as i64)
            .bind(cse_id)
            .bind(removed as i64)
            .execute(&mut **tx)
            .await
            .context("Failed to decrement agent counter")?;
        }

        Ok(true)
    }

    /// Increment the destination counter (bounded by `limit`) and append the entry.
    /// Returns false if the limit was hit or the agent is gone.
    async fn put_entry(
        tx: &mut Transaction<'_, Sqlite>,
        cse_id: &str,
        chat_id: &str,
        list: AgentList,
        limit: Option<u32>,
        require_online: bool,
    ) -> Result<bool> {
        let online = if require_online {
            " AND status = 'online'"
        } else {
            ""
        };

        let updated = match (list.counter_column(), limit) {
            (Some(column), Some(limit)) => sqlx::query(&format!(
                "UPDATE agents SET {column} = {column} + 1 WHERE id = ? AND {column} < ?{online}"
            ))
            .bind(cse_id)
            .bind(i64::from(limit))
            .execute(&mut **tx)
            .await,
            (Some(column), None) => sqlx::query(&format!(
                "UPDATE agents SET {column} = {column} + 1 WHERE id = ?{online}"
            ))
            .bind(cse_id)
            .execute(&mut **tx)
            .await,
            (None, _) => sqlx::query(&format!("UPDATE agents SET id = id WHERE id = ?{online}"))
                .bind(cse_id)
                .execute(&mut **tx)
                .await,
        }
        .context("Failed to update agent counter")?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        sqlx::query("INSERT INTO agent_chats (agent_id, chat_id, list) VALUES (?, ?, ?)")
            .bind(cse_id)
            .bind(chat_id)
            .bind(list.as_str())
            .execute(&mut **tx)
            .await
            .context("Failed to append agent chat entry")?;

        Ok(true)
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create(&self, chat: &Chat) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let linked = sqlx::query("UPDATE orders SET chat_id = ? WHERE id = ? AND chat_id IS NULL")
            .bind(&chat.id)
            .bind(&chat.order_id)
            .execute(&mut *tx)
            .await
            .context("Failed to link chat onto order")?
            .rows_affected();

        if linked == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM orders WHERE id = ?")
                .bind(&chat.order_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to look up order")?;
            return match exists {
                Some(_) => Err(Conflict::OrderAlreadyHasChat.into()),
                None => Err(Error::not_found("order", &chat.order_id)),
            };
        }

        let message_ids =
            serde_json::to_string(&chat.message_ids).context("Failed to encode message ids")?;

        sqlx::query(
            r#"
            INSERT INTO chats (id, order_id, user_id, cse_id, status, date_created, date_closed, last_message_time, message_ids)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chat.id)
        .bind(&chat.order_id)
        .bind(&chat.user_id)
        .bind(&chat.cse_id)
        .bind(chat.status.as_str())
        .bind(chat.date_created)
        .bind(chat.date_closed)
        .bind(chat.last_message_time)
        .bind(message_ids)
        .execute(&mut *tx)
        .await
        .context("Failed to save chat")?;

        tx.commit().await.context("Failed to commit chat creation")?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Chat>> {
        let row = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chat")?;

        row.map(ChatRow::into_chat).transpose()
    }

    async fn find_by_status(&self, status: ChatStatus) -> Result<Vec<Chat>> {
        let rows = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE status = ? ORDER BY date_created ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chats by status")?;

        rows.into_iter().map(ChatRow::into_chat).collect()
    }

    async fn update_status(&self, id: &str, from: ChatStatus, to: ChatStatus) -> Result<bool> {
        let updated = sqlx::query("UPDATE chats SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to update chat status")?
            .rows_affected();

        Ok(updated == 1)
    }

    async fn set_assignment(&self, id: &str, cse_id: &str, status: ChatStatus) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE chats SET cse_id = ?, status = ? WHERE id = ? AND status = 'waiting'",
        )
        .bind(cse_id)
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to assign chat")?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn mark_closed(&self, id: &str, from: ChatStatus, at: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE chats SET status = 'closed', date_closed = ? WHERE id = ? AND status = ?",
        )
        .bind(at)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to close chat")?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn mark_reopened(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE chats
            SET status = 'waiting', cse_id = NULL, date_closed = NULL, last_message_time = ?
            WHERE id = ? AND status = 'closed'
            "#,
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to reopen chat")?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn append_message(&self, id: &str, message_id: &str, at: DateTime<Utc>) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE chats
            SET message_ids = json_insert(message_ids, '$[#]', ?), last_message_time = ?
            WHERE id = ? AND status != 'closed'
            "#,
        )
        .bind(message_id)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to append message to chat")?
        .rows_affected();

        if updated == 0 {
            return match self.find_by_id(id).await? {
                Some(_) => Err(Conflict::InvalidChatState.into()),
                None => Err(Error::not_found("chat", id)),
            };
        }
        Ok(())
    }

    async fn find_idle(
        &self,
        statuses: &[ChatStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Chat>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE status IN ({placeholders}) AND last_message_time < ? ORDER BY last_message_time ASC"
        );

        let mut query = sqlx::query_as::<_, ChatRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch idle chats")?;

        rows.into_iter().map(ChatRow::into_chat).collect()
    }
}

#[async_trait]
impl AgentRegistry for SqliteStore {
    async fn register(&self, agent: &Agent) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO agents (id, login, name, status, active_count, pending_count, created_at)
            VALUES (?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.login)
        .bind(&agent.name)
        .bind(agent.status.as_str())
        .bind(agent.created_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::validation(
                "login",
                format!("'{}' is already registered", agent.login),
            )),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to save agent").into()),
        }
    }

    async fn find_agent(&self, id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query_as::<_, AgentRow>(
            "SELECT id, login, name, status, active_count, pending_count, created_at FROM agents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch agent")?;

        match row {
            Some(row) => Ok(Some(self.agent_lists(row).await?)),
            None => Ok(None),
        }
    }

    async fn set_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let updated = sqlx::query("UPDATE agents SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update agent status")?
            .rows_affected();

        if updated == 0 {
            return Err(Error::not_found("agent", id));
        }
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, login, name, status, active_count, pending_count, created_at
            FROM agents
            ORDER BY rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch agents")?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            agents.push(self.agent_lists(row).await?);
        }
        Ok(agents)
    }

    async fn find_online(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, login, name, status, active_count, pending_count, created_at
            FROM agents
            WHERE status = 'online'
            ORDER BY rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch online agents")?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            agents.push(self.agent_lists(row).await?);
        }
        Ok(agents)
    }

    async fn reserve(
        &self,
        cse_id: &str,
        chat_id: &str,
        list: AgentList,
        limit: u32,
    ) -> Result<()> {
        if list.counter_column().is_none() {
            return Err(Error::validation("agent list", "only counted lists can be reserved"));
        }

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if !Self::put_entry(&mut tx, cse_id, chat_id, list, Some(limit), true).await? {
            return if Self::agent_exists(&mut tx, cse_id).await? {
                Err(Error::CapacityExhausted)
            } else {
                Err(Error::not_found("agent", cse_id))
            };
        }

        tx.commit().await.context("Failed to commit reservation")?;
        Ok(())
    }

    async fn transfer(
        &self,
        cse_id: &str,
        chat_id: &str,
        from: AgentList,
        to: AgentList,
        limit: Option<u32>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if !Self::take_entry(&mut tx, cse_id, chat_id, from).await? {
            return Err(Error::not_found(
                "agent chat entry",
                format!("{cse_id}/{from}/{chat_id}"),
            ));
        }

        if !Self::put_entry(&mut tx, cse_id, chat_id, to, limit, false).await? {
            // Dropping the transaction rolls back the removal above.
            return Err(Error::CapacityExhausted);
        }

        tx.commit().await.context("Failed to commit agent list transfer")?;
        Ok(())
    }

    async fn release(&self, cse_id: &str, chat_id: &str, list: AgentList) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if !Self::take_entry(&mut tx, cse_id, chat_id, list).await? {
            return Err(Error::not_found(
                "agent chat entry",
                format!("{cse_id}/{list}/{chat_id}"),
            ));
        }

        tx.commit().await.context("Failed to commit agent list release")?;
        Ok(())
    }

    async fn retire(&self, cse_id: &str, chat_id: &str) -> Result<Option<AgentList>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let mut from = None;
        for list in [AgentList::Active, AgentList::Pending] {
            if Self::take_entry(&mut tx, cse_id, chat_id, list).await? {
                from = Some(list);
                break;
            }
        }
        let Some(from) = from else {
            return Ok(None);
        };

        if !Self::put_entry(&mut tx, cse_id, chat_id, AgentList::Closed, None, false).await? {
            return Err(Error::not_found("agent", cse_id));
        }

        tx.commit().await.context("Failed to commit agent list retire")?;
        Ok(Some(from))
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, sender_id, receiver_id, text, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.text)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to save message")?;

        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete message")?;

        Ok(())
    }

    async fn list_by_chat(&self, chat_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, chat_id, sender_id, receiver_id, text, timestamp
            FROM messages
            WHERE chat_id = ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat history")?;

        Ok(rows.into_iter().map(Message::from).collect())
    }
}
