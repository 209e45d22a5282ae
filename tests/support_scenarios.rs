use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use helpline::{
    chat::ChatStatus,
    config::Config,
    entity::{AgentList, AgentStatus, Capacity, Order, Role},
    error::{Conflict, Error},
    gateway::OutgoingMessage,
    lifecycle::ChatLifecycle,
    manager::SupportDesk,
    reaper::{IdleReaper, ReaperSettings},
    store::{AgentRegistry, ChatStore, MessageStore, SqliteStore},
};

const POLL: Duration = Duration::from_millis(20);

async fn store_with_orders(orders: &[(&str, &str)]) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    for (order_id, customer_id) in orders {
        store
            .record_order(&Order {
                id: order_id.to_string(),
                customer_id: customer_id.to_string(),
                chat_id: None,
            })
            .await
            .unwrap();
    }
    store
}

fn desk(store: &Arc<SqliteStore>) -> SupportDesk {
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.assignment.poll_interval = POLL;
    SupportDesk::new(store.clone(), store.clone(), store.clone(), &config)
}

async fn wait_for_status(store: &SqliteStore, chat_id: &str, status: ChatStatus) -> bool {
    for _ in 0..100 {
        let chat = store.find_by_id(chat_id).await.unwrap().unwrap();
        if chat.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn chat_waits_until_an_agent_comes_online() {
    let store = store_with_orders(&[("order-1", "user-1")]).await;
    let desk = desk(&store);

    let chat = desk.create_chat("order-1", "user-1").await.unwrap();
    assert_eq!(desk.assignments_running(), 1);

    tokio::time::sleep(POLL * 3).await;
    let waiting = store.find_by_id(&chat.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, ChatStatus::Waiting);
    assert_eq!(waiting.cse_id, None);

    let agent = desk.register_agent("carol", "Carol").await.unwrap();
    desk.set_agent_status(&agent.id, AgentStatus::Online)
        .await
        .unwrap();

    assert!(wait_for_status(&store, &chat.id, ChatStatus::Active).await);
    let active = store.find_by_id(&chat.id).await.unwrap().unwrap();
    assert_eq!(active.cse_id.as_deref(), Some(agent.id.as_str()));

    let agent = desk.find_agent(&agent.id).await.unwrap();
    assert_eq!(agent.active_count, 1);
    assert_eq!(agent.active_chat_ids, vec![chat.id.clone()]);
    assert!(agent.is_consistent());

    desk.shutdown().await;
    assert_eq!(desk.assignments_running(), 0);
}

#[tokio::test]
async fn second_chat_for_the_same_order_is_rejected() {
    let store = store_with_orders(&[("order-1", "user-1")]).await;
    let desk = desk(&store);

    desk.create_chat("order-1", "user-1").await.unwrap();
    let err = desk.create_chat("order-1", "user-1").await.unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::OrderAlreadyHasChat));

    desk.shutdown().await;
}

#[tokio::test]
async fn user_cannot_post_into_a_closed_chat() {
    let store = store_with_orders(&[("order-1", "user-1")]).await;
    let desk = desk(&store);

    let agent = desk.register_agent("bea", "Bea").await.unwrap();
    desk.set_agent_status(&agent.id, AgentStatus::Online)
        .await
        .unwrap();
    let chat = desk.create_chat("order-1", "user-1").await.unwrap();
    assert!(wait_for_status(&store, &chat.id, ChatStatus::Active).await);

    desk.send_message(OutgoingMessage {
        chat_id: chat.id.clone(),
        sender_id: "user-1".into(),
        receiver_id: agent.id.clone(),
        text: "is anyone there?".into(),
        role: Role::User,
    })
    .await
    .unwrap();
    desk.close_chat(&chat.id).await.unwrap();

    let err = desk
        .send_message(OutgoingMessage {
            chat_id: chat.id.clone(),
            sender_id: "user-1".into(),
            receiver_id: "support".into(),
            text: "hello?".into(),
            role: Role::User,
        })
        .await
        .unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::InvalidChatState));

    assert_eq!(store.list_by_chat(&chat.id).await.unwrap().len(), 1);
    let closed = store.find_by_id(&chat.id).await.unwrap().unwrap();
    assert_eq!(closed.message_ids.len(), 1);

    desk.shutdown().await;
}

#[tokio::test]
async fn cse_cannot_post_into_a_pending_chat() {
    let store = store_with_orders(&[("order-1", "user-1")]).await;
    let lifecycle = ChatLifecycle::new(store.clone(), store.clone(), Capacity::default());
    let desk = desk(&store);

    let agent = desk.register_agent("dan", "Dan").await.unwrap();
    store.set_status(&agent.id, AgentStatus::Online).await.unwrap();
    let chat = lifecycle.create("order-1", "user-1").await.unwrap();
    lifecycle
        .assign(&chat.id, &agent.id, AgentList::Pending)
        .await
        .unwrap();

    let err = desk
        .send_message(OutgoingMessage {
            chat_id: chat.id.clone(),
            sender_id: agent.id.clone(),
            receiver_id: "user-1".into(),
            text: "hi, I'm Dan".into(),
            role: Role::Cse,
        })
        .await
        .unwrap_err();
    assert_eq!(err.conflict(), Some(Conflict::InvalidChatState));

    desk.accept_chat(&chat.id, &agent.id).await.unwrap();
    desk.send_message(OutgoingMessage {
        chat_id: chat.id.clone(),
        sender_id: agent.id.clone(),
        receiver_id: "user-1".into(),
        text: "hi, I'm Dan".into(),
        role: Role::Cse,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn reaper_closes_chat_idle_for_six_minutes() {
    let store = store_with_orders(&[("order-1", "user-1")]).await;
    let lifecycle = Arc::new(ChatLifecycle::new(
        store.clone(),
        store.clone(),
        Capacity::default(),
    ));
    let reaper = IdleReaper::new(store.clone(), lifecycle.clone(), ReaperSettings::default());

    let agent = helpline::entity::Agent::new("erin", "Erin");
    store.register(&agent).await.unwrap();
    store.set_status(&agent.id, AgentStatus::Online).await.unwrap();
    let chat = lifecycle.create("order-1", "user-1").await.unwrap();
    lifecycle
        .assign(&chat.id, &agent.id, AgentList::Active)
        .await
        .unwrap();

    let now = Utc::now() + chrono::Duration::minutes(6);
    let report = reaper.sweep(now).await.unwrap();
    assert_eq!(report.closed, vec![chat.id.clone()]);

    let closed = store.find_by_id(&chat.id).await.unwrap().unwrap();
    assert_eq!(closed.status, ChatStatus::Closed);
    assert!(closed.date_closed.is_some());

    let agent = store.find_agent(&agent.id).await.unwrap().unwrap();
    assert!(agent.active_chat_ids.is_empty());
    assert_eq!(agent.closed_chat_ids, vec![chat.id]);
    assert_eq!(agent.active_count, 0);
}

#[tokio::test]
async fn only_the_owner_may_reopen() {
    let store = store_with_orders(&[("order-1", "user-1")]).await;
    let desk = desk(&store);

    let agent = desk.register_agent("finn", "Finn").await.unwrap();
    desk.set_agent_status(&agent.id, AgentStatus::Online)
        .await
        .unwrap();
    let chat = desk.create_chat("order-1", "user-1").await.unwrap();
    assert!(wait_for_status(&store, &chat.id, ChatStatus::Active).await);

    // Take the agent offline so the reopened chat stays waiting.
    desk.set_agent_status(&agent.id, AgentStatus::Offline)
        .await
        .unwrap();
    desk.close_chat(&chat.id).await.unwrap();

    let err = desk.reopen_chat(&chat.id, "user-2").await.unwrap_err();
    assert!(matches!(err, Error::Conflict(Conflict::NotOwner)));

    let reopened = desk.reopen_chat(&chat.id, "user-1").await.unwrap();
    assert_eq!(reopened.status, ChatStatus::Waiting);
    assert_eq!(reopened.cse_id, None);

    let stored = store.find_by_id(&chat.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ChatStatus::Waiting);
    assert_eq!(stored.cse_id, None);

    let agent = desk.find_agent(&agent.id).await.unwrap();
    assert!(agent.closed_chat_ids.is_empty());
    assert!(agent.is_consistent());

    desk.shutdown().await;
}
