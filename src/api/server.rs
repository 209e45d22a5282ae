use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::entity::{AgentStatus, Role};
use crate::error::{Conflict, Error};
use crate::gateway::OutgoingMessage;
use crate::manager::SupportDesk;

// -----------------------------------------------------------------------------
// Request bodies
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub order_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct AcceptRequest {
    pub cse_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReopenRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub login: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AgentStatusRequest {
    pub status: AgentStatus,
}

// -----------------------------------------------------------------------------
// Error mapping
// -----------------------------------------------------------------------------

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(Conflict::NotOwner | Conflict::AccessDenied) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Error::Persistence(e) => {
                error!(error = %e, "Request failed in the store");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            Error::Persistence(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

// -----------------------------------------------------------------------------
// Server
// -----------------------------------------------------------------------------

pub struct ApiServer {
    desk: Arc<SupportDesk>,
}

impl ApiServer {
    pub fn new(desk: Arc<SupportDesk>) -> Self {
        Self { desk }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/chats", post(create_chat))
            .route("/chats/:id/messages", post(send_message))
            .route("/chats/:id/history", get(chat_history))
            .route("/chats/:id/accept", post(accept_chat))
            .route("/chats/:id/close", post(close_chat))
            .route("/chats/:id/reopen", post(reopen_chat))
            .route("/agents", get(list_agents).post(register_agent))
            .route("/agents/:id", get(get_agent))
            .route("/agents/:id/status", put(set_agent_status))
            .with_state(self.desk.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

async fn create_chat(
    State(desk): State<Arc<SupportDesk>>,
    Json(request): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, Error> {
    let chat = desk.create_chat(&request.order_id, &request.user_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Chat created successfully",
            "chat_id": chat.id,
        })),
    ))
}

async fn send_message(
    State(desk): State<Arc<SupportDesk>>,
    Path(chat_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, Error> {
    let message = desk
        .send_message(OutgoingMessage {
            chat_id,
            sender_id: request.sender_id,
            receiver_id: request.receiver_id,
            text: request.text,
            role: request.role,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Message sent successfully",
            "message_id": message.id,
        })),
    ))
}

async fn chat_history(
    State(desk): State<Arc<SupportDesk>>,
    Path(chat_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(desk.history(&chat_id).await?))
}

async fn accept_chat(
    State(desk): State<Arc<SupportDesk>>,
    Path(chat_id): Path<String>,
    Json(request): Json<AcceptRequest>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(desk.accept_chat(&chat_id, &request.cse_id).await?))
}

async fn close_chat(
    State(desk): State<Arc<SupportDesk>>,
    Path(chat_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(desk.close_chat(&chat_id).await?))
}

async fn reopen_chat(
    State(desk): State<Arc<SupportDesk>>,
    Path(chat_id): Path<String>,
    Json(request): Json<ReopenRequest>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(desk.reopen_chat(&chat_id, &request.user_id).await?))
}

async fn register_agent(
    State(desk): State<Arc<SupportDesk>>,
    Json(request): Json<RegisterAgentRequest>,
) -> Result<impl IntoResponse, Error> {
    let agent = desk.register_agent(&request.login, &request.name).await?;
    Ok((StatusCode::CREATED, Json(json!({ "agent_id": agent.id }))))
}

async fn list_agents(State(desk): State<Arc<SupportDesk>>) -> Result<impl IntoResponse, Error> {
    Ok(Json(desk.list_agents().await?))
}

async fn get_agent(
    State(desk): State<Arc<SupportDesk>>,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(desk.find_agent(&agent_id).await?))
}

async fn set_agent_status(
    State(desk): State<Arc<SupportDesk>>,
    Path(agent_id): Path<String>,
    Json(request): Json<AgentStatusRequest>,
) -> Result<impl IntoResponse, Error> {
    desk.set_agent_status(&agent_id, request.status).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entity::Order;
    use crate::store::SqliteStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<SqliteStore>, Arc<SupportDesk>) {
        let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.assignment.poll_interval = Duration::from_millis(10);
        let desk = Arc::new(SupportDesk::new(
            store.clone(),
            store.clone(),
            store.clone(),
            &config,
        ));
        let router = ApiServer::new(desk.clone()).router();
        (router, store, desk)
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn chat_flow_over_http() {
        let (router, store, desk) = app().await;
        store
            .record_order(&Order {
                id: "order-1".into(),
                customer_id: "user-1".into(),
                chat_id: None,
            })
            .await
            .unwrap();

        let (status, body) = call(
            &router,
            "POST",
            "/chats",
            Some(json!({ "order_id": "order-1", "user_id": "user-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let chat_id = body["chat_id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &router,
            "POST",
            "/chats",
            Some(json!({ "order_id": "order-1", "user_id": "user-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &router,
            "POST",
            &format!("/chats/{chat_id}/messages"),
            Some(json!({
                "sender_id": "user-1",
                "receiver_id": "support",
                "text": "my parcel is late",
                "role": "user"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&router, "GET", &format!("/chats/{chat_id}/history"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "waiting");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);

        // Nobody has picked the chat up yet.
        let (status, _) = call(&router, "POST", &format!("/chats/{chat_id}/close"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let agent = desk.register_agent("ada", "Ada").await.unwrap();
        desk.set_agent_status(&agent.id, AgentStatus::Online)
            .await
            .unwrap();
        let mut engaged = false;
        for _ in 0..100 {
            let (_, body) = call(&router, "GET", &format!("/chats/{chat_id}/history"), None).await;
            if body["status"] == "active" {
                engaged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engaged);

        let (status, body) = call(&router, "POST", &format!("/chats/{chat_id}/close"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "closed");

        let (status, _) = call(
            &router,
            "POST",
            &format!("/chats/{chat_id}/reopen"),
            Some(json!({ "user_id": "user-2" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &router,
            "POST",
            &format!("/chats/{chat_id}/reopen"),
            Some(json!({ "user_id": "user-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "waiting");

        desk.shutdown().await;
    }

    #[tokio::test]
    async fn agent_registration_and_status() {
        let (router, _store, _desk) = app().await;

        let (status, body) = call(
            &router,
            "POST",
            "/agents",
            Some(json!({ "login": "ada", "name": "Ada" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let agent_id = body["agent_id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &router,
            "PUT",
            &format!("/agents/{agent_id}/status"),
            Some(json!({ "status": "online" })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&router, "GET", &format!("/agents/{agent_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");

        let (status, _) = call(
            &router,
            "PUT",
            "/agents/ghost/status",
            Some(json!({ "status": "offline" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(
            &router,
            "POST",
            "/agents",
            Some(json!({ "login": "bob", "name": "Bob" })),
        )
        .await;
        let (status, body) = call(&router, "GET", "/agents", None).await;
        assert_eq!(status, StatusCode::OK);
        let agents = body.as_array().unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0]["login"], "ada");
        assert_eq!(agents[0]["status"], "online");
        assert_eq!(agents[1]["login"], "bob");
        assert_eq!(agents[1]["status"], "offline");
    }

    #[tokio::test]
    async fn unknown_chat_history_is_404() {
        let (router, _store, _desk) = app().await;
        let (status, body) = call(&router, "GET", "/chats/nope/history", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }
}
