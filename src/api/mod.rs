//! HTTP 控制面
//!
//! 轻量的 REST 接口：提交 / 轮询 / 取消工作流任务，维护知识库。
//! 所有响应为 JSON；任务本身在后台运行，接口立即返回任务 id。

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::bridge::{PeerTransport, WsTransport};
use crate::config::BridgeSection;
use crate::knowledge::{KnowledgeStore, Section, SectionCreate, SectionUpdate};
use crate::llm::ReplyGenerator;
use crate::workflow::{Orchestrator, TaskTable};

/// 批量任务未指定 count 时的默认封数
const DEFAULT_BULK_COUNT: usize = 10;
/// 对话接口保留的历史条数
const CHAT_HISTORY_LIMIT: usize = 5;

/// 各 handler 共享的应用状态
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub table: Arc<TaskTable>,
    pub knowledge: Arc<KnowledgeStore>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub llm_timeout: std::time::Duration,
    pub bridge: BridgeSection,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/tasks/email", post(start_email_task))
        .route("/api/tasks/bulk", post(start_bulk_task))
        .route("/api/tasks/clear", post(clear_tasks))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id", delete(cancel_task))
        .route("/api/knowledge", get(list_knowledge))
        .route("/api/knowledge", post(create_knowledge))
        .route("/api/knowledge/sync", post(sync_knowledge))
        .route("/api/knowledge/:id", put(update_knowledge))
        .route("/api/knowledge/:id", delete(delete_knowledge))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    user_id: Option<String>,
    #[serde(default)]
    conversation_history: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct StartEmailRequest {
    slate_url: String,
}

#[derive(Debug, Deserialize)]
struct StartBulkRequest {
    inbox_url: String,
    count: Option<usize>,
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": what}))).into_response()
}

fn storage_error(e: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response()
}

/// 健康探针：顺带短连接试探一次桥接对端
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let probe = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        WsTransport::connect(&state.bridge.peer_url, state.bridge.keepalive_secs),
    )
    .await;
    let bridge_connected = match probe {
        Ok(Ok((transport, _inbound))) => {
            transport.close().await;
            true
        }
        _ => false,
    };

    Json(json!({
        "status": "ok",
        "bridge_connected": bridge_connected,
        "peer_url": state.bridge.peer_url,
        "running_tasks": state.table.running_count().await,
        "total_tasks": state.table.total_count().await,
    }))
}

/// 咨询对话：知识库检索 + 生成器直接作答（不经过浏览器桥接）
async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "message is required"})),
        )
            .into_response();
    }
    tracing::info!(
        "Chat request from {}",
        req.user_id.as_deref().unwrap_or("anonymous")
    );

    let hits = state.knowledge.query(&req.message).await;
    let prompt = build_chat_prompt(&req.message, &req.conversation_history, &hits);

    match state.generator.generate(&prompt, state.llm_timeout).await {
        Ok(reply) => Json(json!({
            "response": reply,
            "knowledge_ids": hits.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Chat generation failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

fn build_chat_prompt(message: &str, history: &[ChatMessage], sections: &[Section]) -> String {
    let mut prompt = String::from(
        "You are assisting students and enrollment advisors of the Office of Graduate \
         Admissions at Illinois Institute of Technology.\n\n",
    );

    let recent = history.len().saturating_sub(CHAT_HISTORY_LIMIT);
    if !history[recent..].is_empty() {
        prompt.push_str("Previous conversation:\n");
        for msg in &history[recent..] {
            prompt.push_str(&format!("{}: {}\n", msg.role, msg.content));
        }
        prompt.push('\n');
    }

    if !sections.is_empty() {
        prompt.push_str("Relevant knowledge base entries:\n");
        for section in sections {
            prompt.push_str(&format!("### {}\n{}\n\n", section.title, section.content));
        }
    }

    prompt.push_str(&format!(
        "Inquiry:\n{}\n\n\
         Answer accurately from the knowledge base entries where applicable; if they \
         lack the specific information, acknowledge that and give general guidance. \
         Keep the answer concise, professional, and ready to copy-paste.",
        message
    ));
    prompt
}

async fn start_email_task(
    State(state): State<AppState>,
    Json(req): Json<StartEmailRequest>,
) -> Response {
    if req.slate_url.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "slate_url is required"})),
        )
            .into_response();
    }
    let task_id = Arc::clone(&state.orchestrator)
        .start_single(&req.slate_url)
        .await;
    tracing::info!("Started single email task {}", task_id);
    Json(json!({"task_id": task_id})).into_response()
}

async fn start_bulk_task(
    State(state): State<AppState>,
    Json(req): Json<StartBulkRequest>,
) -> Response {
    if req.inbox_url.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "inbox_url is required"})),
        )
            .into_response();
    }
    let count = req.count.unwrap_or(DEFAULT_BULK_COUNT);
    let task_id = Arc::clone(&state.orchestrator)
        .start_bulk(&req.inbox_url, count)
        .await;
    tracing::info!("Started bulk email task {} (up to {} emails)", task_id, count);
    Json(json!({"task_id": task_id})).into_response()
}

async fn list_tasks(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tasks = state.table.list().await;
    Json(json!({
        "count": tasks.len(),
        "running": state.table.running_count().await,
        "tasks": tasks,
    }))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.table.get(&id).await {
        Some(task) => Json(task).into_response(),
        None => not_found("Task not found"),
    }
}

/// 取消是协作式的：这里只翻状态，编排器在下一步边界停下
async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.table.get(&id).await.is_none() {
        return not_found("Task not found");
    }
    let cancelled = state.table.cancel(&id).await;
    Json(json!({"task_id": id, "cancelled": cancelled})).into_response()
}

async fn clear_tasks(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cleared = state.table.clear_finished().await;
    Json(json!({"cleared": cleared}))
}

async fn list_knowledge(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sections = state.knowledge.list().await;
    Json(json!({"count": sections.len(), "sections": sections}))
}

async fn create_knowledge(
    State(state): State<AppState>,
    Json(req): Json<SectionCreate>,
) -> Response {
    match state.knowledge.create(req).await {
        Ok(section) => (StatusCode::CREATED, Json(section)).into_response(),
        Err(e) => storage_error(e),
    }
}

async fn update_knowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SectionUpdate>,
) -> Response {
    match state.knowledge.update(&id, req).await {
        Ok(Some(section)) => Json(section).into_response(),
        Ok(None) => not_found("Knowledge section not found"),
        Err(e) => storage_error(e),
    }
}

async fn delete_knowledge(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.knowledge.delete(&id).await {
        Ok(true) => Json(json!({"deleted": id})).into_response(),
        Ok(false) => not_found("Knowledge section not found"),
        Err(e) => storage_error(e),
    }
}

async fn sync_knowledge(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.knowledge.resync().await;
    Json(json!({"status": "ok"}))
}
