//! HTTP / WebSocket 控制面
//!
//! 端点：
//! - POST /api/start       上传数据文件 + 分析需求，返回 session_id 与订阅地址
//! - POST /api/start-sync  同步执行到终态，一次性返回报告与全量事件
//! - POST /api/stop/{id}   请求取消
//! - GET  /ws/{id}         订阅事件流（先 connected 握手，再回放积压，后实时）
//! - GET  /api/result/{id} 终态结果（报告 + 图表）
//! - GET  /api/health      健康检查

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use crate::core::AgentError;
use crate::event::{AgentEvent, Envelope};
use crate::session::SessionManager;

pub fn router(manager: Arc<SessionManager>) -> Router {
    // 上传体积上限 = 数据文件上限 + 表单开销
    let body_limit = manager.config().server.max_file_size_bytes as usize + 1024 * 1024;
    Router::new()
        .route("/api/start", post(api_start))
        .route("/api/start-sync", post(api_start_sync))
        .route("/api/stop/:session_id", post(api_stop))
        .route("/api/result/:session_id", get(api_result))
        .route("/api/health", get(api_health))
        .route("/ws/:session_id", get(ws_subscribe))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(manager)
}

/// AgentError → HTTP 响应
fn error_response(e: AgentError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        AgentError::InvalidInput(_) | AgentError::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
        AgentError::UnknownSession(_) => StatusCode::NOT_FOUND,
        AgentError::SessionNotReady(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.kind(), "detail": e.to_string()})))
}

#[derive(Debug, Serialize)]
struct StartResponse {
    status: &'static str,
    session_id: String,
    ws_url: String,
}

/// 解析 multipart：file（文件名 + 内容）、user_request、可选 mode
async fn parse_start_multipart(
    mut multipart: Multipart,
) -> Result<(String, Vec<u8>, String, Option<String>), AgentError> {
    let mut filename = None;
    let mut bytes = None;
    let mut user_request = None;
    let mut mode = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AgentError::InvalidInput(format!("multipart: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                filename = field.file_name().map(String::from);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AgentError::InvalidInput(format!("file field: {}", e)))?
                        .to_vec(),
                );
            }
            "user_request" => {
                user_request = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AgentError::InvalidInput(format!("user_request: {}", e)))?,
                );
            }
            "mode" => {
                mode = field.text().await.ok().filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }
    let bytes = bytes.ok_or_else(|| AgentError::InvalidInput("missing file field".into()))?;
    let filename = filename.unwrap_or_else(|| "dataset.csv".to_string());
    let user_request =
        user_request.ok_or_else(|| AgentError::InvalidInput("missing user_request".into()))?;
    Ok((filename, bytes, user_request, mode))
}

async fn api_start(
    State(manager): State<Arc<SessionManager>>,
    multipart: Multipart,
) -> impl IntoResponse {
    let (filename, bytes, user_request, mode) = match parse_start_multipart(multipart).await {
        Ok(parts) => parts,
        Err(e) => return error_response(e).into_response(),
    };
    match manager.start(filename, bytes, user_request, mode).await {
        Ok(session_id) => {
            let ws_url = format!("/ws/{}", session_id);
            (
                StatusCode::OK,
                Json(serde_json::to_value(StartResponse { status: "started", session_id, ws_url }).unwrap_or_default()),
            )
                .into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// 同步启动：跑到终态，返回报告与全量事件（不需要实时进度的场景）
async fn api_start_sync(
    State(manager): State<Arc<SessionManager>>,
    multipart: Multipart,
) -> impl IntoResponse {
    let (filename, bytes, user_request, mode) = match parse_start_multipart(multipart).await {
        Ok(parts) => parts,
        Err(e) => return error_response(e).into_response(),
    };
    let session_id = match manager.start(filename, bytes, user_request, mode).await {
        Ok(id) => id,
        Err(e) => return error_response(e).into_response(),
    };
    let subscription = match manager.subscribe(&session_id).await {
        Ok(s) => s,
        Err(e) => return error_response(e).into_response(),
    };
    let events: Vec<serde_json::Value> = subscription
        .drain()
        .await
        .iter()
        .map(|e| serde_json::to_value(&**e).unwrap_or_default())
        .collect();
    match manager.fetch(&session_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "status": outcome.phase.as_str(),
                "session_id": session_id,
                "report": outcome.final_report,
                "images": outcome.images,
                "events": events,
            })),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn api_stop(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match manager.stop(&session_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "stopping", "session_id": session_id})),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn api_result(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match manager.fetch(&session_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "status": outcome.phase.as_str(),
                "session_id": session_id,
                "report": outcome.final_report,
                "images": outcome.images,
                "tasks": outcome.snapshot.tasks,
                "iterations": outcome.snapshot.iteration,
            })),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn api_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ws_subscribe(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let heartbeat = Duration::from_secs(manager.config().server.ws_heartbeat_secs);
    match manager.subscribe(&session_id).await {
        Ok(subscription) => ws
            .on_upgrade(move |socket| ws_session(socket, session_id, subscription, heartbeat))
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// WebSocket 会话：握手 → 回放 + 实时 → 终止后关闭；空闲心跳，"ping" 文本回 pong
async fn ws_session(
    mut socket: WebSocket,
    session_id: String,
    mut subscription: crate::event::Subscription,
    heartbeat: Duration,
) {
    tracing::info!(session_id = %session_id, "ws subscriber attached");

    let connected = Envelope::new(&session_id, &AgentEvent::Connected);
    if send_envelope(&mut socket, &connected).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.reset();
    loop {
        tokio::select! {
            event = subscription.next() => {
                match event {
                    Some(envelope) => {
                        if send_envelope(&mut socket, &envelope).await.is_err() {
                            break;
                        }
                        if envelope.is_terminal() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) if text == "ping" => {
                        if socket
                            .send(WsMessage::Text("{\"type\":\"pong\"}".to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if socket
                    .send(WsMessage::Text("{\"type\":\"heartbeat\"}".to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
    tracing::info!(session_id = %session_id, "ws subscriber detached");
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    socket.send(WsMessage::Text(text)).await
}
