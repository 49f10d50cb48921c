//! HTTP / WebSocket 服务
//!
//! axum 路由、错误映射、端口回退、实时流连接循环。

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use super::handler::{Ingestor, SERVER_VERSION};
use crate::config::ServerConfig;
use crate::error::Error;
use crate::protocol::{
    DeleteResponse, ErrorResponse, HealthResponse, IngestResponse, RecentQuery, StatsQuery,
    StreamMessage,
};
use crate::types::IngestRequest;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub config: ServerConfig,
}

/// HTTP 错误
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        if e.is_client_error() {
            Self::bad_request(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::internal(format!("worker failed: {}", e))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// 在阻塞线程池中执行 Ingestor 操作
async fn blocking<T, F>(ingestor: &Arc<Ingestor>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Ingestor) -> crate::Result<T> + Send + 'static,
{
    let ingestor = ingestor.clone();
    Ok(tokio::task::spawn_blocking(move || f(&ingestor)).await??)
}

// ==================== 路由 ====================

/// 创建路由
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/events", post(receive_event))
        .route("/events/recent", get(recent_events))
        .route("/events/filter-options", get(filter_options))
        .route("/events/clear", post(clear_events))
        .route("/sessions/:session_id", delete(delete_session))
        .route("/stats", get(stats))
        .route("/stream", get(stream))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        clients: state.ingestor.broadcaster().connection_count(),
        version: SERVER_VERSION.to_string(),
    })
}

async fn receive_event(
    State(state): State<AppState>,
    body: std::result::Result<Json<IngestRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let Json(request) = body.map_err(|e| {
        tracing::debug!("Rejected event body: {}", e.body_text());
        ApiError::from(e)
    })?;

    let event = blocking(&state.ingestor, move |ingestor| ingestor.ingest(request)).await?;
    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            success: true,
            id: event.id,
        }),
    ))
}

async fn recent_events(
    State(state): State<AppState>,
    query: std::result::Result<Query<RecentQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let events = blocking(&state.ingestor, move |ingestor| ingestor.recent(query)).await?;
    Ok(Json(events))
}

async fn filter_options(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let window = state.config.filter_window;
    let options =
        blocking(&state.ingestor, move |ingestor| ingestor.filter_options(window)).await?;
    Ok(Json(options))
}

async fn stats(
    State(state): State<AppState>,
    query: std::result::Result<Query<StatsQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let stats = blocking(&state.ingestor, move |ingestor| {
        ingestor.stats(query.session_id.as_deref().filter(|s| !s.is_empty()))
    })
    .await?;
    Ok(Json(stats))
}

async fn clear_events(State(state): State<AppState>) -> ApiResult<Json<DeleteResponse>> {
    let deleted = blocking(&state.ingestor, |ingestor| ingestor.clear()).await?;
    Ok(Json(DeleteResponse {
        success: true,
        deleted,
    }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted =
        blocking(&state.ingestor, move |ingestor| ingestor.delete_session(&session_id)).await?;
    Ok(Json(DeleteResponse {
        success: true,
        deleted,
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new("not found")))
}

// ==================== 实时流 ====================

async fn stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 单个 WebSocket 连接
///
/// 订阅队列 → socket；socket 上的 ping → pong；定时发送心跳。
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let broadcaster = state.ingestor.broadcaster().clone();
    let mut subscription = broadcaster.subscribe();
    let conn_id = subscription.conn_id();
    tracing::debug!("📥 Stream connected: conn_id={}", conn_id);

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    // 第一次 tick 立即完成
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = subscription.recv_frame() => {
                let Some(frame) = frame else {
                    // 被广播器移除（队列满）
                    tracing::debug!("📡 Subscription dropped by hub: conn_id={}", conn_id);
                    break;
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(StreamMessage::Ping) = StreamMessage::from_frame(&text) {
                            broadcaster.send_to(conn_id, &StreamMessage::Pong);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("Stream read failed: conn_id={}, {}", conn_id, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                let Ok(frame) = StreamMessage::Ping.to_frame() else {
                    continue;
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    subscription.close();
    tracing::debug!("📤 Stream closed: conn_id={}", conn_id);
}

// ==================== 服务 ====================

/// HTTP / WebSocket 服务
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(ingestor: Arc<Ingestor>, config: ServerConfig) -> Self {
        Self {
            state: AppState { ingestor, config },
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// 绑定端口：首选端口被占用时依次尝试回退端口
    pub async fn bind(&self) -> Result<TcpListener> {
        let config = &self.state.config;
        let mut last_error = None;

        for port in config.candidate_ports() {
            let addr = format!("{}:{}", config.host, port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    if port != config.port {
                        tracing::warn!("⚠️ Port {} is in use, using {}", config.port, port);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    tracing::debug!("Port {} in use", port);
                    last_error = Some(e);
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to bind {}", addr)),
            }
        }

        Err(anyhow::anyhow!(
            "No available port in {}..={}: {}",
            config.port,
            config.fallback_ports.end(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// 在给定 listener 上提供服务，直到 `shutdown` 完成
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listener.local_addr().context("Failed to read local address")?;
        tracing::info!("🚀 Server listening on http://{}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("Server error")?;

        tracing::info!("🧹 Server stopped");
        Ok(())
    }

    /// 绑定并运行，直到收到 Ctrl-C
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("收到中断信号，准备退出...");
}
