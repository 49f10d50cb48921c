//! 服务端 - 接入、存储、广播
//!
//! - `broadcaster`：订阅者注册表与非阻塞扇出
//! - `handler`：写入后广播的接入处理器
//! - `service`：axum HTTP / WebSocket 路由（`server` feature）

mod broadcaster;
mod handler;
#[cfg(feature = "server")]
mod service;

pub use broadcaster::{Broadcaster, ConnId, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use handler::{Ingestor, SERVER_VERSION};
#[cfg(feature = "server")]
pub use service::{create_router, ApiError, AppState, Server};
