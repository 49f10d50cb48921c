//! command-center - AI 编码助手 Hook 事件的接入、存储与实时分发
//!
//! Hook 脚本把工具调用和 Agent 协议事件发到服务端；服务端持久化后广播给所有观察者，
//! 观察者在本地重建会话 / 项目视图。
//!
//! # 核心功能
//!
//! - **Event Store**: 只追加的 SQLite 日志，单调 ID，有界保留
//! - **广播**: 写入后广播，非阻塞扇出，慢订阅者断开后由回填补齐
//! - **质量门**: 统一的置信度阈值判定与 Agent 协议状态机
//! - **Reconciler**: 回填 + 实时订阅 + 去重 + 重连
//! - **聚合**: 增量维护的会话 / 项目计数
//!
//! # Feature Flags
//!
//! - `server`: axum HTTP 接入 + WebSocket 推送
//! - `client`: Socket 传输（reqwest + tokio-tungstenite）
//!
//! # 数据流
//!
//! producer → `server::Ingestor` → `store::EventStore` → `server::Broadcaster`
//! → `client::Reconciler` → `aggregate::Aggregator`

pub mod aggregate;
pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod payload;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod store;
pub mod types;

// Re-exports
pub use aggregate::{Aggregator, ProjectGroup, ProjectView, SessionView};
pub use client::{
    select_transport, BusTransport, ConnectionState, Reconciler, ReconcilerListener, SeenSet,
    Transport,
};
pub use config::{ReconcilerConfig, ServerConfig, StoreConfig, TransportKind};
pub use error::{Error, Result};
pub use gate::{AgentHandoff, AgentRun, AgentType, GateRecord, Phase, Verdict};
pub use payload::{EventPayload, Metrics, Totals};
pub use protocol::StreamMessage;
pub use server::{Broadcaster, Ingestor, Subscription};
pub use store::EventStore;
pub use types::*;

#[cfg(feature = "client")]
pub use client::SocketTransport;

#[cfg(feature = "server")]
pub use server::Server;

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
