//! command-center - 事件接入服务
//!
//! 负责：
//! - 接收 Hook 事件（POST /events）
//! - 持久化到 SQLite
//! - WebSocket 实时推送

use std::sync::Arc;

use anyhow::{Context, Result};
use command_center::{Broadcaster, EventStore, Ingestor, Server, ServerConfig, StoreConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("command_center=debug".parse()?))
        .init();

    tracing::info!("🚀 command-center v{}", command_center::VERSION);

    // 解析配置
    let store_config = StoreConfig::from_env();
    let server_config = ServerConfig::from_env();

    let store = Arc::new(EventStore::open(store_config).context("打开事件存储失败")?);
    let broadcaster = Broadcaster::with_capacity(server_config.queue_capacity);
    let ingestor = Arc::new(Ingestor::new(store, broadcaster));

    Server::new(ingestor, server_config).run().await?;

    tracing::info!("👋 command-center exiting");
    Ok(())
}
