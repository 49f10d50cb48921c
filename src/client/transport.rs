//! 传输抽象
//!
//! Reconciler 只依赖 [`Transport`]：回填、实时订阅、两个控制操作。
//! 具体实现在启动时选择一次。

use std::sync::Arc;

use async_trait::async_trait;

use super::bus::BusTransport;
use crate::config::{ReconcilerConfig, TransportKind};
use crate::error::{Error, Result};
use crate::protocol::StreamMessage;
use crate::server::Ingestor;
use crate::types::Event;

/// 实时流
#[async_trait]
pub trait LiveStream: Send {
    /// 下一条消息；流结束（断线、被广播器移除）返回 None
    async fn next(&mut self) -> Option<StreamMessage>;
}

/// 传输
#[async_trait]
pub trait Transport: Send + Sync {
    /// 传输名（日志用）
    fn name(&self) -> &'static str;

    /// 拉取最近的事件（顺序不限，调用方自行排序）
    async fn backfill(&self, limit: usize) -> anyhow::Result<Vec<Event>>;

    /// 打开实时订阅
    async fn subscribe(&self) -> anyhow::Result<Box<dyn LiveStream>>;

    /// 清空全部事件
    async fn clear(&self) -> anyhow::Result<()>;

    /// 删除会话
    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()>;
}

/// 选择传输
///
/// 有进程内的接入处理器时直接使用；否则按配置连接服务。
pub fn select_transport(
    config: &ReconcilerConfig,
    hub: Option<Arc<Ingestor>>,
) -> Result<Arc<dyn Transport>> {
    if let Some(ingestor) = hub {
        tracing::info!("🔌 Using in-process transport");
        return Ok(Arc::new(BusTransport::new(ingestor)));
    }

    match config.transport {
        TransportKind::Bus => Err(Error::Config(
            "bus transport requires an in-process server".into(),
        )),
        #[cfg(feature = "client")]
        TransportKind::Socket => {
            tracing::info!("🔌 Using socket transport: {}", config.server_url);
            let transport = super::socket::SocketTransport::new(&config.server_url)?
                .with_idle_timeout(config.idle_timeout);
            Ok(Arc::new(transport))
        }
        #[cfg(not(feature = "client"))]
        TransportKind::Socket => Err(Error::Config(
            "socket transport requires the `client` feature".into(),
        )),
    }
}
