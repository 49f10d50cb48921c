//! 配置
//!
//! 所有配置均为普通结构体：`Default` 提供默认值，`from_env()` 读取环境变量覆盖。

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// 数据库路径环境变量（文件路径或 `:memory:`）
pub const ENV_DB: &str = "COMMAND_CENTER_DB";
/// 存储容量环境变量
pub const ENV_MAX_EVENTS: &str = "COMMAND_CENTER_MAX_EVENTS";
/// 监听地址环境变量
pub const ENV_HOST: &str = "COMMAND_CENTER_HOST";
/// 监听端口环境变量
pub const ENV_PORT: &str = "COMMAND_CENTER_PORT";
/// Reconciler 连接的服务地址
pub const ENV_SERVER: &str = "COMMAND_CENTER_SERVER";
/// Reconciler 传输方式（`socket` | `bus`）
pub const ENV_TRANSPORT: &str = "COMMAND_CENTER_TRANSPORT";

/// 内存数据库标记
pub const MEMORY_URL: &str = ":memory:";

/// 默认保留的事件数量
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// 存储连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 本地 SQLite 文件
    Local,
    /// 进程内存数据库（测试、临时实例）
    Memory,
}

/// Event Store 配置
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// 数据库文件路径（Memory 模式下为 `:memory:`）
    pub url: String,

    /// 连接模式
    pub mode: ConnectionMode,

    /// 最多保留的事件数量，超出后淘汰最旧的事件（0 表示不限制）
    pub max_events: usize,
}

impl StoreConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            mode: ConnectionMode::Local,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    /// 创建内存数据库配置
    pub fn in_memory() -> Self {
        Self {
            url: MEMORY_URL.to_string(),
            mode: ConnectionMode::Memory,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    /// 设置保留容量
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        let mut config = match std::env::var(ENV_DB) {
            Ok(url) if url == MEMORY_URL => Self::in_memory(),
            Ok(url) => Self::local(url),
            // 默认路径: ~/.command-center/db/events.db
            Err(_) => Self::local(default_data_dir().join("db").join("events.db")),
        };

        if let Some(max_events) = env_parse::<usize>(ENV_MAX_EVENTS) {
            config.max_events = max_events;
        }

        config
    }

    /// 获取数据库文件路径 (仅本地模式)
    pub fn path(&self) -> Option<PathBuf> {
        match self.mode {
            ConnectionMode::Local => Some(PathBuf::from(&self.url)),
            ConnectionMode::Memory => None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// HTTP / WebSocket 服务配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 首选端口（0 表示由系统分配）
    pub port: u16,
    /// 首选端口被占用时依次尝试的端口
    pub fallback_ports: RangeInclusive<u16>,
    /// 每个订阅者的发送队列容量，满则断开该订阅者
    pub queue_capacity: usize,
    /// WebSocket 心跳间隔
    pub heartbeat_interval: Duration,
    /// filter-options 统计的最近事件窗口
    pub filter_window: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            fallback_ports: 4001..=4010,
            queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            filter_window: 1000,
        }
    }
}

impl ServerConfig {
    /// 从环境变量创建配置
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var(ENV_HOST) {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>(ENV_PORT) {
            config.port = port;
        }
        config
    }

    /// 端口候选列表：首选端口在前，随后是回退端口
    ///
    /// 端口 0 交给系统分配，不再回退。
    pub fn candidate_ports(&self) -> Vec<u16> {
        if self.port == 0 {
            return vec![0];
        }
        std::iter::once(self.port)
            .chain(self.fallback_ports.clone().filter(|p| *p != self.port))
            .collect()
    }
}

/// Reconciler 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// HTTP 回填 + WebSocket 实时流
    Socket,
    /// 进程内直接读存储、订阅广播器
    Bus,
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "socket" | "ws" | "websocket" => Ok(TransportKind::Socket),
            "bus" | "in-process" => Ok(TransportKind::Bus),
            other => Err(Error::Config(format!("unknown transport: {}", other))),
        }
    }
}

/// Reconciler 配置
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// 全局事件序列上限（超出后丢弃最旧的）
    pub max_events: usize,
    /// 每个会话保留的事件数
    pub max_session_events: usize,
    /// 去重环容量，必须不小于 `backfill_limit`
    pub seen_capacity: usize,
    /// 每次（重）连接回填的事件数
    pub backfill_limit: usize,
    /// 断线后的重连间隔
    pub retry_delay: Duration,
    /// 实时流空闲超时：超过该时间没有任何帧（含心跳）即视为断线，取服务端心跳间隔的两倍
    pub idle_timeout: Duration,
    /// 服务地址（Socket 传输）
    pub server_url: String,
    /// 首选传输方式
    pub transport: TransportKind,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_events: 1000,
            max_session_events: 100,
            seen_capacity: 10_000,
            backfill_limit: 1000,
            retry_delay: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(60),
            server_url: "http://127.0.0.1:4000".to_string(),
            transport: TransportKind::Socket,
        }
    }
}

impl ReconcilerConfig {
    /// 从环境变量创建配置
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(ENV_SERVER) {
            config.server_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(raw) = std::env::var(ENV_TRANSPORT) {
            match raw.parse() {
                Ok(kind) => config.transport = kind,
                Err(e) => tracing::warn!("⚠️ {}，使用默认传输", e),
            }
        }
        config
    }

    /// 校验容量关系
    pub fn validate(&self) -> Result<()> {
        if self.seen_capacity < self.backfill_limit {
            return Err(Error::Config(format!(
                "seen_capacity ({}) must be >= backfill_limit ({})",
                self.seen_capacity, self.backfill_limit
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::Config("idle_timeout must be positive".into()));
        }
        if self.max_events == 0 || self.max_session_events == 0 {
            return Err(Error::Config("event caps must be positive".into()));
        }
        Ok(())
    }
}

/// 数据目录（默认 ~/.command-center）
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".command-center")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_local() {
        let config = StoreConfig::local("/tmp/cc/events.db");
        assert_eq!(config.mode, ConnectionMode::Local);
        assert_eq!(config.path(), Some(PathBuf::from("/tmp/cc/events.db")));
        assert_eq!(config.max_events, DEFAULT_MAX_EVENTS);
    }

    #[test]
    fn test_store_config_memory() {
        let config = StoreConfig::in_memory().with_max_events(5);
        assert_eq!(config.mode, ConnectionMode::Memory);
        assert!(config.path().is_none());
        assert_eq!(config.max_events, 5);
    }

    #[test]
    fn test_reconciler_config_validate() {
        assert!(ReconcilerConfig::default().validate().is_ok());

        let config = ReconcilerConfig {
            seen_capacity: 10,
            backfill_limit: 100,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ReconcilerConfig {
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("bus".parse::<TransportKind>().unwrap(), TransportKind::Bus);
        assert_eq!(" Socket ".parse::<TransportKind>().unwrap(), TransportKind::Socket);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_candidate_ports() {
        let config = ServerConfig::default();
        let ports = config.candidate_ports();
        assert_eq!(ports.first(), Some(&4000));
        assert_eq!(ports.last(), Some(&4010));
        assert_eq!(ports.len(), 11);

        let config = ServerConfig {
            port: 4005,
            ..Default::default()
        };
        let ports = config.candidate_ports();
        assert_eq!(ports[0], 4005);
        assert_eq!(ports.iter().filter(|p| **p == 4005).count(), 1);

        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert_eq!(config.candidate_ports(), vec![0]);
    }
}
