//! Reconciler
//!
//! 客户端状态的唯一维护者：先打开实时订阅，再回填，按 `(session_id, id, timestamp)`
//! 去重后折叠进全局序列和会话/项目聚合；传输失败只表现为连接状态变化，
//! 固定间隔无限重连。
//!
//! ```text
//! Connecting ──subscribe+backfill──▶ Connected ──stream end / error──▶ Disconnected
//!     ▲                                                                   │
//!     └──────────────────────────── retry_delay ──────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::dedup::SeenSet;
use super::transport::{LiveStream, Transport};
use crate::aggregate::{Aggregator, ProjectView, SessionView};
use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::protocol::StreamMessage;
use crate::types::Event;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// 状态变化回调（默认全部为空操作）
///
/// 回调在状态锁之外执行，可以安全地回读 Reconciler。
#[allow(unused_variables)]
pub trait ReconcilerListener: Send + Sync {
    fn on_event(&self, event: &Event) {}
    fn on_session_deleted(&self, session_id: &str) {}
    fn on_events_cleared(&self) {}
    fn on_connection_state_change(&self, state: ConnectionState) {}
}

/// 折叠后的待通知动作
enum Notice {
    Event(Event),
    SessionDeleted(String),
    EventsCleared,
}

/// 受锁保护的客户端状态
struct State {
    /// 关闭后不再接受任何修改
    alive: bool,
    /// 全局序列，按 `(timestamp, id)` 升序
    events: VecDeque<Event>,
    seen: SeenSet,
    aggregator: Aggregator,
}

struct Shared {
    state: Mutex<State>,
    config: ReconcilerConfig,
    listeners: Vec<Arc<dyn ReconcilerListener>>,
    state_tx: watch::Sender<ConnectionState>,
    /// 串行化连接状态迁移（可重入：回调里允许调用 shutdown）
    transition: ReentrantMutex<()>,
}

impl Shared {
    /// 折叠一批事件（回填时按时间升序）
    fn fold_all(&self, events: Vec<Event>) {
        let notices = {
            let mut state = self.state.lock();
            if !state.alive {
                return;
            }
            let mut notices = Vec::new();
            for event in events {
                if let Some(notice) = self.fold_locked(&mut state, event) {
                    notices.push(notice);
                }
            }
            notices
        };
        self.notify(notices);
    }

    fn fold_locked(&self, state: &mut State, event: Event) -> Option<Notice> {
        if !state.seen.insert(event.dedup_key()) {
            tracing::trace!("Duplicate event dropped: id={}", event.id);
            return None;
        }

        state.aggregator.apply(&event);

        // 通常追加在末尾；回填补齐的旧事件插入到对应位置
        let pos = state
            .events
            .partition_point(|e| (&e.timestamp, e.id) <= (&event.timestamp, event.id));
        state.events.insert(pos, event.clone());
        while state.events.len() > self.config.max_events {
            state.events.pop_front();
        }

        Some(Notice::Event(event))
    }

    /// 处理实时消息
    fn handle(&self, message: StreamMessage) {
        let notices = {
            let mut state = self.state.lock();
            if !state.alive {
                return;
            }
            match message {
                StreamMessage::Event { data } => self.fold_locked(&mut state, data).into_iter().collect(),
                StreamMessage::SessionDeleted { session_id } => {
                    Self::delete_session_locked(&mut state, &session_id)
                }
                StreamMessage::EventsCleared => Self::clear_locked(&mut state),
                StreamMessage::Connected { clients } => {
                    tracing::debug!("📡 Subscribed, clients={}", clients);
                    Vec::new()
                }
                StreamMessage::Ping | StreamMessage::Pong => Vec::new(),
            }
        };
        self.notify(notices);
    }

    fn delete_session_locked(state: &mut State, session_id: &str) -> Vec<Notice> {
        let before = state.events.len();
        state.events.retain(|e| e.session_id != session_id);
        state.seen.remove_session(session_id);
        let removed = state.aggregator.remove_session(session_id).is_some();

        if removed || state.events.len() != before {
            vec![Notice::SessionDeleted(session_id.to_string())]
        } else {
            Vec::new()
        }
    }

    fn clear_locked(state: &mut State) -> Vec<Notice> {
        state.events.clear();
        state.aggregator.clear();
        state.seen.clear();
        vec![Notice::EventsCleared]
    }

    fn apply_locally<F>(&self, f: F)
    where
        F: FnOnce(&mut State) -> Vec<Notice>,
    {
        let notices = {
            let mut state = self.state.lock();
            if !state.alive {
                return;
            }
            f(&mut state)
        };
        self.notify(notices);
    }

    /// 更新连接状态；已关闭时返回 false
    ///
    /// 状态检查、写入与回调都在 `transition` 锁内完成，与 [`Reconciler::shutdown`] 互斥。
    fn set_connection_state(&self, next: ConnectionState) -> bool {
        let _transition = self.transition.lock();
        if !self.state.lock().alive {
            return false;
        }
        self.publish_connection_state(next);
        true
    }

    /// 写入连接状态并通知回调（调用方持有 `transition` 锁）
    fn publish_connection_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!("🔌 Connection state: {}", next);
            for listener in &self.listeners {
                listener.on_connection_state_change(next);
            }
        }
    }

    fn notify(&self, notices: Vec<Notice>) {
        if self.listeners.is_empty() {
            return;
        }
        for notice in notices {
            for listener in &self.listeners {
                match &notice {
                    Notice::Event(event) => listener.on_event(event),
                    Notice::SessionDeleted(id) => listener.on_session_deleted(id),
                    Notice::EventsCleared => listener.on_events_cleared(),
                }
            }
        }
    }
}

/// 客户端 Reconciler
pub struct Reconciler {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    /// 创建 Reconciler（尚未连接，调用 [`Reconciler::start`] 开始）
    pub fn new(transport: Arc<dyn Transport>, config: ReconcilerConfig) -> Result<Self> {
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let state = State {
            alive: true,
            events: VecDeque::new(),
            seen: SeenSet::new(config.seen_capacity),
            aggregator: Aggregator::new(config.max_session_events),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                config,
                listeners: Vec::new(),
                state_tx,
                transition: ReentrantMutex::new(()),
            }),
            transport,
            shutdown_tx,
            driver: Mutex::new(None),
        })
    }

    /// 注册回调（须在 start 之前）
    pub fn with_listener(mut self, listener: Arc<dyn ReconcilerListener>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.listeners.push(listener),
            None => tracing::warn!("⚠️ Listener ignored: reconciler already started"),
        }
        self
    }

    /// 启动后台连接任务（需要在 tokio runtime 中调用，重复调用无效）
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() || !self.is_alive() {
            return;
        }

        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let shutdown = self.shutdown_tx.subscribe();
        *driver = Some(tokio::spawn(drive(shared, transport, shutdown)));
    }

    /// 同步关闭（幂等）：之后不再有任何状态修改
    ///
    /// 回调会收到最后一次 `disconnected`（若此前不是该状态）。
    pub fn shutdown(&self) {
        {
            let _transition = self.shared.transition.lock();
            {
                let mut state = self.shared.state.lock();
                if !state.alive {
                    return;
                }
                state.alive = false;
            }
            self.shared
                .publish_connection_state(ConnectionState::Disconnected);
        }

        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        tracing::info!("🛑 Reconciler shut down");
    }

    pub fn is_alive(&self) -> bool {
        self.shared.state.lock().alive
    }

    // ==================== 状态读取 ====================

    /// 全局事件序列（时间升序）
    pub fn events(&self) -> Vec<Event> {
        self.shared.state.lock().events.iter().cloned().collect()
    }

    pub fn event_count(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    /// 会话列表，按最近事件降序
    pub fn sessions(&self) -> Vec<SessionView> {
        let state = self.shared.state.lock();
        state.aggregator.sessions().into_iter().cloned().collect()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionView> {
        self.shared.state.lock().aggregator.session(session_id).cloned()
    }

    /// 项目列表，按最近活动降序
    pub fn projects(&self) -> Vec<ProjectView> {
        self.shared.state.lock().aggregator.projects()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// 订阅连接状态变化
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    // ==================== 操作 ====================

    /// 清空全部事件：先发给服务端，再本地应用（与回显的广播幂等）
    pub async fn clear_events(&self) -> Result<()> {
        self.transport
            .clear()
            .await
            .map_err(|e| Error::Connection(format!("{:#}", e)))?;
        self.shared.apply_locally(Shared::clear_locked);
        Ok(())
    }

    /// 删除会话：先发给服务端，再本地应用
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.transport
            .delete_session(session_id)
            .await
            .map_err(|e| Error::Connection(format!("{:#}", e)))?;
        self.shared
            .apply_locally(|state| Shared::delete_session_locked(state, session_id));
        Ok(())
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 连接循环：失败或流结束后等待 `retry_delay` 重连，直到关闭
async fn drive(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let retry_delay = shared.config.retry_delay;

    loop {
        if !shared.set_connection_state(ConnectionState::Connecting) {
            break;
        }

        match run_once(&shared, transport.as_ref(), &mut shutdown).await {
            Ok(()) => tracing::debug!("Stream ended ({})", transport.name()),
            Err(e) => tracing::warn!("⚠️ Transport {} failed: {:#}", transport.name(), e),
        }

        if *shutdown.borrow() || !shared.set_connection_state(ConnectionState::Disconnected) {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// 一次连接：订阅 → 回填 → 消费实时流
async fn run_once(
    shared: &Shared,
    transport: &dyn Transport,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // 先订阅，回填期间到达的事件在队列中等待，由去重吸收重叠部分
    let mut stream: Box<dyn LiveStream> = transport.subscribe().await?;

    let mut backfill = transport.backfill(shared.config.backfill_limit).await?;
    backfill.sort_by(|a, b| (&a.timestamp, a.id).cmp(&(&b.timestamp, b.id)));
    tracing::debug!("📥 Backfilled {} events", backfill.len());
    shared.fold_all(backfill);

    if !shared.set_connection_state(ConnectionState::Connected) {
        return Ok(());
    }

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(message) => shared.handle(message),
                None => return Ok(()),
            },
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
