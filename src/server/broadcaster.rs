//! 事件广播器
//!
//! 维护订阅者列表，将已持久化的事件和控制消息推送给所有订阅者。
//! 每个订阅者一个有界队列；队列满或已关闭的订阅者直接移除，由其重连后的回填补齐。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::StreamMessage;

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道（已序列化的文本帧）
pub type MessageSender = mpsc::Sender<String>;

/// 默认队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// 事件广播器
pub struct Broadcaster {
    /// 连接通道：ConnId → 发送通道
    senders: RwLock<HashMap<ConnId, MessageSender>>,
    /// 下一个连接 ID
    next_conn_id: RwLock<ConnId>,
    /// 每个订阅者的队列容量
    queue_capacity: usize,
    this: Weak<Broadcaster>,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// 指定队列容量
    pub fn with_capacity(queue_capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            senders: RwLock::new(HashMap::new()),
            next_conn_id: RwLock::new(1),
            queue_capacity: queue_capacity.max(1),
            this: this.clone(),
        })
    }

    /// 注册新订阅者
    ///
    /// 订阅成功后立即收到 `connected{clients}`。
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let conn_id = {
            let mut next_id = self.next_conn_id.write();
            let conn_id = *next_id;
            *next_id += 1;
            conn_id
        };

        let clients = {
            let mut senders = self.senders.write();
            senders.insert(conn_id, tx);
            senders.len()
        };
        tracing::debug!("📡 Subscriber registered: conn_id={}, clients={}", conn_id, clients);

        self.send_to(conn_id, &StreamMessage::Connected { clients });

        Subscription {
            conn_id,
            receiver: rx,
            broadcaster: self.this.clone(),
            closed: false,
        }
    }

    /// 注销订阅者（幂等）
    ///
    /// 发送通道随之释放，订阅者的流在排空后结束。
    pub fn unsubscribe(&self, conn_id: ConnId) {
        if self.senders.write().remove(&conn_id).is_some() {
            tracing::debug!("📡 Subscriber unregistered: conn_id={}", conn_id);
        }
    }

    /// 广播给所有订阅者（非阻塞）
    ///
    /// 返回成功入队的订阅者数量。
    pub fn publish(&self, message: &StreamMessage) -> usize {
        // 只序列化一次
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to serialize {} message: {}", message.kind(), e);
                return 0;
            }
        };

        let targets: Vec<(ConnId, MessageSender)> = {
            let senders = self.senders.read();
            senders.iter().map(|(id, s)| (*id, s.clone())).collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: kind={}", message.kind());
            return 0;
        }

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("📡 Queue full, dropping subscriber: conn_id={}", conn_id);
                    dropped.push(conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("📡 Channel closed: conn_id={}", conn_id);
                    dropped.push(conn_id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut senders = self.senders.write();
            for conn_id in dropped {
                senders.remove(&conn_id);
            }
        }

        tracing::debug!("📡 Published {}: delivered={}", message.kind(), delivered);
        delivered
    }

    /// 发送消息到指定订阅者（非阻塞）
    pub fn send_to(&self, conn_id: ConnId, message: &StreamMessage) -> bool {
        let sender = {
            let senders = self.senders.read();
            senders.get(&conn_id).cloned()
        };
        let Some(sender) = sender else {
            return false;
        };

        match message.to_frame() {
            Ok(frame) => sender.try_send(frame).is_ok(),
            Err(e) => {
                tracing::error!("Failed to serialize {} message: {}", message.kind(), e);
                false
            }
        }
    }

    /// 获取当前连接数
    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// 当前连接 ID（升序）
    pub fn connection_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.senders.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 检查是否有活跃连接
    pub fn has_connections(&self) -> bool {
        !self.senders.read().is_empty()
    }
}

/// 单个订阅
///
/// `close()` 幂等，drop 时自动执行。
pub struct Subscription {
    conn_id: ConnId,
    receiver: mpsc::Receiver<String>,
    broadcaster: Weak<Broadcaster>,
    closed: bool,
}

impl Subscription {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// 接收下一帧；订阅被移除且队列排空后返回 None
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// 接收下一条消息（跳过无法解析的帧）
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        loop {
            let frame = self.receiver.recv().await?;
            match StreamMessage::from_frame(&frame) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!("⚠️ Unparsable frame on conn_id={}: {}", self.conn_id, e),
            }
        }
    }

    /// 非阻塞接收（测试、轮询用）
    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        let frame = self.receiver.try_recv().ok()?;
        StreamMessage::from_frame(&frame).ok()
    }

    /// 关闭订阅
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(self.conn_id);
        }
        self.receiver.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
