//! 接入处理器
//!
//! 校验 → 补全协议字段 → 写入 → 广播。写入与广播在同一把写锁内完成，
//! 因此广播顺序与 ID 顺序一致，且广播出去的事件一定已经可查询。

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use super::broadcaster::Broadcaster;
use crate::error::Result;
use crate::gate::annotate_payload;
use crate::protocol::{RecentQuery, StreamMessage};
use crate::store::EventStore;
use crate::types::{Event, FilterOptions, IngestRequest, NewEvent, Stats};

/// 服务版本号（跟随 crate 版本）
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 接入处理器
///
/// 方法均为同步阻塞调用，异步上下文中应放入 `spawn_blocking`。
pub struct Ingestor {
    store: Arc<EventStore>,
    broadcaster: Arc<Broadcaster>,
    /// 写锁：append + publish 原子化
    write_lock: Mutex<()>,
}

impl Ingestor {
    pub fn new(store: Arc<EventStore>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// 处理 POST /events 请求体
    pub fn ingest(&self, request: IngestRequest) -> Result<Event> {
        let event = request.validate(Utc::now())?;
        self.ingest_event(event)
    }

    /// 写入已校验的事件并广播
    pub fn ingest_event(&self, mut event: NewEvent) -> Result<Event> {
        if let Value::Object(payload) = &mut event.payload {
            annotate_payload(event.hook_event_type, payload);
        }

        let _guard = self.write_lock.lock();
        let stored = match self.store.append(event) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("❌ Failed to store event: {}", e);
                return Err(e);
            }
        };

        tracing::debug!(
            "🪝 Event stored: id={}, type={}, session_id={}",
            stored.id,
            stored.hook_event_type,
            stored.session_id
        );

        self.broadcaster.publish(&StreamMessage::Event {
            data: stored.clone(),
        });
        Ok(stored)
    }

    /// 删除会话并广播 `session_deleted`
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let deleted = self.store.delete_session(session_id)?;
        tracing::info!("🗑️ Session deleted: session_id={}, events={}", session_id, deleted);

        self.broadcaster.publish(&StreamMessage::SessionDeleted {
            session_id: session_id.to_string(),
        });
        Ok(deleted)
    }

    /// 清空全部事件并广播 `events_cleared`
    pub fn clear(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let deleted = self.store.clear()?;
        tracing::info!("🧹 Events cleared: {}", deleted);

        self.broadcaster.publish(&StreamMessage::EventsCleared);
        Ok(deleted)
    }

    /// GET /events/recent
    pub fn recent(&self, query: RecentQuery) -> Result<Vec<Event>> {
        self.store.query(&query.into_filter()?)
    }

    /// GET /stats
    pub fn stats(&self, session_id: Option<&str>) -> Result<Stats> {
        self.store.stats(session_id)
    }

    /// GET /events/filter-options
    pub fn filter_options(&self, window: usize) -> Result<FilterOptions> {
        self.store.filter_options(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Ingestor {
        Ingestor::new(Arc::new(EventStore::in_memory().unwrap()), Broadcaster::new())
    }

    fn request(session: &str, event_type: &str, payload: Value) -> IngestRequest {
        IngestRequest {
            source_app: Some("/work/app".into()),
            session_id: Some(session.into()),
            hook_event_type: Some(event_type.into()),
            timestamp: None,
            payload,
        }
    }

    #[test]
    fn test_published_event_is_queryable() {
        let ingestor = setup();
        let mut sub = ingestor.broadcaster().subscribe();
        assert!(matches!(sub.try_recv(), Some(StreamMessage::Connected { .. })));

        let stored = ingestor
            .ingest(request("s1", "PreToolUse", json!({"tool_name": "Bash"})))
            .unwrap();

        match sub.try_recv() {
            Some(StreamMessage::Event { data }) => {
                assert_eq!(data, stored);
                assert_eq!(ingestor.store().get(data.id).unwrap(), Some(data));
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_failure_has_no_side_effects() {
        let ingestor = setup();
        let mut sub = ingestor.broadcaster().subscribe();
        sub.try_recv();

        let err = ingestor
            .ingest(request("", "PreToolUse", json!({})))
            .unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(ingestor.store().count().unwrap(), 0);
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_store_failure_is_not_broadcast() {
        let ingestor = setup();
        let mut sub = ingestor.broadcaster().subscribe();
        sub.try_recv();

        ingestor
            .store()
            .connection()
            .lock()
            .execute_batch("DROP TABLE events")
            .unwrap();

        let err = ingestor.ingest(request("s1", "Stop", json!({}))).unwrap_err();
        assert!(!err.is_client_error());
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_protocol_payload_annotated() {
        let ingestor = setup();
        let stored = ingestor
            .ingest(request("s1", "ProtocolEvent", json!({"confidence": 0.3})))
            .unwrap();
        assert_eq!(stored.payload["verdict"], "block");
        assert_eq!(stored.payload["blocking"], true);
        assert_eq!(stored.payload["protocol_version"], "2.0");
    }

    #[test]
    fn test_delete_and_clear_broadcast() {
        let ingestor = setup();
        ingestor.ingest(request("s1", "Stop", json!({}))).unwrap();
        ingestor.ingest(request("s2", "Stop", json!({}))).unwrap();

        let mut sub = ingestor.broadcaster().subscribe();
        sub.try_recv();

        assert_eq!(ingestor.delete_session("s1").unwrap(), 1);
        assert_eq!(
            sub.try_recv(),
            Some(StreamMessage::SessionDeleted {
                session_id: "s1".into()
            })
        );

        assert_eq!(ingestor.clear().unwrap(), 1);
        assert_eq!(sub.try_recv(), Some(StreamMessage::EventsCleared));
    }
}
