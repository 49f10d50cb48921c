//! Event Store
//!
//! 只追加的 SQLite 事件日志。`append` 是唯一的写入路径，插入与容量淘汰在同一事务内完成，
//! 由连接锁串行化，因此 ID 严格按插入顺序递增。

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::config::{ConnectionMode, StoreConfig};
use crate::error::Result;
use crate::payload::{Metrics, Totals};
use crate::schema;
use crate::types::{
    format_timestamp, Event, EventFilter, FilterOptions, HookEventType, NewEvent, Stats,
};

const EVENT_COLUMNS: &str =
    "id, source_app, session_id, hook_event_type, timestamp, payload, created_at";

/// 事件存储
pub struct EventStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
}

impl EventStore {
    /// 打开存储
    pub fn open(config: StoreConfig) -> Result<Self> {
        let conn = match config.mode {
            ConnectionMode::Local => {
                let path = Path::new(&config.url);
                // 确保目录存在
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            ConnectionMode::Memory => Connection::open_in_memory()?,
        };

        conn.execute_batch(&schema::full_schema(config.mode == ConnectionMode::Local))?;

        tracing::info!("📦 Event store opened: {} (max_events={})", config.url, config.max_events);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// 打开内存存储
    pub fn in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== 写入 ====================

    /// 追加事件，返回带 ID 的完整事件
    ///
    /// 超出 `max_events` 的最旧事件在同一事务内淘汰。
    pub fn append(&self, event: NewEvent) -> Result<Event> {
        let payload = serde_json::to_string(&event.payload)?;
        let created_at = format_timestamp(Utc::now());

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO events (source_app, session_id, hook_event_type, timestamp, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                &event.source_app,
                &event.session_id,
                event.hook_event_type.as_str(),
                &event.timestamp,
                &payload,
                &created_at,
            ],
        )?;
        let id = tx.last_insert_rowid();

        if self.config.max_events > 0 {
            let evicted = tx.execute(
                r#"
                DELETE FROM events
                WHERE id <= (SELECT id FROM events ORDER BY id DESC LIMIT 1 OFFSET ?1)
                "#,
                params![self.config.max_events as i64],
            )?;
            if evicted > 0 {
                tracing::debug!("🧹 Evicted {} events beyond retention", evicted);
            }
        }

        tx.commit()?;

        Ok(Event {
            id,
            source_app: event.source_app,
            session_id: event.session_id,
            hook_event_type: event.hook_event_type,
            timestamp: event.timestamp,
            payload: event.payload,
            created_at,
        })
    }

    /// 删除会话的全部事件，返回删除数量
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM events WHERE session_id = ?1", params![session_id])?;
        Ok(deleted)
    }

    /// 清空全部事件（ID 序列不回退）
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM events", [])?;
        Ok(deleted)
    }

    // ==================== 查询 ====================

    /// 按条件查询，`timestamp DESC, id DESC`
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut conditions = Vec::new();
        let mut values: Vec<&str> = Vec::new();

        if let Some(source_app) = &filter.source_app {
            values.push(source_app);
            conditions.push(format!("source_app = ?{}", values.len()));
        }
        if let Some(session_id) = &filter.session_id {
            values.push(session_id);
            conditions.push(format!("session_id = ?{}", values.len()));
        }
        if let Some(event_type) = filter.event_type {
            values.push(event_type.as_str());
            conditions.push(format!("hook_event_type = ?{}", values.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM events {} ORDER BY timestamp DESC, id DESC LIMIT {} OFFSET {}",
            EVENT_COLUMNS,
            where_clause,
            filter.limit.min(EventFilter::MAX_LIMIT),
            filter.offset
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), read_row)?;

        let mut events = Vec::new();
        for row in rows {
            if let Some(event) = row?.into_event() {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// 按 ID 获取事件
    pub fn get(&self, id: i64) -> Result<Option<Event>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                read_row,
            )
            .optional()?;
        Ok(row.and_then(RawEvent::into_event))
    }

    /// 事件总数
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// 聚合统计（对过滤后的行做一次线性扫描）
    pub fn stats(&self, session_id: Option<&str>) -> Result<Stats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, source_app, hook_event_type, payload
            FROM events
            WHERE ?1 IS NULL OR session_id = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![session_id])?;

        let mut totals = Totals::default();
        let mut sessions = HashSet::new();
        let mut source_apps = HashSet::new();

        while let Some(row) = rows.next()? {
            let session: String = row.get(0)?;
            let source_app: String = row.get(1)?;
            let event_type: String = row.get(2)?;
            let payload: String = row.get(3)?;

            let Ok(event_type) = event_type.parse::<HookEventType>() else {
                continue;
            };
            let payload: Value = serde_json::from_str(&payload).unwrap_or(Value::Null);
            totals.add_event(event_type, &Metrics::of(&payload));
            sessions.insert(session);
            source_apps.insert(source_app);
        }

        Ok(Stats {
            total_events: totals.event_count,
            sessions: sessions.len() as u64,
            source_apps: source_apps.len() as u64,
            tokens_used: totals.tokens_used,
            cost_usd: totals.cost_usd(),
            success_count: totals.success_count,
            failure_count: totals.failure_count,
            success_rate: totals.success_rate(),
            error_count: totals.error_count,
            event_types: totals.event_types,
            tools: totals.tools,
        })
    }

    /// 最近 `window` 条事件中的去重取值
    pub fn filter_options(&self, window: usize) -> Result<FilterOptions> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT source_app, session_id, hook_event_type
            FROM events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![window as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut source_apps = BTreeSet::new();
        let mut session_ids = BTreeSet::new();
        let mut event_types = BTreeSet::new();
        for row in rows {
            let (source_app, session_id, event_type) = row?;
            source_apps.insert(source_app);
            session_ids.insert(session_id);
            event_types.insert(event_type);
        }

        Ok(FilterOptions {
            source_apps: source_apps.into_iter().collect(),
            session_ids: session_ids.into_iter().collect(),
            hook_event_types: event_types.into_iter().collect(),
        })
    }
}

/// 未解码的行
struct RawEvent {
    id: i64,
    source_app: String,
    session_id: String,
    hook_event_type: String,
    timestamp: String,
    payload: String,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        source_app: row.get(1)?,
        session_id: row.get(2)?,
        hook_event_type: row.get(3)?,
        timestamp: row.get(4)?,
        payload: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl RawEvent {
    /// 解码行；无法识别的类型（旧版本写入）跳过
    fn into_event(self) -> Option<Event> {
        let hook_event_type = match self.hook_event_type.parse() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("⚠️ Skipping event {}: {}", self.id, e);
                return None;
            }
        };
        let payload = serde_json::from_str(&self.payload)
            .unwrap_or_else(|_| Value::Object(Default::default()));

        Some(Event {
            id: self.id,
            source_app: self.source_app,
            session_id: self.session_id,
            hook_event_type,
            timestamp: self.timestamp,
            payload,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(session: &str, event_type: HookEventType) -> NewEvent {
        NewEvent::new("/work/app", session, event_type)
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let store = EventStore::in_memory().unwrap();
        let a = store.append(event("s1", HookEventType::ToolPre)).unwrap();
        let b = store.append(event("s1", HookEventType::ToolPost)).unwrap();
        assert!(b.id > a.id);
        assert!(!a.created_at.is_empty());
        assert_eq!(store.get(a.id).unwrap(), Some(a));
    }

    #[test]
    fn test_ids_not_reused_after_clear() {
        let store = EventStore::in_memory().unwrap();
        let a = store.append(event("s1", HookEventType::AgentStop)).unwrap();
        assert_eq!(store.clear().unwrap(), 1);
        let b = store.append(event("s1", HookEventType::AgentStop)).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let store = EventStore::open(StoreConfig::in_memory().with_max_events(3)).unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.append(event("s1", HookEventType::Notification)).unwrap().id);
        }
        assert_eq!(store.count().unwrap(), 3);
        assert!(store.get(ids[0]).unwrap().is_none());
        assert!(store.get(ids[1]).unwrap().is_none());
        assert!(store.get(ids[4]).unwrap().is_some());
    }

    #[test]
    fn test_query_order_and_filters() {
        let store = EventStore::in_memory().unwrap();
        let early = event("s1", HookEventType::ToolPre)
            .with_timestamp("2025-01-01T00:00:00Z")
            .unwrap();
        let late = event("s2", HookEventType::ToolPost)
            .with_timestamp("2025-01-01T00:00:01Z")
            .unwrap();
        store.append(late).unwrap();
        store.append(early).unwrap();

        let all = store.query(&EventFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, "s2");

        let s1 = store.query(&EventFilter::default().session("s1")).unwrap();
        assert_eq!(s1.len(), 1);

        let post = store
            .query(&EventFilter::default().event_type(HookEventType::ToolPost))
            .unwrap();
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].session_id, "s2");

        let page = store.query(&EventFilter::default().limit(1).offset(1)).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].session_id, "s1");
    }

    #[test]
    fn test_stats() {
        let store = EventStore::in_memory().unwrap();
        store
            .append(event("s1", HookEventType::ToolPost).with_payload(json!({
                "tool_name": "Bash", "tokens_used": 100, "cost_usd": "0.000120", "success": true
            })))
            .unwrap();
        store
            .append(event("s1", HookEventType::ToolPost).with_payload(json!({
                "tool_name": "Bash", "tokens_used": "50", "success": false, "errors": ["boom"]
            })))
            .unwrap();
        store.append(event("s2", HookEventType::AgentStop)).unwrap();

        let stats = store.stats(None).unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.source_apps, 1);
        assert_eq!(stats.tokens_used, 150);
        assert!((stats.cost_usd - 0.00012).abs() < 1e-12);
        assert_eq!(stats.success_rate, Some(0.5));
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.tools.get("Bash"), Some(&2));
        assert_eq!(stats.event_types.get("Stop"), Some(&1));

        let s2 = store.stats(Some("s2")).unwrap();
        assert_eq!(s2.total_events, 1);
        assert_eq!(s2.success_rate, None);
    }

    #[test]
    fn test_delete_session() {
        let store = EventStore::in_memory().unwrap();
        store.append(event("s1", HookEventType::AgentStop)).unwrap();
        store.append(event("s1", HookEventType::AgentStop)).unwrap();
        store.append(event("s2", HookEventType::AgentStop)).unwrap();

        assert_eq!(store.delete_session("s1").unwrap(), 2);
        assert_eq!(store.delete_session("s1").unwrap(), 0);
        assert_eq!(store.stats(None).unwrap().sessions, 1);
    }

    #[test]
    fn test_filter_options_window() {
        let store = EventStore::in_memory().unwrap();
        store
            .append(NewEvent::new("old-app", "s0", HookEventType::SessionStart))
            .unwrap();
        store.append(event("s2", HookEventType::ToolPre)).unwrap();
        store.append(event("s1", HookEventType::ToolPre)).unwrap();

        let options = store.filter_options(2).unwrap();
        assert_eq!(options.source_apps, vec!["/work/app"]);
        assert_eq!(options.session_ids, vec!["s1", "s2"]);
        assert_eq!(options.hook_event_types, vec!["PreToolUse"]);
    }

    #[test]
    fn test_unknown_stored_type_skipped() {
        let store = EventStore::in_memory().unwrap();
        store.append(event("s1", HookEventType::AgentStop)).unwrap();
        store
            .connection()
            .lock()
            .execute(
                "INSERT INTO events (source_app, session_id, hook_event_type, timestamp) VALUES ('a', 's1', 'Legacy', '2025-01-01T00:00:00.000000Z')",
                [],
            )
            .unwrap();

        assert_eq!(store.query(&EventFilter::default()).unwrap().len(), 1);
        assert_eq!(store.count().unwrap(), 2);
    }
}
