//! 数据库 Schema 定义

/// 事件表 Schema
///
/// `AUTOINCREMENT` 保证 ID 永不复用（清空表后序列也不会回退）。
pub const SCHEMA_SQL: &str = r#"
-- Events 表（只追加）
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_app TEXT NOT NULL,
    session_id TEXT NOT NULL,
    hook_event_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,        -- 定长 UTC ISO-8601，字典序即时间序
    payload TEXT NOT NULL DEFAULT '{}',  -- JSON object
    created_at TEXT NOT NULL DEFAULT ''  -- 服务端接收时间
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_source_app ON events(source_app);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(hook_event_type);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC, id DESC);
"#;

/// 连接级 PRAGMA
pub const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

/// 获取完整 Schema
///
/// 内存数据库不支持 WAL，跳过 PRAGMA。
pub fn full_schema(file_backed: bool) -> String {
    let mut sql = String::new();
    if file_backed {
        sql.push_str(PRAGMA_SQL);
    }
    sql.push_str(SCHEMA_SQL);
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_applies_twice() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&full_schema(false)).unwrap();
        conn.execute_batch(&full_schema(false)).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'idx_events_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_events_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&full_schema(false)).unwrap();

        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('events')").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(
            columns,
            vec!["id", "source_app", "session_id", "hook_event_type", "timestamp", "payload", "created_at"]
        );
    }
}
