//! 数据类型定义

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Hook 事件类型（封闭枚举）
///
/// 序列化名称与 hook 脚本发送的字符串一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookEventType {
    #[serde(rename = "PreToolUse")]
    ToolPre,
    #[serde(rename = "PostToolUse")]
    ToolPost,
    #[serde(rename = "UserPromptSubmit")]
    UserInput,
    /// Agent 停止（`SubagentStop` 归一为 `Stop`）
    #[serde(rename = "Stop", alias = "SubagentStop")]
    AgentStop,
    #[serde(rename = "SessionStart")]
    SessionStart,
    #[serde(rename = "SessionEnd")]
    SessionEnd,
    #[serde(rename = "Notification")]
    Notification,
    #[serde(rename = "ProtocolEvent")]
    ProtocolEvent,
    #[serde(rename = "QualityGate")]
    QualityGate,
    #[serde(rename = "AgentHandoff")]
    AgentHandoff,
}

impl HookEventType {
    /// 全部类型
    pub const ALL: [HookEventType; 10] = [
        HookEventType::ToolPre,
        HookEventType::ToolPost,
        HookEventType::UserInput,
        HookEventType::AgentStop,
        HookEventType::SessionStart,
        HookEventType::SessionEnd,
        HookEventType::Notification,
        HookEventType::ProtocolEvent,
        HookEventType::QualityGate,
        HookEventType::AgentHandoff,
    ];

    /// 线上名称
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEventType::ToolPre => "PreToolUse",
            HookEventType::ToolPost => "PostToolUse",
            HookEventType::UserInput => "UserPromptSubmit",
            HookEventType::AgentStop => "Stop",
            HookEventType::SessionStart => "SessionStart",
            HookEventType::SessionEnd => "SessionEnd",
            HookEventType::Notification => "Notification",
            HookEventType::ProtocolEvent => "ProtocolEvent",
            HookEventType::QualityGate => "QualityGate",
            HookEventType::AgentHandoff => "AgentHandoff",
        }
    }

    /// 是否为 Agent 协议事件
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            HookEventType::ProtocolEvent | HookEventType::QualityGate | HookEventType::AgentHandoff
        )
    }
}

impl FromStr for HookEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "SubagentStop" {
            return Ok(HookEventType::AgentStop);
        }
        HookEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown hook_event_type: {}", s)))
    }
}

impl fmt::Display for HookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已存储的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 存储分配的单调递增 ID
    pub id: i64,
    pub source_app: String,
    pub session_id: String,
    pub hook_event_type: HookEventType,
    /// 归一化的 UTC 时间戳（定长，字典序即时间序）
    pub timestamp: String,
    /// 载荷（JSON object）
    pub payload: Value,
    /// 服务端接收时间
    #[serde(default)]
    pub created_at: String,
}

impl Event {
    /// 去重键
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            session_id: self.session_id.clone(),
            id: self.id,
            timestamp: self.timestamp.clone(),
        }
    }

    /// 读取载荷字段
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// 去重键：`(session_id, id, timestamp)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub session_id: String,
    pub id: i64,
    pub timestamp: String,
}

/// 接入请求体（POST /events）
///
/// 字段全部可选，以便给出具体的校验错误而不是反序列化错误。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub source_app: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub hook_event_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl IngestRequest {
    /// 校验并归一化为待写入事件
    ///
    /// `now` 用于填充缺失的时间戳。
    pub fn validate(self, now: DateTime<Utc>) -> Result<NewEvent> {
        let source_app = required(self.source_app, "source_app")?;
        let session_id = required(self.session_id, "session_id")?;
        let hook_event_type: HookEventType =
            required(self.hook_event_type, "hook_event_type")?.parse()?;

        let timestamp = match self.timestamp.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => normalize_timestamp(raw)?,
            _ => format_timestamp(now),
        };

        let payload = match self.payload {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(Error::Validation(format!(
                    "payload must be an object, got {}",
                    json_kind(&other)
                )))
            }
        };

        Ok(NewEvent {
            source_app,
            session_id,
            hook_event_type,
            timestamp,
            payload,
        })
    }
}

/// 待写入事件（已校验）
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub source_app: String,
    pub session_id: String,
    pub hook_event_type: HookEventType,
    pub timestamp: String,
    pub payload: Value,
}

impl NewEvent {
    /// 便捷构造（测试、进程内生产者）
    pub fn new(source_app: &str, session_id: &str, hook_event_type: HookEventType) -> Self {
        Self {
            source_app: source_app.to_string(),
            session_id: session_id.to_string(),
            hook_event_type,
            timestamp: format_timestamp(Utc::now()),
            payload: Value::Object(Default::default()),
        }
    }

    /// 设置载荷
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// 设置时间戳（必须是可解析的 ISO-8601）
    pub fn with_timestamp(mut self, timestamp: &str) -> Result<Self> {
        self.timestamp = normalize_timestamp(timestamp)?;
        Ok(self)
    }
}

/// 查询过滤条件
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    pub source_app: Option<String>,
    pub session_id: Option<String>,
    pub event_type: Option<HookEventType>,
    pub limit: usize,
    pub offset: usize,
}

impl EventFilter {
    /// 默认分页大小
    pub const DEFAULT_LIMIT: usize = 100;
    /// 单次查询上限
    pub const MAX_LIMIT: usize = 1000;

    /// 限制条数（自动截断到上限）
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.min(Self::MAX_LIMIT);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn source_app(mut self, source_app: &str) -> Self {
        self.source_app = Some(source_app.to_string());
        self
    }

    pub fn event_type(mut self, event_type: HookEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            source_app: None,
            session_id: None,
            event_type: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// 聚合统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_events: u64,
    pub sessions: u64,
    pub source_apps: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub success_count: u64,
    pub failure_count: u64,
    /// 成功率（无 success 信号时为 None）
    pub success_rate: Option<f64>,
    pub error_count: u64,
    pub event_types: BTreeMap<String, u64>,
    pub tools: BTreeMap<String, u64>,
}

/// 过滤选项（最近窗口内的去重值）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub source_apps: Vec<String>,
    pub session_ids: Vec<String>,
    pub hook_event_types: Vec<String>,
}

/// 归一化时间戳
///
/// 接受 RFC 3339（任意时区）以及不带时区的 ISO-8601（按 UTC 处理）。
pub fn normalize_timestamp(raw: &str) -> Result<String> {
    parse_timestamp(raw)
        .map(format_timestamp)
        .ok_or_else(|| Error::Validation(format!("invalid timestamp: {}", raw)))
}

/// 解析时间戳
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// 格式化为定长 UTC 时间戳（微秒精度）
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Validation(format!("missing required field: {}", field))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_hook_event_type_wire_names() {
        for t in HookEventType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<HookEventType>().unwrap(), t);
        }
    }

    #[test]
    fn test_subagent_stop_alias() {
        let t: HookEventType = serde_json::from_str("\"SubagentStop\"").unwrap();
        assert_eq!(t, HookEventType::AgentStop);
        assert_eq!("SubagentStop".parse::<HookEventType>().unwrap(), HookEventType::AgentStop);
        assert_eq!(t.as_str(), "Stop");
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let err = "MemoryOperation".parse::<HookEventType>().unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_validate_fills_defaults() {
        let request = IngestRequest {
            source_app: Some("/work/app".into()),
            session_id: Some("s1".into()),
            hook_event_type: Some("PreToolUse".into()),
            ..Default::default()
        };
        let event = request.validate(now()).unwrap();
        assert_eq!(event.timestamp, "2025-01-02T03:04:05.000000Z");
        assert_eq!(event.payload, json!({}));
        assert_eq!(event.hook_event_type, HookEventType::ToolPre);
    }

    #[test]
    fn test_validate_missing_fields() {
        let request = IngestRequest {
            source_app: Some("app".into()),
            hook_event_type: Some("Stop".into()),
            ..Default::default()
        };
        let err = request.validate(now()).unwrap_err();
        assert!(err.to_string().contains("session_id"));

        let request = IngestRequest {
            source_app: Some("  ".into()),
            session_id: Some("s1".into()),
            hook_event_type: Some("Stop".into()),
            ..Default::default()
        };
        assert!(request.validate(now()).is_err());
    }

    #[test]
    fn test_validate_rejects_non_object_payload() {
        let request = IngestRequest {
            source_app: Some("app".into()),
            session_id: Some("s1".into()),
            hook_event_type: Some("Stop".into()),
            payload: json!([1, 2, 3]),
            ..Default::default()
        };
        let err = request.validate(now()).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_normalize_timestamp_variants() {
        // Python utcnow().isoformat() + "Z"
        assert_eq!(
            normalize_timestamp("2025-01-02T03:04:05.123456Z").unwrap(),
            "2025-01-02T03:04:05.123456Z"
        );
        // 不带时区
        assert_eq!(
            normalize_timestamp("2025-01-02T03:04:05.5").unwrap(),
            "2025-01-02T03:04:05.500000Z"
        );
        // 带偏移
        assert_eq!(
            normalize_timestamp("2025-01-02T05:04:05+02:00").unwrap(),
            "2025-01-02T03:04:05.000000Z"
        );
        assert!(normalize_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_normalized_timestamps_sort_lexically() {
        let a = normalize_timestamp("2025-01-02T03:04:05.9Z").unwrap();
        let b = normalize_timestamp("2025-01-02T03:04:06Z").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_event_filter_limit_clamped() {
        let filter = EventFilter::default().limit(50_000);
        assert_eq!(filter.limit, EventFilter::MAX_LIMIT);
    }
}
