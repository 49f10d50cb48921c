//! 线上协议定义
//!
//! 实时流：WebSocket 文本帧，每帧一条 JSON，按 `type` 区分消息。
//! HTTP：JSON 请求/响应体。

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Event, EventFilter, HookEventType};

/// 实时流消息（两种传输共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// 订阅成功，附当前连接数
    Connected { clients: usize },

    /// 新事件（已持久化）
    Event { data: Event },

    /// 会话被删除
    SessionDeleted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// 全部事件被清空
    EventsCleared,

    /// 心跳
    Ping,

    /// 心跳应答
    Pong,
}

impl StreamMessage {
    /// 序列化为文本帧
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 解析文本帧
    pub fn from_frame(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// 消息类型名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Connected { .. } => "connected",
            StreamMessage::Event { .. } => "event",
            StreamMessage::SessionDeleted { .. } => "session_deleted",
            StreamMessage::EventsCleared => "events_cleared",
            StreamMessage::Ping => "ping",
            StreamMessage::Pong => "pong",
        }
    }
}

// ==================== HTTP ====================

/// POST /events 成功响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub id: i64,
}

/// 删除类操作响应（clear / delete session）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub deleted: usize,
}

/// 错误响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// GET /health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub clients: usize,
    pub version: String,
}

/// GET /events/recent 查询参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecentQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl RecentQuery {
    /// 转换为存储过滤条件（未知事件类型是校验错误）
    pub fn into_filter(self) -> Result<EventFilter> {
        let mut filter = EventFilter::default()
            .limit(self.limit.unwrap_or(EventFilter::DEFAULT_LIMIT))
            .offset(self.offset.unwrap_or(0));
        filter.source_app = self.source_app.filter(|s| !s.is_empty());
        filter.session_id = self.session_id.filter(|s| !s.is_empty());
        filter.event_type = match self.event_type.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<HookEventType>()?),
        };
        Ok(filter)
    }
}

/// GET /stats 查询参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl From<&Error> for ErrorResponse {
    fn from(e: &Error) -> Self {
        ErrorResponse::new(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_message_wire_format() {
        let msg = StreamMessage::SessionDeleted {
            session_id: "s1".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "session_deleted", "sessionId": "s1"}));

        let value = serde_json::to_value(StreamMessage::EventsCleared).unwrap();
        assert_eq!(value, json!({"type": "events_cleared"}));

        let value = serde_json::to_value(StreamMessage::Connected { clients: 2 }).unwrap();
        assert_eq!(value, json!({"type": "connected", "clients": 2}));
    }

    #[test]
    fn test_stream_message_parse_ping() {
        assert_eq!(
            StreamMessage::from_frame(r#"{"type":"ping"}"#).unwrap(),
            StreamMessage::Ping
        );
        assert!(StreamMessage::from_frame(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_event_message_roundtrip_keeps_payload() {
        let frame = json!({
            "type": "event",
            "data": {
                "id": 7,
                "source_app": "/work/app",
                "session_id": "s1",
                "hook_event_type": "QualityGate",
                "timestamp": "2025-01-02T03:04:05.000000Z",
                "payload": {"gate_name": "code_quality", "score": 0.9}
            }
        })
        .to_string();

        match StreamMessage::from_frame(&frame).unwrap() {
            StreamMessage::Event { data } => {
                assert_eq!(data.id, 7);
                assert_eq!(data.hook_event_type, HookEventType::QualityGate);
                assert_eq!(data.payload["score"], 0.9);
                assert_eq!(data.created_at, "");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_recent_query_into_filter() {
        let query = RecentQuery {
            limit: Some(5000),
            event_type: Some("PostToolUse".into()),
            session_id: Some(String::new()),
            ..Default::default()
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.limit, EventFilter::MAX_LIMIT);
        assert_eq!(filter.event_type, Some(HookEventType::ToolPost));
        assert_eq!(filter.session_id, None);

        let query = RecentQuery {
            event_type: Some("Bogus".into()),
            ..Default::default()
        };
        assert!(query.into_filter().unwrap_err().is_client_error());
    }
}
