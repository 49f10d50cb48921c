//! 载荷解析
//!
//! 载荷在存储层保持为开放的 JSON object，按 `hook_event_type` 解释为 [`EventPayload`]；
//! 无法识别的结构回退为 `Other`，只读取消费方真正用到的字段。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::gate::{as_f64, AgentHandoff, AgentType, GateRecord, Phase, Verdict};
use crate::types::{Event, HookEventType};

/// 按事件类型解释后的载荷
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// PreToolUse / PostToolUse
    Tool(ToolPayload),
    /// ProtocolEvent（阶段迁移 + 置信度）
    Protocol(ProtocolPayload),
    /// QualityGate
    Gate(GateRecord),
    /// AgentHandoff
    Handoff(AgentHandoff),
    /// 其他类型或无法识别的结构
    Other(Map<String, Value>),
}

/// 工具调用载荷
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPayload {
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub file_paths: Vec<String>,
    pub command: Option<String>,
    pub agent: Option<String>,
    pub success: Option<bool>,
    pub errors: Vec<String>,
}

/// 协议事件载荷
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolPayload {
    pub agent_type: Option<AgentType>,
    /// 阶段迁移（来自 `event_type`，缺省时尝试 `phase`）
    pub phase: Option<Phase>,
    /// 自由文本阶段名（如 `synthesis`）
    pub phase_label: Option<String>,
    pub confidence: Option<f64>,
}

impl ProtocolPayload {
    pub fn verdict(&self) -> Option<Verdict> {
        self.confidence.map(Verdict::from_confidence)
    }
}

impl EventPayload {
    /// 解释事件载荷
    pub fn decode(event_type: HookEventType, payload: &Value) -> Self {
        let empty = Map::new();
        let map = payload.as_object().unwrap_or(&empty);

        match event_type {
            HookEventType::ToolPre | HookEventType::ToolPost => EventPayload::Tool(ToolPayload {
                tool_name: str_field(map, "tool_name"),
                tool_input: map.get("tool_input").filter(|v| !v.is_null()).cloned(),
                file_paths: str_list(map, "file_paths"),
                command: str_field(map, "command").or_else(|| {
                    map.get("tool_input")
                        .and_then(|i| i.get("command"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }),
                agent: agent_name(map),
                success: map.get("success").and_then(Value::as_bool),
                errors: str_list(map, "errors"),
            }),

            HookEventType::ProtocolEvent => {
                let phase_label = str_field(map, "phase");
                let phase = str_field(map, "event_type")
                    .as_deref()
                    .and_then(Phase::from_event_kind)
                    .or_else(|| phase_label.as_deref().and_then(Phase::from_event_kind));
                EventPayload::Protocol(ProtocolPayload {
                    agent_type: agent_type(map),
                    phase,
                    phase_label,
                    confidence: map.get("confidence").and_then(as_f64),
                })
            }

            HookEventType::QualityGate => match map.get("score").and_then(as_f64) {
                Some(score) => {
                    let gate_name = str_field(map, "gate_name").unwrap_or_else(|| "unknown".into());
                    let threshold = map.get("threshold").and_then(as_f64);
                    let mut record = GateRecord::evaluate(&gate_name, score, threshold);
                    if let Some(agent) = agent_type(map) {
                        record = record.with_agent(agent);
                    }
                    if let Some(feedback) = str_field(map, "feedback") {
                        record = record.with_feedback(&feedback);
                    }
                    record.suggestions = str_list(map, "suggestions");
                    EventPayload::Gate(record)
                }
                None => EventPayload::Other(map.clone()),
            },

            HookEventType::AgentHandoff => {
                let from_agent = str_field(map, "from_agent").or_else(|| str_field(map, "agent_type"));
                match (from_agent, str_field(map, "to_agent")) {
                    (Some(from_agent), Some(to_agent)) => EventPayload::Handoff(AgentHandoff {
                        from_agent,
                        to_agent,
                        handoff_type: str_field(map, "handoff_type")
                            .unwrap_or_else(|| "task_delegation".into()),
                        context: map
                            .get("context")
                            .or_else(|| map.get("document"))
                            .cloned()
                            .unwrap_or(Value::Null),
                    }),
                    _ => EventPayload::Other(map.clone()),
                }
            }

            _ => EventPayload::Other(map.clone()),
        }
    }
}

impl Event {
    /// 解释载荷
    pub fn decoded(&self) -> EventPayload {
        EventPayload::decode(self.hook_event_type, &self.payload)
    }

    /// 本事件对计数器的贡献
    pub fn metrics(&self) -> Metrics {
        Metrics::of(&self.payload)
    }
}

/// 单个事件对计数器的贡献
///
/// 缺失或非数字的字段贡献 0。`cost_usd` 以微美元整数累计，增减无浮点误差。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub tokens_used: u64,
    pub cost_micros: u64,
    pub success: Option<bool>,
    pub tool_name: Option<String>,
    pub error_count: u64,
}

impl Metrics {
    pub fn of(payload: &Value) -> Self {
        let Some(map) = payload.as_object() else {
            return Self::default();
        };

        Self {
            tokens_used: non_negative(map.get("tokens_used")).round() as u64,
            cost_micros: (non_negative(map.get("cost_usd")) * 1_000_000.0).round() as u64,
            success: map.get("success").and_then(Value::as_bool),
            tool_name: str_field(map, "tool_name"),
            error_count: map
                .get("errors")
                .and_then(Value::as_array)
                .map(|a| a.len() as u64)
                .unwrap_or(0),
        }
    }
}

/// 可增减的累计计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub event_count: u64,
    pub tokens_used: u64,
    pub cost_micros: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_count: u64,
    pub event_types: BTreeMap<String, u64>,
    pub tools: BTreeMap<String, u64>,
}

impl Totals {
    /// 累加单个事件
    pub fn add_event(&mut self, event_type: HookEventType, metrics: &Metrics) {
        self.event_count += 1;
        self.tokens_used += metrics.tokens_used;
        self.cost_micros += metrics.cost_micros;
        match metrics.success {
            Some(true) => self.success_count += 1,
            Some(false) => self.failure_count += 1,
            None => {}
        }
        self.error_count += metrics.error_count;
        *self.event_types.entry(event_type.as_str().to_string()).or_default() += 1;
        if let Some(tool) = &metrics.tool_name {
            *self.tools.entry(tool.clone()).or_default() += 1;
        }
    }

    /// 合并另一份计数
    pub fn merge(&mut self, other: &Totals) {
        self.event_count += other.event_count;
        self.tokens_used += other.tokens_used;
        self.cost_micros += other.cost_micros;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.error_count += other.error_count;
        for (k, v) in &other.event_types {
            *self.event_types.entry(k.clone()).or_default() += v;
        }
        for (k, v) in &other.tools {
            *self.tools.entry(k.clone()).or_default() += v;
        }
    }

    /// 扣除另一份计数（删除会话时使用）
    pub fn subtract(&mut self, other: &Totals) {
        self.event_count = self.event_count.saturating_sub(other.event_count);
        self.tokens_used = self.tokens_used.saturating_sub(other.tokens_used);
        self.cost_micros = self.cost_micros.saturating_sub(other.cost_micros);
        self.success_count = self.success_count.saturating_sub(other.success_count);
        self.failure_count = self.failure_count.saturating_sub(other.failure_count);
        self.error_count = self.error_count.saturating_sub(other.error_count);
        subtract_histogram(&mut self.event_types, &other.event_types);
        subtract_histogram(&mut self.tools, &other.tools);
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_micros as f64 / 1_000_000.0
    }

    /// 成功率（没有 success 信号时为 None）
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        (total > 0).then(|| self.success_count as f64 / total as f64)
    }
}

fn subtract_histogram(target: &mut BTreeMap<String, u64>, other: &BTreeMap<String, u64>) {
    for (k, v) in other {
        if let Some(count) = target.get_mut(k) {
            *count = count.saturating_sub(*v);
            if *count == 0 {
                target.remove(k);
            }
        }
    }
}

fn non_negative(value: Option<&Value>) -> f64 {
    value
        .and_then(as_f64)
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(0.0)
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn str_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn agent_type(map: &Map<String, Value>) -> Option<AgentType> {
    agent_name(map).map(|name| AgentType::from_str_lossy(&name))
}

fn agent_name(map: &Map<String, Value>) -> Option<String> {
    str_field(map, "agent_type").or_else(|| str_field(map, "agent_name"))
}

impl AgentType {
    fn from_str_lossy(name: &str) -> Self {
        name.parse().unwrap_or_else(|never| match never {})
    }
}
