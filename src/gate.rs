//! Agent 协议与质量门
//!
//! 所有 Agent、所有质量门共用同一个阈值判定：
//!
//! - `confidence >= 0.8` → `proceed`
//! - `0.6 <= confidence < 0.8` → `clarify`
//! - `confidence < 0.6` → `block`
//!
//! 质量门之间只有 `threshold` 不同，比较逻辑完全一致。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::HookEventType;

/// 通过阈值（strict 模式）
pub const PROCEED_THRESHOLD: f64 = 0.8;
/// 澄清阈值，低于此值即阻断
pub const CLARIFY_THRESHOLD: f64 = 0.6;
/// 安全相关质量门的阈值
pub const SECURITY_THRESHOLD: f64 = 0.9;
/// 协议版本
pub const PROTOCOL_VERSION: &str = "2.0";

/// 判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Proceed,
    Clarify,
    Block,
}

impl Verdict {
    /// 由置信度得出判定（NaN 视为阻断）
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= PROCEED_THRESHOLD {
            Verdict::Proceed
        } else if confidence >= CLARIFY_THRESHOLD {
            Verdict::Clarify
        } else {
            Verdict::Block
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Proceed => "proceed",
            Verdict::Clarify => "clarify",
            Verdict::Block => "block",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent 类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentType {
    Researcher,
    Implementer,
    Reviewer,
    Consensus,
    MemoryKeeper,
    /// 未知类型原样保留
    Other(String),
}

impl AgentType {
    pub fn as_str(&self) -> &str {
        match self {
            AgentType::Researcher => "researcher",
            AgentType::Implementer => "implementer",
            AgentType::Reviewer => "reviewer",
            AgentType::Consensus => "consensus",
            AgentType::MemoryKeeper => "memory-keeper",
            AgentType::Other(name) => name,
        }
    }
}

impl FromStr for AgentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "researcher" => AgentType::Researcher,
            "implementer" => AgentType::Implementer,
            "reviewer" => AgentType::Reviewer,
            "consensus" => AgentType::Consensus,
            "memory-keeper" | "memory_keeper" => AgentType::MemoryKeeper,
            _ => AgentType::Other(s.to_string()),
        })
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AgentType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(AgentType::from_str(&s).unwrap_or_else(|never| match never {}))
    }
}

/// 质量门定义
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateSpec {
    pub name: &'static str,
    pub threshold: f64,
    /// 安全相关：未通过即阻断
    pub security_sensitive: bool,
}

/// 已知质量门
pub const GATES: &[GateSpec] = &[
    // researcher
    GateSpec { name: "input_clarity", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    GateSpec { name: "source_coverage", threshold: 0.7, security_sensitive: false },
    GateSpec { name: "synthesis_quality", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    // implementer
    GateSpec { name: "requirements_clarity", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    GateSpec { name: "code_quality", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    GateSpec { name: "test_coverage", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    GateSpec { name: "no_regressions", threshold: 1.0, security_sensitive: false },
    // reviewer
    GateSpec { name: "review_completeness", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    GateSpec { name: "security_check", threshold: SECURITY_THRESHOLD, security_sensitive: true },
    // consensus
    GateSpec { name: "decision_clarity", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    GateSpec { name: "perspective_coverage", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    GateSpec { name: "decision_confidence", threshold: PROCEED_THRESHOLD, security_sensitive: false },
    // memory-keeper
    GateSpec { name: "memory_relevance", threshold: 0.7, security_sensitive: false },
];

/// 查找质量门定义，未知名称使用默认阈值
pub fn gate_spec(name: &str) -> GateSpec {
    GATES.iter().copied().find(|g| g.name == name).unwrap_or(GateSpec {
        name: "unknown",
        threshold: PROCEED_THRESHOLD,
        security_sensitive: false,
    })
}

/// 质量门记录
///
/// `passed` 永远由 `score` 与 `threshold` 推导，不能单独设置。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateRecord {
    pub session_id: String,
    pub agent_type: Option<AgentType>,
    pub gate_name: String,
    pub score: f64,
    pub threshold: f64,
    passed: bool,
    blocking: bool,
    pub feedback: String,
    pub suggestions: Vec<String>,
}

impl GateRecord {
    /// 评估质量门
    ///
    /// `threshold` 为 None 时使用注册表中的阈值。分数截断到 [0, 1]。
    pub fn evaluate(gate_name: &str, score: f64, threshold: Option<f64>) -> Self {
        let spec = gate_spec(gate_name);
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        let threshold = threshold.unwrap_or(spec.threshold);
        let passed = score >= threshold;
        let blocking = !passed && (score < CLARIFY_THRESHOLD || spec.security_sensitive);

        Self {
            session_id: String::new(),
            agent_type: None,
            gate_name: gate_name.to_string(),
            score,
            threshold,
            passed,
            blocking,
            feedback: String::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn with_agent(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    pub fn with_feedback(mut self, feedback: &str) -> Self {
        self.feedback = feedback.to_string();
        self
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }

    /// 按分数给出的判定
    pub fn verdict(&self) -> Verdict {
        Verdict::from_confidence(self.score)
    }
}

/// Agent 交接记录（单向，无回复通道）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHandoff {
    pub from_agent: String,
    pub to_agent: String,
    #[serde(default = "default_handoff_type")]
    pub handoff_type: String,
    #[serde(default)]
    pub context: Value,
}

fn default_handoff_type() -> String {
    "task_delegation".to_string()
}

/// 协议阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Spawn,
    Progress,
    Gate,
    Complete,
    Handoff,
    Error,
    Blocked,
}

impl Phase {
    /// 终止阶段
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Handoff | Phase::Error | Phase::Blocked)
    }

    /// 协议事件中的 `event_type` 字段
    pub fn from_event_kind(kind: &str) -> Option<Self> {
        match kind {
            "spawn" => Some(Phase::Spawn),
            "progress" => Some(Phase::Progress),
            "gate" => Some(Phase::Gate),
            "complete" => Some(Phase::Complete),
            "handoff" => Some(Phase::Handoff),
            "error" => Some(Phase::Error),
            _ => None,
        }
    }
}

/// 非法的阶段迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid protocol transition: {from:?} -> {to:?}")]
pub struct ProtocolViolation {
    pub from: Option<Phase>,
    pub to: Phase,
}

/// 单次 Agent 调用的协议状态机
///
/// `spawn → (progress | gate)* → complete → handoff?`，
/// `error` 与阻断的质量门进入终止态；终止后的 `spawn` 开启新一次调用。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentRun {
    phase: Option<Phase>,
    pub last_confidence: Option<f64>,
    pub gates_passed: u32,
    pub gates_failed: u32,
    pub invocations: u32,
}

impl AgentRun {
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    /// 推进到下一阶段
    pub fn advance(&mut self, to: Phase) -> Result<Phase, ProtocolViolation> {
        let allowed = match (self.phase, to) {
            (None, Phase::Spawn) => true,
            (Some(from), Phase::Spawn) => from.is_terminal(),
            (Some(Phase::Spawn | Phase::Progress | Phase::Gate), next) => matches!(
                next,
                Phase::Progress | Phase::Gate | Phase::Complete | Phase::Error | Phase::Blocked
            ),
            (Some(Phase::Complete), Phase::Handoff) => true,
            _ => false,
        };

        if !allowed {
            return Err(ProtocolViolation { from: self.phase, to });
        }
        if to == Phase::Spawn {
            self.invocations += 1;
        }
        self.phase = Some(to);
        Ok(to)
    }

    /// 记录质量门结果；阻断的质量门使本次调用进入 `blocked`
    pub fn record_gate(&mut self, gate: &GateRecord) -> Result<Phase, ProtocolViolation> {
        self.advance(Phase::Gate)?;
        if gate.passed() {
            self.gates_passed += 1;
        } else {
            self.gates_failed += 1;
        }
        if gate.blocking() {
            return self.advance(Phase::Blocked);
        }
        Ok(Phase::Gate)
    }
}

/// 接入时补全协议字段
///
/// - 带 `confidence` 的载荷补 `verdict` / `blocking`
/// - `QualityGate` 带 `score` 时重写为一致的质量门记录（`passed` 以推导值为准）
/// - 协议事件补 `protocol_version`
pub fn annotate_payload(event_type: HookEventType, payload: &mut Map<String, Value>) {
    if let Some(confidence) = payload.get("confidence").and_then(as_f64) {
        let verdict = Verdict::from_confidence(confidence);
        payload.insert("verdict".into(), Value::from(verdict.as_str()));
        payload.insert("blocking".into(), Value::Bool(verdict == Verdict::Block));
    }

    if event_type == HookEventType::QualityGate {
        if let Some(score) = payload.get("score").and_then(as_f64) {
            let gate_name = payload
                .get("gate_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let threshold = payload.get("threshold").and_then(as_f64);
            let record = GateRecord::evaluate(&gate_name, score, threshold);

            payload.insert("gate_name".into(), Value::from(gate_name));
            payload.insert("score".into(), Value::from(record.score));
            payload.insert("threshold".into(), Value::from(record.threshold));
            payload.insert("passed".into(), Value::Bool(record.passed()));
            payload.insert("blocking".into(), Value::Bool(record.blocking()));
            payload.insert("verdict".into(), Value::from(record.verdict().as_str()));
        }
    }

    if event_type.is_protocol() && !payload.contains_key("protocol_version") {
        payload.insert("protocol_version".into(), Value::from(PROTOCOL_VERSION));
    }
}

/// 宽松读取数字（数字或数字字符串）
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
