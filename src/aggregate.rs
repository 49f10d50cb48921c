//! 会话 / 项目聚合
//!
//! 每个事件只做常数次更新：会话按 `session_id` 聚合，项目按 `source_app` 聚合，
//! 项目计数通过增量（加上新事件、删除会话时减去会话计数）维护，从不全量重算。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::Serialize;

use crate::gate::{AgentHandoff, AgentRun, Phase};
use crate::payload::{EventPayload, Totals};
use crate::types::Event;

/// 每个会话保留的默认事件数
pub const DEFAULT_MAX_SESSION_EVENTS: usize = 100;

/// 会话视图（派生，不持久化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub id: String,
    /// 首个事件的 source_app，决定所属项目
    pub source_app: String,
    /// 最近的事件在前，有上限
    pub events: VecDeque<Event>,
    pub first_event: Option<String>,
    pub last_event: Option<String>,
    pub totals: Totals,
    /// agent 名 → 协议状态
    pub agents: BTreeMap<String, AgentRun>,
    pub handoffs: Vec<AgentHandoff>,
    /// 非法阶段迁移次数
    pub protocol_violations: u64,
}

impl SessionView {
    fn new(id: &str, source_app: &str) -> Self {
        Self {
            id: id.to_string(),
            source_app: source_app.to_string(),
            events: VecDeque::new(),
            first_event: None,
            last_event: None,
            totals: Totals::default(),
            agents: BTreeMap::new(),
            handoffs: Vec::new(),
            protocol_violations: 0,
        }
    }

    /// 推进协议状态
    fn track_protocol(&mut self, event: &Event, cap: usize) {
        match event.decoded() {
            EventPayload::Protocol(protocol) => {
                let Some(phase) = protocol.phase else {
                    return;
                };
                let agent = protocol
                    .agent_type
                    .map(|a| a.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let run = self.agents.entry(agent).or_default();
                if let Some(confidence) = protocol.confidence {
                    run.last_confidence = Some(confidence);
                }
                if let Err(e) = run.advance(phase) {
                    tracing::debug!("⚠️ session {}: {}", self.id, e);
                    self.protocol_violations += 1;
                }
            }
            EventPayload::Gate(gate) => {
                let agent = gate
                    .agent_type
                    .as_ref()
                    .map(|a| a.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let run = self.agents.entry(agent).or_default();
                if let Err(e) = run.record_gate(&gate) {
                    tracing::debug!("⚠️ session {}: {}", self.id, e);
                    self.protocol_violations += 1;
                }
            }
            EventPayload::Handoff(handoff) => {
                // 交接必须紧跟在 complete 之后；违规时仍记录交接
                let run = self.agents.entry(handoff.from_agent.clone()).or_default();
                if let Err(e) = run.advance(Phase::Handoff) {
                    tracing::debug!("⚠️ session {}: {}", self.id, e);
                    self.protocol_violations += 1;
                }
                self.handoffs.push(handoff);
                if self.handoffs.len() > cap {
                    self.handoffs.remove(0);
                }
            }
            EventPayload::Tool(_) | EventPayload::Other(_) => {}
        }
    }
}

/// 项目分组（派生）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectGroup {
    pub source_app: String,
    pub session_ids: BTreeSet<String>,
    /// 所有成员会话最近事件的最大值
    pub last_activity: Option<String>,
    pub totals: Totals,
}

/// 项目视图（排序后的快照）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectView {
    pub source_app: String,
    pub last_activity: Option<String>,
    pub totals: Totals,
    /// 按 last_event 降序
    pub sessions: Vec<SessionView>,
}

/// 增量聚合器
#[derive(Debug, Clone)]
pub struct Aggregator {
    sessions: HashMap<String, SessionView>,
    projects: HashMap<String, ProjectGroup>,
    max_session_events: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSION_EVENTS)
    }
}

impl Aggregator {
    pub fn new(max_session_events: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            projects: HashMap::new(),
            max_session_events: max_session_events.max(1),
        }
    }

    /// 折叠一个事件
    pub fn apply(&mut self, event: &Event) {
        let cap = self.max_session_events;
        let session = self
            .sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| SessionView::new(&event.session_id, &event.source_app));

        session.events.push_front(event.clone());
        session.events.truncate(cap);

        if session.first_event.as_deref().map_or(true, |f| event.timestamp.as_str() < f) {
            session.first_event = Some(event.timestamp.clone());
        }
        if session.last_event.as_deref().map_or(true, |l| event.timestamp.as_str() > l) {
            session.last_event = Some(event.timestamp.clone());
        }

        let metrics = event.metrics();
        session.totals.add_event(event.hook_event_type, &metrics);
        session.track_protocol(event, cap);

        let project = self
            .projects
            .entry(session.source_app.clone())
            .or_insert_with(|| ProjectGroup {
                source_app: session.source_app.clone(),
                ..Default::default()
            });
        project.session_ids.insert(session.id.clone());
        project.totals.add_event(event.hook_event_type, &metrics);
        if project.last_activity < session.last_event {
            project.last_activity = session.last_event.clone();
        }
    }

    /// 删除会话，从所属项目中扣除其计数
    pub fn remove_session(&mut self, session_id: &str) -> Option<SessionView> {
        let session = self.sessions.remove(session_id)?;

        if let Some(project) = self.projects.get_mut(&session.source_app) {
            project.session_ids.remove(session_id);
            project.totals.subtract(&session.totals);

            if project.session_ids.is_empty() {
                self.projects.remove(&session.source_app);
            } else {
                project.last_activity = project
                    .session_ids
                    .iter()
                    .filter_map(|id| self.sessions.get(id))
                    .filter_map(|s| s.last_event.clone())
                    .max();
            }
        }

        Some(session)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.projects.clear();
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionView> {
        self.sessions.get(session_id)
    }

    pub fn project(&self, source_app: &str) -> Option<&ProjectGroup> {
        self.projects.get(source_app)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 会话列表，按 last_event 降序
    pub fn sessions(&self) -> Vec<&SessionView> {
        let mut sessions: Vec<&SessionView> = self.sessions.values().collect();
        sessions.sort_by(|a, b| {
            b.last_event
                .cmp(&a.last_event)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    /// 项目列表，按最近活动降序，组内会话按 last_event 降序
    pub fn projects(&self) -> Vec<ProjectView> {
        let mut projects: Vec<&ProjectGroup> = self.projects.values().collect();
        projects.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.source_app.cmp(&b.source_app))
        });

        projects
            .into_iter()
            .map(|project| {
                let mut sessions: Vec<SessionView> = project
                    .session_ids
                    .iter()
                    .filter_map(|id| self.sessions.get(id).cloned())
                    .collect();
                sessions.sort_by(|a, b| {
                    b.last_event
                        .cmp(&a.last_event)
                        .then_with(|| a.id.cmp(&b.id))
                });
                ProjectView {
                    source_app: project.source_app.clone(),
                    last_activity: project.last_activity.clone(),
                    totals: project.totals.clone(),
                    sessions,
                }
            })
            .collect()
    }

    /// 全部项目计数之和
    pub fn grand_totals(&self) -> Totals {
        let mut totals = Totals::default();
        for project in self.projects.values() {
            totals.merge(&project.totals);
        }
        totals
    }
}
