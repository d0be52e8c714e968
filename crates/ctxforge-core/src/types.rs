use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::NodeVariant;
use crate::node_config::MemoryOperation;

/// Unique execution session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique comparison identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComparisonId(pub String);

impl ComparisonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ComparisonId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ComparisonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Provider boundary ───────────────────────────────────────────

/// Role in a chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }
}

/// One chat-completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// Total characters across all messages.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Token usage as reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub content: String,
    /// None when the provider did not report usage.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// A semantic-search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Passage {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
            source: None,
        }
    }
}

/// Side effect requested by a MemoryStore node; applied by the runtime, never by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryIntent {
    pub operation: MemoryOperation,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    pub max_tokens: usize,
}

// ── Execution records ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenCounts {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// Record of one node's execution within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub step_id: String,
    pub node_id: String,
    pub node_variant: NodeVariant,
    pub step_name: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    pub status: StepStatus,
    pub execution_time_ms: u64,
    pub tokens: TokenCounts,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// State summary attached by StateTracker nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryIntent>,
}

impl ExecutionStep {
    /// A fresh `Pending` step.
    pub fn pending(
        node_id: impl Into<String>,
        node_variant: NodeVariant,
        step_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            step_id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            node_variant,
            step_name: step_name.into(),
            input,
            output: None,
            status: StepStatus::Pending,
            execution_time_ms: 0,
            tokens: TokenCounts::default(),
            cost_usd: 0.0,
            error: None,
            state: None,
            memory: None,
        }
    }

    /// Pending → Running. Returns false if the step was not pending.
    pub fn start(&mut self) -> bool {
        if self.status != StepStatus::Pending {
            return false;
        }
        self.status = StepStatus::Running;
        true
    }

    /// Running → Completed. Terminal steps are left untouched.
    pub fn complete(
        &mut self,
        output: serde_json::Value,
        tokens: TokenCounts,
        cost_usd: f64,
        elapsed_ms: u64,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.tokens = tokens;
        self.cost_usd = cost_usd;
        self.execution_time_ms = elapsed_ms;
        true
    }

    /// Running → Failed. Terminal steps are left untouched.
    pub fn fail(&mut self, error: impl Into<String>, elapsed_ms: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.execution_time_ms = elapsed_ms;
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_time_ms: u64,
}

/// The step and message that stopped a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailure {
    #[serde(default)]
    pub node_id: Option<String>,
    pub message: String,
}

/// One end-to-end execution of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSession {
    pub session_id: SessionId,
    #[serde(default)]
    pub graph_id: Option<String>,
    pub status: SessionStatus,
    pub input: serde_json::Value,
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub final_output: Option<serde_json::Value>,
    pub total_metrics: SessionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionFailure>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionSession {
    pub fn start(
        session_id: SessionId,
        graph_id: Option<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            graph_id,
            status: SessionStatus::Running,
            input,
            steps: Vec::new(),
            final_output: None,
            total_metrics: SessionMetrics::default(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Output of the most recent completed step.
    pub fn last_output(&self) -> Option<&serde_json::Value> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.output.as_ref())
    }

    /// Sum tokens, cost, and time across all recorded steps.
    pub fn recompute_metrics(&mut self) {
        self.total_metrics = self.steps.iter().fold(SessionMetrics::default(), |acc, s| {
            SessionMetrics {
                total_tokens: acc.total_tokens + s.tokens.total,
                total_cost: acc.total_cost + s.cost_usd,
                total_time_ms: acc.total_time_ms + s.execution_time_ms,
            }
        });
    }

    /// Running → Completed.
    pub fn complete(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Completed;
        self.final_output = self.steps.last().and_then(|s| s.output.clone());
        self.recompute_metrics();
        self.completed_at = Some(Utc::now());
    }

    /// Running → Failed, keeping the last good output.
    pub fn fail(&mut self, node_id: Option<String>, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Failed;
        self.final_output = self.last_output().cloned();
        self.error = Some(SessionFailure {
            node_id,
            message: message.into(),
        });
        self.recompute_metrics();
        self.completed_at = Some(Utc::now());
    }

    pub fn failed_step(&self) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

// ── Comparison ──────────────────────────────────────────────────

/// What happened to one graph in a comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberOutcome {
    Session(ExecutionSession),
    /// The graph could not be resolved or scheduled; no session ran.
    Rejected { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonMember {
    pub graph_id: String,
    #[serde(default)]
    pub graph_name: Option<String>,
    pub outcome: MemberOutcome,
}

impl ComparisonMember {
    pub fn session(&self) -> Option<&ExecutionSession> {
        match &self.outcome {
            MemberOutcome::Session(s) => Some(s),
            MemberOutcome::Rejected { .. } => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.session()
            .is_some_and(|s| s.status == SessionStatus::Completed)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            MemberOutcome::Session(s) => s.error.as_ref().map(|e| e.message.as_str()),
            MemberOutcome::Rejected { error } => Some(error.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSummary {
    pub graph_count: usize,
    pub succeeded_count: usize,
    pub mean_execution_time_ms: f64,
    pub total_cost_usd: f64,
}

impl ComparisonSummary {
    /// Numeric aggregates come from completed sessions only; every member counts toward `graph_count`.
    pub fn from_members(members: &[ComparisonMember]) -> Self {
        let completed: Vec<&ExecutionSession> = members
            .iter()
            .filter(|m| m.succeeded())
            .filter_map(|m| m.session())
            .collect();

        let mean_execution_time_ms = if completed.is_empty() {
            0.0
        } else {
            completed
                .iter()
                .map(|s| s.total_metrics.total_time_ms as f64)
                .sum::<f64>()
                / completed.len() as f64
        };

        Self {
            graph_count: members.len(),
            succeeded_count: completed.len(),
            mean_execution_time_ms,
            total_cost_usd: completed.iter().map(|s| s.total_metrics.total_cost).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Running,
    Completed,
}

/// Several graphs executed against the same input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRun {
    pub comparison_id: ComparisonId,
    pub input: serde_json::Value,
    pub status: ComparisonStatus,
    /// In the order the graphs were requested.
    pub members: Vec<ComparisonMember>,
    pub summary: ComparisonSummary,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ComparisonRun {
    pub fn start(comparison_id: ComparisonId, input: serde_json::Value) -> Self {
        Self {
            comparison_id,
            input,
            status: ComparisonStatus::Running,
            members: Vec::new(),
            summary: ComparisonSummary::default(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn member(&self, graph_id: &str) -> Option<&ComparisonMember> {
        self.members.iter().find(|m| m.graph_id == graph_id)
    }

    pub fn finish(&mut self, members: Vec<ComparisonMember>) {
        self.summary = ComparisonSummary::from_members(&members);
        self.members = members;
        self.status = ComparisonStatus::Completed;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completed_step(tokens: u64, cost: f64, ms: u64) -> ExecutionStep {
        let mut step = ExecutionStep::pending("n", NodeVariant::Passthrough, "n", json!("x"));
        step.start();
        step.complete(json!("out"), TokenCounts::new(tokens, 0), cost, ms);
        step
    }

    #[test]
    fn test_step_transitions() {
        let mut step = ExecutionStep::pending("a", NodeVariant::Input, "Input", json!("hi"));
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.start());
        assert!(!step.start());
        assert!(step.complete(json!("hi"), TokenCounts::new(1, 2), 0.5, 3));
        assert_eq!(step.tokens.total, 3);
        // Immutable once terminal
        assert!(!step.fail("late", 9));
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.error.is_none());
    }

    #[test]
    fn test_session_complete_sums_metrics() {
        let mut session = ExecutionSession::start(SessionId::new(), None, json!("q"));
        session.steps.push(completed_step(10, 0.1, 5));
        session.steps.push(completed_step(20, 0.2, 7));
        session.complete();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.total_metrics.total_tokens, 30);
        assert!((session.total_metrics.total_cost - 0.3).abs() < 1e-9);
        assert_eq!(session.total_metrics.total_time_ms, 12);
        assert_eq!(session.final_output, Some(json!("out")));
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn test_session_fail_keeps_last_good_output() {
        let mut session = ExecutionSession::start(SessionId::new(), Some("g".into()), json!("q"));
        session.steps.push(completed_step(4, 0.0, 1));
        let mut bad = ExecutionStep::pending("p", NodeVariant::PromptTemplate, "Prompt", json!("q"));
        bad.start();
        bad.fail("boom", 2);
        session.steps.push(bad);
        session.fail(Some("p".into()), "boom");

        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.final_output, Some(json!("out")));
        assert_eq!(session.failed_step().unwrap().node_id, "p");
        assert_eq!(session.error.as_ref().unwrap().node_id.as_deref(), Some("p"));

        // Terminal sessions do not flip back
        session.complete();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[test]
    fn test_summary_ignores_failed_numbers() {
        let mut ok = ExecutionSession::start(SessionId::new(), Some("a".into()), json!(""));
        ok.steps.push(completed_step(10, 1.0, 100));
        ok.complete();

        let mut ok2 = ExecutionSession::start(SessionId::new(), Some("c".into()), json!(""));
        ok2.steps.push(completed_step(10, 0.5, 300));
        ok2.complete();

        let mut failed = ExecutionSession::start(SessionId::new(), Some("b".into()), json!(""));
        failed.steps.push(completed_step(10, 7.0, 900));
        failed.fail(None, "nope");

        let members = vec![
            ComparisonMember {
                graph_id: "a".into(),
                graph_name: None,
                outcome: MemberOutcome::Session(ok),
            },
            ComparisonMember {
                graph_id: "b".into(),
                graph_name: None,
                outcome: MemberOutcome::Session(failed),
            },
            ComparisonMember {
                graph_id: "c".into(),
                graph_name: None,
                outcome: MemberOutcome::Session(ok2),
            },
            ComparisonMember {
                graph_id: "d".into(),
                graph_name: None,
                outcome: MemberOutcome::Rejected {
                    error: "missing".into(),
                },
            },
        ];

        let summary = ComparisonSummary::from_members(&members);
        assert_eq!(summary.graph_count, 4);
        assert_eq!(summary.succeeded_count, 2);
        assert!((summary.mean_execution_time_ms - 200.0).abs() < 1e-9);
        assert!((summary.total_cost_usd - 1.5).abs() < 1e-9);
        assert_eq!(members[3].error(), Some("missing"));
    }
}
