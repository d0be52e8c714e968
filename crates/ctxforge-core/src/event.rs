use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::traits::EventSink;
use crate::types::{ComparisonMember, ComparisonRun, ExecutionSession, ExecutionStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    SimulationStarted,
    StepUpdate,
    SimulationCompleted,
    SimulationError,
    ComparisonStep,
    ComparisonCompleted,
}

impl ProgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulationStarted => "simulation_started",
            Self::StepUpdate => "step_update",
            Self::SimulationCompleted => "simulation_completed",
            Self::SimulationError => "simulation_error",
            Self::ComparisonStep => "comparison_step",
            Self::ComparisonCompleted => "comparison_completed",
        }
    }
}

/// A progress event pushed to observers of one session or comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Channel key: the session id or comparison id the event belongs to.
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(channel: impl Into<String>, kind: ProgressKind, data: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn simulation_started(session: &ExecutionSession) -> Self {
        Self::new(
            &session.session_id.0,
            ProgressKind::SimulationStarted,
            serde_json::json!({
                "sessionId": session.session_id,
                "graphId": session.graph_id,
                "input": session.input,
            }),
        )
    }

    pub fn step_update(session: &ExecutionSession, step: &ExecutionStep) -> Self {
        Self::new(
            &session.session_id.0,
            ProgressKind::StepUpdate,
            serde_json::json!({
                "sessionId": session.session_id,
                "step": step,
            }),
        )
    }

    pub fn simulation_completed(session: &ExecutionSession) -> Self {
        Self::new(
            &session.session_id.0,
            ProgressKind::SimulationCompleted,
            serde_json::json!({
                "sessionId": session.session_id,
                "finalOutput": session.final_output,
                "totalMetrics": session.total_metrics,
                "stepCount": session.steps.len(),
            }),
        )
    }

    pub fn simulation_error(session: &ExecutionSession) -> Self {
        Self::new(
            &session.session_id.0,
            ProgressKind::SimulationError,
            serde_json::json!({
                "sessionId": session.session_id,
                "error": session.error,
                "partialOutput": session.final_output,
                "totalMetrics": session.total_metrics,
                "stepCount": session.steps.len(),
            }),
        )
    }

    pub fn comparison_step(run: &ComparisonRun, member: &ComparisonMember) -> Self {
        let session = member.session();
        Self::new(
            &run.comparison_id.0,
            ProgressKind::ComparisonStep,
            serde_json::json!({
                "comparisonId": run.comparison_id,
                "graphId": member.graph_id,
                "sessionId": session.map(|s| &s.session_id),
                "status": session.map(|s| s.status),
                "totalMetrics": session.map(|s| s.total_metrics),
                "error": member.error(),
            }),
        )
    }

    pub fn comparison_completed(run: &ComparisonRun) -> Self {
        Self::new(
            &run.comparison_id.0,
            ProgressKind::ComparisonCompleted,
            serde_json::json!({
                "comparisonId": run.comparison_id,
                "summary": run.summary,
            }),
        )
    }

    /// Last event a channel will carry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ProgressKind::SimulationCompleted
                | ProgressKind::SimulationError
                | ProgressKind::ComparisonCompleted
        )
    }
}

/// In-process event bus using tokio broadcast channels.
///
/// Each channel key gets its own sender, so a subscriber to one session never
/// sees another's events. A firehose sender additionally carries every event.
/// Delivery is best-effort: slow subscribers lag and lose events.
pub struct EventBus {
    capacity: usize,
    firehose: broadcast::Sender<ProgressEvent>,
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            capacity,
            firehose,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to every channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.firehose.subscribe()
    }

    /// Subscribe to a single session or comparison channel.
    pub fn subscribe_channel(&self, key: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop a channel's sender if nobody is listening any more.
    pub fn release_channel(&self, key: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if channels.get(key).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(key);
        }
    }

    /// Number of channels that currently have a sender.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: ProgressEvent) {
        let terminal = event.is_terminal();
        {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = channels.get(&event.channel) {
                // Ignore error if no receivers
                let _ = tx.send(event.clone());
            }
            // Dropping the sender lets channel subscribers observe Closed after draining
            if terminal && channels.remove(&event.channel).is_some() {
                debug!(channel = %event.channel, "Closed progress channel");
            }
        }
        let _ = self.firehose.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
