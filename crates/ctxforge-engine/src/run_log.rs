use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use ctxforge_core::event::{ProgressEvent, ProgressKind};
use ctxforge_core::types::StepStatus;

/// JSONL progress logger.
///
/// Writes one JSON object per line for a single session or comparison
/// channel. Lines are flushed as they are written, so a crash loses at most
/// the event in flight.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    channel: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{channel}/{timestamp}.jsonl`.
    /// `level`: 1 = lifecycle, 2 = + finished steps, 3 = every step transition.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Drain `rx` into the log until the channel's terminal event, the bus
    /// closing, or cancellation. Subscribe before the run starts so the
    /// opening events are not missed. Returns the file written, if any.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<ProgressEvent>,
        channel: String,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let channel_dir = self.log_dir.join(&channel);
        if let Err(e) = tokio::fs::create_dir_all(&channel_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let log_path = channel_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.channel != channel {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Channel closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// None when the event is below the configured level.
    fn event_to_entry(&self, event: &ProgressEvent) -> Option<LogEntry> {
        let entry = |node_id: Option<String>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            channel: event.channel.clone(),
            event_type: event.kind.as_str().to_string(),
            node_id,
            detail,
        };

        match event.kind {
            // L1: lifecycle
            ProgressKind::SimulationStarted
            | ProgressKind::SimulationCompleted
            | ProgressKind::SimulationError
            | ProgressKind::ComparisonCompleted => Some(entry(None, Some(event.data.clone()))),

            // L2: finished steps and comparison members
            ProgressKind::ComparisonStep if self.level >= 2 => {
                Some(entry(None, Some(event.data.clone())))
            }
            ProgressKind::StepUpdate if self.level >= 2 => {
                let step = &event.data["step"];
                let status: Option<StepStatus> =
                    serde_json::from_value(step["status"].clone()).ok();
                let finished = status.is_some_and(|s| s.is_terminal());
                if !finished && self.level < 3 {
                    return None;
                }
                Some(entry(
                    step["nodeId"].as_str().map(str::to_string),
                    Some(serde_json::json!({
                        "status": step["status"],
                        "variant": step["nodeVariant"],
                        "execution_time_ms": step["executionTimeMs"],
                        "tokens": step["tokens"]["total"],
                        "cost_usd": step["costUsd"],
                        "error": step["error"],
                        "output_preview": truncate_json(&step["output"], 200),
                    })),
                ))
            }

            _ => None,
        }
    }
}

/// Truncate a JSON value's text for logging, on a char boundary.
fn truncate_json(value: &serde_json::Value, max_chars: usize) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let s = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if s.chars().count() <= max_chars {
        Some(s)
    } else {
        Some(format!("{}...", s.chars().take(max_chars).collect::<String>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::event::EventBus;
    use ctxforge_core::graph::NodeVariant;
    use ctxforge_core::traits::EventSink;
    use ctxforge_core::types::{ExecutionSession, ExecutionStep, SessionId, TokenCounts};
    use serde_json::json;

    fn session(id: &str) -> ExecutionSession {
        ExecutionSession::start(SessionId::from_string(id), None, json!("hi"))
    }

    fn running_step() -> ExecutionStep {
        let mut step = ExecutionStep::pending("p", NodeVariant::PromptTemplate, "Prompt", json!("hi"));
        step.start();
        step
    }

    #[test]
    fn test_event_level_filtering() {
        let s = session("s1");
        let mut step = running_step();
        let running = ProgressEvent::step_update(&s, &step);
        step.complete(json!("done"), TokenCounts::new(3, 4), 0.01, 5);
        let completed = ProgressEvent::step_update(&s, &step);
        let started = ProgressEvent::simulation_started(&s);

        let l1 = RunLogger::new("/tmp", 1);
        assert!(l1.event_to_entry(&started).is_some());
        assert!(l1.event_to_entry(&completed).is_none());

        let l2 = RunLogger::new("/tmp", 2);
        assert!(l2.event_to_entry(&running).is_none());
        let entry = l2.event_to_entry(&completed).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some("p"));
        assert_eq!(entry.detail.as_ref().unwrap()["tokens"], 7);

        let l3 = RunLogger::new("/tmp", 3);
        assert!(l3.event_to_entry(&running).is_some());
    }

    #[test]
    fn test_truncate_json() {
        assert_eq!(truncate_json(&json!(null), 5), None);
        assert_eq!(truncate_json(&json!("short"), 10).as_deref(), Some("short"));
        let long = truncate_json(&json!("ééééééééééé"), 4).unwrap();
        assert_eq!(long, "éééé...");
    }

    #[tokio::test]
    async fn test_writes_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let rx = bus.subscribe_channel("s1");

        let s = session("s1");
        let mut step = running_step();
        bus.publish(ProgressEvent::simulation_started(&s));
        bus.publish(ProgressEvent::step_update(&s, &step));
        step.complete(json!("done"), TokenCounts::new(1, 1), 0.0, 1);
        bus.publish(ProgressEvent::step_update(&s, &step));
        bus.publish(ProgressEvent::simulation_completed(&s));

        let path = RunLogger::new(dir.path(), 2)
            .run(rx, "s1".into(), CancellationToken::new())
            .await
            .unwrap();

        assert!(path.starts_with(dir.path().join("s1")));
        let content = std::fs::read_to_string(&path).unwrap();
        let kinds: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, ["simulation_started", "step_update", "simulation_completed"]);
    }
}
