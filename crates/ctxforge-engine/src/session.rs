use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::event::ProgressEvent;
use ctxforge_core::graph::{Graph, GraphNode};
use ctxforge_core::traits::{EventSink, RunStore};
use ctxforge_core::types::{ExecutionSession, ExecutionStep, MemoryIntent, SessionId, TokenCounts};

use crate::context::RuntimeContext;
use crate::executors::{ExecutorRegistry, NodeOutput};
use crate::input::{self, ResolvedInput};
use crate::scheduler;

/// Runs one graph end to end, one node at a time in schedule order.
///
/// Each step transition is published as a `step_update` on the session's
/// channel before the next node starts. The first failing node stops the
/// session; nothing is retried.
pub struct SessionRunner {
    ctx: RuntimeContext,
    executors: Arc<ExecutorRegistry>,
    events: Arc<dyn EventSink>,
    store: Option<Arc<dyn RunStore>>,
}

impl SessionRunner {
    pub fn new(ctx: RuntimeContext, events: Arc<dyn EventSink>) -> Self {
        Self {
            ctx,
            executors: Arc::new(ExecutorRegistry::with_builtins()),
            events,
            store: None,
        }
    }

    pub fn with_executors(mut self, executors: Arc<ExecutorRegistry>) -> Self {
        self.executors = executors;
        self
    }

    /// Save every terminal session here.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn store(&self) -> Option<&Arc<dyn RunStore>> {
        self.store.as_ref()
    }

    /// Run under a fresh session id with no cancellation.
    pub async fn run(&self, graph: &Graph, input: Value) -> Result<ExecutionSession> {
        self.run_with(graph, input, SessionId::new(), CancellationToken::new())
            .await
    }

    /// Run under a caller-chosen session id, so observers can subscribe first.
    ///
    /// Structural errors (invalid graph, cycle) are returned before any event
    /// is published. Node failures are not errors here: they come back as a
    /// `Failed` session.
    pub async fn run_with(
        &self,
        graph: &Graph,
        input: Value,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> Result<ExecutionSession> {
        let order = scheduler::order_graph(graph)?;

        let mut session = ExecutionSession::start(session_id, graph.id.clone(), input);
        info!(
            session_id = %session.session_id,
            graph_id = graph.id.as_deref().unwrap_or("-"),
            nodes = order.len(),
            "Session started"
        );
        self.events
            .publish(ProgressEvent::simulation_started(&session));

        let mut outputs: HashMap<String, Value> = HashMap::with_capacity(order.len());

        for node_id in &order {
            let Some(node) = graph.node(node_id) else {
                continue;
            };

            let resolved = input::resolve(graph, node_id, &outputs, &session.input);
            let mut step = ExecutionStep::pending(
                &node.id,
                node.variant,
                node.step_name(),
                resolved.primary.clone(),
            );
            step.start();
            self.events
                .publish(ProgressEvent::step_update(&session, &step));
            debug!(session_id = %session.session_id, node_id = %node.id, variant = %node.variant, "Step running");

            let started = Instant::now();
            let result = self.execute_node(node, &resolved, &cancel).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(out) => {
                    if let Some(intent) = &out.memory {
                        self.apply_memory(&session.session_id, intent).await;
                    }
                    let NodeOutput {
                        output,
                        tokens_in,
                        tokens_out,
                        cost_usd,
                        state,
                        memory,
                    } = out;
                    let tokens = TokenCounts::new(tokens_in, tokens_out);
                    step.complete(output.clone(), tokens, cost_usd, elapsed_ms);
                    step.state = state;
                    step.memory = memory;
                    debug!(
                        session_id = %session.session_id,
                        node_id = %node.id,
                        elapsed_ms,
                        tokens = tokens.total,
                        "Step completed"
                    );
                    outputs.insert(node.id.clone(), output);
                    self.events
                        .publish(ProgressEvent::step_update(&session, &step));
                    session.steps.push(step);
                }
                Err(e) => {
                    let message = if matches!(e, CtxError::Cancelled) {
                        e.to_string()
                    } else {
                        CtxError::node(&node.id, e).to_string()
                    };
                    error!(
                        session_id = %session.session_id,
                        node_id = %node.id,
                        elapsed_ms,
                        error = %message,
                        "Step failed"
                    );
                    step.fail(message.clone(), elapsed_ms);
                    self.events
                        .publish(ProgressEvent::step_update(&session, &step));
                    session.steps.push(step);
                    session.fail(Some(node.id.clone()), message);
                    break;
                }
            }
        }

        let failed = session.status.is_terminal();
        if !failed {
            session.complete();
            info!(
                session_id = %session.session_id,
                steps = session.steps.len(),
                total_tokens = session.total_metrics.total_tokens,
                total_cost = session.total_metrics.total_cost,
                "Session completed"
            );
        }

        // Stored before the terminal event so a late subscriber finds the snapshot
        self.persist(&session).await;
        let terminal = if failed {
            ProgressEvent::simulation_error(&session)
        } else {
            ProgressEvent::simulation_completed(&session)
        };
        self.events.publish(terminal);
        Ok(session)
    }

    async fn execute_node(
        &self,
        node: &GraphNode,
        resolved: &ResolvedInput,
        cancel: &CancellationToken,
    ) -> Result<NodeOutput> {
        if cancel.is_cancelled() {
            return Err(CtxError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CtxError::Cancelled),
            result = self.executors.execute(node, resolved, &self.ctx) => result,
        }
    }

    async fn apply_memory(&self, session_id: &SessionId, intent: &MemoryIntent) {
        let Some(memory) = &self.ctx.memory else {
            return;
        };
        match memory.apply(intent.clone()).await {
            Ok(value) => debug!(
                session_id = %session_id,
                key = %intent.key,
                operation = ?intent.operation,
                held = value.is_some(),
                "Memory intent applied"
            ),
            Err(e) => warn!(session_id = %session_id, key = %intent.key, error = %e, "Memory intent failed"),
        }
    }

    async fn persist(&self, session: &ExecutionSession) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(session).await {
                warn!(session_id = %session.session_id, error = %e, "Failed to save session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::event::{EventBus, ProgressKind};
    use ctxforge_core::graph::{GraphEdge, NodeVariant};
    use ctxforge_core::types::{SessionStatus, StepStatus};
    use ctxforge_memory::MemoryRunStore;
    use serde_json::json;

    fn chain() -> Graph {
        Graph::new(
            vec![
                GraphNode::new("in", NodeVariant::Input),
                GraphNode::new("parse", NodeVariant::OutputParser)
                    .with_config("parserType", json!("list")),
                GraphNode::new("out", NodeVariant::Output),
            ],
            vec![GraphEdge::new("in", "parse"), GraphEdge::new("parse", "out")],
        )
        .with_id("g1")
    }

    fn runner(bus: Arc<EventBus>) -> SessionRunner {
        SessionRunner::new(RuntimeContext::mock(Some(1)), bus)
    }

    #[tokio::test]
    async fn test_runs_in_order_and_completes() {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(MemoryRunStore::new());
        let runner = runner(bus.clone()).with_store(store.clone());

        let session = runner.run(&chain(), json!("a\nb")).await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        let ids: Vec<_> = session.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, ["in", "parse", "out"]);
        assert_eq!(session.final_output, Some(json!(["a", "b"])));
        assert_eq!(session.graph_id.as_deref(), Some("g1"));
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let bus = Arc::new(EventBus::default());
        let sid = SessionId::from_string("s-events");
        let mut rx = bus.subscribe_channel(&sid.0);

        runner(bus.clone())
            .run_with(&chain(), json!("x"), sid, CancellationToken::new())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.recv().await {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&ProgressKind::SimulationStarted));
        assert_eq!(kinds.last(), Some(&ProgressKind::SimulationCompleted));
        // Running + Completed per node
        assert_eq!(kinds.iter().filter(|k| **k == ProgressKind::StepUpdate).count(), 6);
    }

    #[tokio::test]
    async fn test_cycle_rejected_without_events() {
        let bus = Arc::new(EventBus::default());
        let mut all = bus.subscribe();
        let graph = Graph::new(
            vec![
                GraphNode::new("a", NodeVariant::Passthrough),
                GraphNode::new("b", NodeVariant::Passthrough),
            ],
            vec![GraphEdge::new("a", "b"), GraphEdge::new("b", "a")],
        );

        let err = runner(bus.clone()).run(&graph, json!("x")).await.unwrap_err();
        assert!(matches!(err, CtxError::CycleDetected { .. }));
        assert!(all.try_recv().is_err());
    }

    /// Records how many sessions the store held when each terminal event arrived.
    struct StoredAtTerminal {
        store: Arc<MemoryRunStore>,
        seen: std::sync::Mutex<Vec<usize>>,
    }

    impl EventSink for StoredAtTerminal {
        fn publish(&self, event: ProgressEvent) {
            if event.is_terminal() {
                if let Ok(mut seen) = self.seen.lock() {
                    seen.push(self.store.session_count());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_session_stored_before_terminal_event() {
        let store = Arc::new(MemoryRunStore::new());
        let sink = Arc::new(StoredAtTerminal {
            store: store.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let runner = SessionRunner::new(RuntimeContext::mock(Some(1)), sink.clone())
            .with_store(store.clone());

        runner.run(&chain(), json!("x")).await.unwrap();
        let bad = Graph::new(
            vec![GraphNode::new("r", NodeVariant::RagRetriever).with_config("topK", json!("many"))],
            vec![],
        );
        let failed = runner.run(&bad, json!("q")).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);

        assert_eq!(*sink.seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_graph_completes() {
        let bus = Arc::new(EventBus::default());
        let session = runner(bus)
            .run(&Graph::new(vec![], vec![]), json!("x"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.steps.is_empty());
        assert_eq!(session.final_output, None);
    }

    #[tokio::test]
    async fn test_bad_node_config_stops_session() {
        let bus = Arc::new(EventBus::default());
        let graph = Graph::new(
            vec![
                GraphNode::new("in", NodeVariant::Input),
                GraphNode::new("r", NodeVariant::RagRetriever).with_config("topK", json!("many")),
                GraphNode::new("out", NodeVariant::Output),
            ],
            vec![GraphEdge::new("in", "r"), GraphEdge::new("r", "out")],
        );

        let session = runner(bus).run(&graph, json!("q")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.steps.len(), 2);
        assert_eq!(session.steps[1].status, StepStatus::Failed);
        assert_eq!(session.error.as_ref().unwrap().node_id.as_deref(), Some("r"));
        assert_eq!(session.final_output, Some(json!("q")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let session = runner(bus)
            .run_with(&chain(), json!("x"), SessionId::new(), cancel)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.steps.len(), 1);
        assert!(session.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("cancelled"));
    }

    #[tokio::test]
    async fn test_memory_intent_applied() {
        let bus = Arc::new(EventBus::default());
        let kv = Arc::new(ctxforge_memory::KvMemory::new());
        let ctx = RuntimeContext::mock(Some(1)).with_memory(kv.clone());
        let graph = Graph::new(
            vec![
                GraphNode::new("in", NodeVariant::Input),
                GraphNode::new("mem", NodeVariant::MemoryStore).with_config("key", json!("notes")),
            ],
            vec![GraphEdge::new("in", "mem")],
        );

        let session = SessionRunner::new(ctx, bus)
            .run(&graph, json!("keep this"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.steps[1].memory.as_ref().unwrap().key, "notes");
        assert_eq!(kv.len(), 1);
    }
}
