use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::event::ProgressEvent;
use ctxforge_core::traits::GraphLookup;
use ctxforge_core::types::{ComparisonId, ComparisonMember, ComparisonRun, MemberOutcome, SessionId};

use crate::session::SessionRunner;

/// Default cap on graphs per comparison.
pub const DEFAULT_COMPARISON_LIMIT: usize = 10;

/// Runs several saved graphs against one input, concurrently.
///
/// Members are isolated: a graph that cannot be resolved, fails to schedule,
/// or fails mid-run is recorded on its own member and never affects the rest.
pub struct ComparisonCoordinator {
    runner: Arc<SessionRunner>,
    graphs: Arc<dyn GraphLookup>,
    limit: usize,
}

impl ComparisonCoordinator {
    pub fn new(runner: Arc<SessionRunner>, graphs: Arc<dyn GraphLookup>) -> Self {
        Self {
            runner,
            graphs,
            limit: DEFAULT_COMPARISON_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn compare(&self, graph_ids: &[String], input: Value) -> Result<ComparisonRun> {
        self.compare_with(graph_ids, input, ComparisonId::new(), CancellationToken::new())
            .await
    }

    /// Compare under a caller-chosen id. The size check runs before any
    /// session starts; after that, `compare_with` only fails if nothing was asked for.
    pub async fn compare_with(
        &self,
        graph_ids: &[String],
        input: Value,
        comparison_id: ComparisonId,
        cancel: CancellationToken,
    ) -> Result<ComparisonRun> {
        if graph_ids.len() > self.limit {
            return Err(CtxError::TooManyComparisons {
                requested: graph_ids.len(),
                limit: self.limit,
            });
        }
        if graph_ids.is_empty() {
            return Err(CtxError::InvalidGraph("no graphs to compare".into()));
        }

        let mut run = ComparisonRun::start(comparison_id, input);
        info!(
            comparison_id = %run.comparison_id,
            graphs = graph_ids.len(),
            "Comparison started"
        );

        let mut pending = FuturesUnordered::new();
        for (index, graph_id) in graph_ids.iter().enumerate() {
            let runner = self.runner.clone();
            let graphs = self.graphs.clone();
            let graph_id = graph_id.clone();
            let input = run.input.clone();
            let cancel = cancel.child_token();

            let handle = tokio::spawn(run_member(runner, graphs, graph_id, input, cancel));
            pending.push(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<ComparisonMember>> = vec![None; graph_ids.len()];
        while let Some((index, joined)) = pending.next().await {
            let member = joined.unwrap_or_else(|e| {
                warn!(graph_id = %graph_ids[index], error = %e, "Comparison member task failed");
                rejected(&graph_ids[index], format!("member task failed: {}", e))
            });
            self.runner
                .events()
                .publish(ProgressEvent::comparison_step(&run, &member));
            slots[index] = Some(member);
        }

        run.finish(slots.into_iter().flatten().collect());
        info!(
            comparison_id = %run.comparison_id,
            graphs = run.summary.graph_count,
            succeeded = run.summary.succeeded_count,
            total_cost = run.summary.total_cost_usd,
            "Comparison completed"
        );

        if let Some(store) = self.runner.store() {
            if let Err(e) = store.save_comparison(&run).await {
                warn!(comparison_id = %run.comparison_id, error = %e, "Failed to save comparison");
            }
        }
        self.runner
            .events()
            .publish(ProgressEvent::comparison_completed(&run));
        Ok(run)
    }
}

async fn run_member(
    runner: Arc<SessionRunner>,
    graphs: Arc<dyn GraphLookup>,
    graph_id: String,
    input: Value,
    cancel: CancellationToken,
) -> ComparisonMember {
    let graph = match graphs.resolve_graph(&graph_id).await {
        Ok(graph) => graph,
        Err(e) => {
            warn!(graph_id = %graph_id, error = %e, "Comparison graph unavailable");
            return rejected(&graph_id, e.to_string());
        }
    };
    let graph_name = Some(graph.name.clone()).filter(|n| !n.is_empty());

    match runner
        .run_with(&graph, input, SessionId::new(), cancel)
        .await
    {
        Ok(session) => ComparisonMember {
            graph_id,
            graph_name,
            outcome: MemberOutcome::Session(session),
        },
        Err(e) => {
            warn!(graph_id = %graph_id, error = %e, "Comparison graph rejected");
            ComparisonMember {
                graph_id,
                graph_name,
                outcome: MemberOutcome::Rejected {
                    error: e.to_string(),
                },
            }
        }
    }
}

fn rejected(graph_id: &str, error: String) -> ComparisonMember {
    ComparisonMember {
        graph_id: graph_id.to_string(),
        graph_name: None,
        outcome: MemberOutcome::Rejected { error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::event::{EventBus, ProgressKind};
    use ctxforge_core::graph::{Graph, GraphEdge, GraphNode, NodeVariant};
    use ctxforge_core::traits::EventSink;
    use ctxforge_core::types::{ComparisonStatus, SessionStatus};
    use ctxforge_memory::{MemoryRunStore, StaticGraphs};
    use serde_json::json;

    use crate::context::RuntimeContext;

    fn passthrough(id: &str) -> Graph {
        Graph::new(
            vec![
                GraphNode::new("in", NodeVariant::Input),
                GraphNode::new("out", NodeVariant::Output),
            ],
            vec![GraphEdge::new("in", "out")],
        )
        .with_name(id)
    }

    fn cyclic() -> Graph {
        Graph::new(
            vec![
                GraphNode::new("a", NodeVariant::Passthrough),
                GraphNode::new("b", NodeVariant::Passthrough),
            ],
            vec![GraphEdge::new("a", "b"), GraphEdge::new("b", "a")],
        )
    }

    fn coordinator(bus: Arc<EventBus>, graphs: StaticGraphs) -> ComparisonCoordinator {
        let runner = SessionRunner::new(RuntimeContext::mock(Some(3)), bus)
            .with_store(Arc::new(MemoryRunStore::new()));
        ComparisonCoordinator::new(Arc::new(runner), Arc::new(graphs))
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_rejects_too_many_graphs() {
        let bus = Arc::new(EventBus::default());
        let mut all = bus.subscribe();
        let coordinator = coordinator(bus.clone(), StaticGraphs::new()).with_limit(2);

        let err = coordinator
            .compare(&ids(&["a", "b", "c"]), json!("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CtxError::TooManyComparisons {
                requested: 3,
                limit: 2
            }
        ));
        assert!(all.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_members_keep_request_order() {
        let bus = Arc::new(EventBus::default());
        let graphs = StaticGraphs::new()
            .with("one", passthrough("One"))
            .with("loop", cyclic())
            .with("two", passthrough("Two"));
        let coordinator = coordinator(bus, graphs);

        let run = coordinator
            .compare(&ids(&["one", "missing", "loop", "two"]), json!("hi"))
            .await
            .unwrap();

        assert_eq!(run.status, ComparisonStatus::Completed);
        let order: Vec<_> = run.members.iter().map(|m| m.graph_id.as_str()).collect();
        assert_eq!(order, ["one", "missing", "loop", "two"]);
        assert!(run.members[0].succeeded());
        assert!(matches!(run.members[1].outcome, MemberOutcome::Rejected { .. }));
        assert!(run.members[2].error().unwrap().contains("cycle"));
        assert_eq!(run.members[3].graph_name.as_deref(), Some("Two"));
        assert_eq!(run.summary.graph_count, 4);
        assert_eq!(run.summary.succeeded_count, 2);
    }

    #[tokio::test]
    async fn test_comparison_events() {
        let bus = Arc::new(EventBus::default());
        let graphs = StaticGraphs::new()
            .with("a", passthrough("A"))
            .with("b", passthrough("B"));
        let coordinator = coordinator(bus.clone(), graphs);
        let comparison_id = ComparisonId::from_string("cmp-1");
        let mut rx = bus.subscribe_channel(&comparison_id.0);

        let run = coordinator
            .compare_with(&ids(&["a", "b"]), json!("x"), comparison_id, CancellationToken::new())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.recv().await {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            [
                ProgressKind::ComparisonStep,
                ProgressKind::ComparisonStep,
                ProgressKind::ComparisonCompleted
            ]
        );
        for member in &run.members {
            assert_eq!(member.session().unwrap().status, SessionStatus::Completed);
        }
    }

    struct ComparisonStoredAtTerminal {
        store: Arc<MemoryRunStore>,
        seen: std::sync::Mutex<Vec<usize>>,
    }

    impl EventSink for ComparisonStoredAtTerminal {
        fn publish(&self, event: ProgressEvent) {
            if event.kind == ProgressKind::ComparisonCompleted {
                if let Ok(mut seen) = self.seen.lock() {
                    seen.push(self.store.comparison_count());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_comparison_stored_before_completed_event() {
        let store = Arc::new(MemoryRunStore::new());
        let sink = Arc::new(ComparisonStoredAtTerminal {
            store: store.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let runner = SessionRunner::new(RuntimeContext::mock(Some(3)), sink.clone())
            .with_store(store.clone());
        let graphs = StaticGraphs::new().with("a", passthrough("A"));
        let coordinator = ComparisonCoordinator::new(Arc::new(runner), Arc::new(graphs));

        coordinator.compare(&ids(&["a"]), json!("x")).await.unwrap();

        assert_eq!(*sink.seen.lock().unwrap(), vec![1]);
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let coordinator = coordinator(Arc::new(EventBus::default()), StaticGraphs::new());
        let err = coordinator.compare(&[], json!("x")).await.unwrap_err();
        assert!(matches!(err, CtxError::InvalidGraph(_)));
    }
}
