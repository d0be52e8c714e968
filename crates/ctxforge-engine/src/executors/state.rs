use futures::future::BoxFuture;
use serde_json::json;

use ctxforge_core::error::Result;
use ctxforge_core::graph::{GraphNode, NodeVariant};
use ctxforge_core::node_config::{self, StateTrackerConfig};

use super::{NodeExecutor, NodeOutput};
use crate::context::RuntimeContext;
use crate::input::ResolvedInput;

/// Identity, plus a state summary on the step.
pub struct StateTrackerExecutor;

impl NodeExecutor for StateTrackerExecutor {
    fn variant(&self) -> NodeVariant {
        NodeVariant::StateTracker
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        input: &'a ResolvedInput,
        _ctx: &'a RuntimeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let config: StateTrackerConfig = node_config::parse(node)?;
            let mut out = NodeOutput::identity(input.primary.clone());
            out.state = Some(json!({
                "trackingType": config.tracking_type,
                "conditionCount": config.conditions.len(),
                "transitionCount": config.transitions.len(),
            }));
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_summary() {
        let ctx = RuntimeContext::mock(Some(0));
        let node = GraphNode::new("s", NodeVariant::StateTracker)
            .with_config("trackingType", json!("workflow"))
            .with_config("conditions", json!([{"if": "a"}, {"if": "b"}]))
            .with_config("transitions", json!([{"to": "x"}]));
        let input = ResolvedInput::original(&json!({"step": 1}));

        let out = StateTrackerExecutor.execute(&node, &input, &ctx).await.unwrap();
        assert_eq!(out.output, json!({"step": 1}));
        assert_eq!(
            out.state,
            Some(json!({"trackingType": "workflow", "conditionCount": 2, "transitionCount": 1}))
        );
    }
}
