//! Building a node's effective input from the outputs of its predecessors.

use std::collections::HashMap;

use serde_json::{Map, Value};

use ctxforge_core::graph::Graph;

/// A node's effective input.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    /// Recorded as the step input and passed through by identity nodes.
    pub primary: Value,
    /// Named slots for template substitution.
    pub context: Map<String, Value>,
}

impl ResolvedInput {
    /// Input for a node with no incoming edges.
    pub fn original(input: &Value) -> Self {
        let mut context = Map::new();
        bind(&mut context, None, input);
        context.insert("input".to_string(), input.clone());
        Self {
            primary: input.clone(),
            context,
        }
    }

    /// Text of a named slot, if it resolved.
    pub fn var(&self, name: &str) -> Option<String> {
        self.context.get(name).map(value_text)
    }

    /// The primary value as text; an object falls back to its `prompt` slot.
    pub fn text(&self) -> String {
        match &self.primary {
            Value::Object(_) => self.var("prompt").unwrap_or_else(|| value_text(&self.primary)),
            other => value_text(other),
        }
    }

    /// Text used as a search query.
    pub fn query(&self) -> String {
        self.var("query").unwrap_or_else(|| self.text())
    }
}

/// Scan incoming edges in declaration order. Scalar outputs are bound to the
/// `prompt` and `query` slots (and to the source node id); object outputs
/// have their fields merged. `input` always holds the session input.
pub fn resolve(
    graph: &Graph,
    node_id: &str,
    outputs: &HashMap<String, Value>,
    original: &Value,
) -> ResolvedInput {
    let sources: Vec<(&str, &Value)> = graph
        .incoming(node_id)
        .filter_map(|e| outputs.get(&e.source).map(|v| (e.source.as_str(), v)))
        .collect();

    if graph.incoming(node_id).next().is_none() {
        return ResolvedInput::original(original);
    }

    let mut context = Map::new();
    for (source, value) in &sources {
        bind(&mut context, Some(source), value);
    }
    context.insert("input".to_string(), original.clone());

    let primary = match sources.as_slice() {
        [(_, only)] => (*only).clone(),
        [] => Value::Null,
        _ => Value::Object(context.clone()),
    };

    ResolvedInput { primary, context }
}

fn bind(context: &mut Map<String, Value>, source: Option<&str>, value: &Value) {
    match value {
        Value::Object(fields) => {
            for (k, v) in fields {
                context.insert(k.clone(), v.clone());
            }
        }
        Value::Null => {}
        scalar => {
            let text = Value::String(value_text(scalar));
            context.insert("prompt".to_string(), text.clone());
            context.insert("query".to_string(), text);
            if let Some(source) = source {
                context.insert(source.to_string(), scalar.clone());
            }
        }
    }
}

/// Plain text for strings, newline-joined items for arrays, JSON otherwise.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join("\n"),
        other => other.to_string(),
    }
}
