//! OutputParser: deterministic formatting that never fails on bad input.

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::warn;

use ctxforge_core::error::Result;
use ctxforge_core::graph::{GraphNode, NodeVariant};
use ctxforge_core::node_config::{self, OutputParserConfig, ParserType};

use super::{NodeExecutor, NodeOutput};
use crate::context::RuntimeContext;
use crate::input::ResolvedInput;

/// Parse the first `{...}` block in `text`; `{content: text}` if there is none
/// or it is not valid JSON.
pub fn parse_json(text: &str) -> Value {
    if let Some(block) = first_brace_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return value;
        }
    }
    // Greedy span, for blocks the balanced scan cut short
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return value;
            }
        }
    }
    json!({ "content": text })
}

/// Balanced `{...}` starting at the first `{`, skipping braces inside strings.
fn first_brace_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Non-blank lines, trimmed.
pub fn parse_list(text: &str) -> Value {
    Value::Array(
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| Value::String(l.to_string()))
            .collect(),
    )
}

/// For each field, the text after `field:` on the first line that has it.
/// Without configured fields every `key: value` line is taken.
pub fn parse_structured(text: &str, fields: &[String]) -> Value {
    let mut out = Map::new();

    if fields.is_empty() {
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() && !out.contains_key(key) {
                    out.insert(key.to_string(), Value::String(value.trim().to_string()));
                }
            }
        }
        return Value::Object(out);
    }

    for field in fields {
        let needle = format!("{}:", field.to_ascii_lowercase());
        let found = text.lines().find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .find(&needle)
                .map(|pos| line[pos + needle.len()..].trim().to_string())
        });
        out.insert(field.clone(), found.map(Value::String).unwrap_or(Value::Null));
    }
    Value::Object(out)
}

pub struct OutputParserExecutor;

impl NodeExecutor for OutputParserExecutor {
    fn variant(&self) -> NodeVariant {
        NodeVariant::OutputParser
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        input: &'a ResolvedInput,
        _ctx: &'a RuntimeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            // Bad config reads as text
            let config: OutputParserConfig = node_config::parse(node).unwrap_or_else(|e| {
                warn!(node_id = %node.id, error = %e, "Unreadable parser config, using text");
                OutputParserConfig::default()
            });

            let output = match config.parser_type {
                ParserType::Json => match &input.primary {
                    Value::Object(_) | Value::Array(_) => input.primary.clone(),
                    _ => parse_json(&input.text()),
                },
                ParserType::List => parse_list(&input.text()),
                ParserType::Structured => parse_structured(&input.text(), &config.field_names()),
                ParserType::Text => input.primary.clone(),
            };
            Ok(NodeOutput::identity(output))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(config: Value, input: Value) -> Value {
        let mut node = GraphNode::new("parse", NodeVariant::OutputParser);
        if let Value::Object(map) = config {
            node.config = map;
        }
        let ctx = RuntimeContext::mock(Some(0));
        OutputParserExecutor
            .execute(&node, &ResolvedInput::original(&input), &ctx)
            .await
            .unwrap()
            .output
    }

    #[tokio::test]
    async fn test_json_extracts_embedded_object() {
        let out = run(json!({"parserType": "json"}), json!("answer is {\"a\":1}")).await;
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_json_falls_back_to_content() {
        let out = run(json!({"parserType": "json"}), json!("no json here")).await;
        assert_eq!(out, json!({"content": "no json here"}));

        let out = run(json!({"parserType": "json"}), json!("broken {\"a\": }")).await;
        assert_eq!(out, json!({"content": "broken {\"a\": }"}));
    }

    #[test]
    fn test_json_braces_inside_strings() {
        assert_eq!(
            parse_json(r#"x {"s": "a } b", "n": {"m": 2}} trailing }"#),
            json!({"s": "a } b", "n": {"m": 2}})
        );
    }

    #[tokio::test]
    async fn test_list_drops_blank_lines() {
        let out = run(json!({"parserType": "list"}), json!("one\n\n  two \n\nthree\n")).await;
        assert_eq!(out, json!(["one", "two", "three"]));
    }

    #[tokio::test]
    async fn test_structured_fields() {
        let out = run(
            json!({"parserType": "structured", "fields": ["name", "age", "city"]}),
            json!("Name: Ada\nAge: 36\nsomething else"),
        )
        .await;
        assert_eq!(out, json!({"name": "Ada", "age": "36", "city": null}));
    }

    #[tokio::test]
    async fn test_structured_schema_properties() {
        let out = run(
            json!({"parserType": "structured", "schema": {"properties": {"title": {}}}}),
            json!("title: Report"),
        )
        .await;
        assert_eq!(out, json!({"title": "Report"}));
    }

    #[tokio::test]
    async fn test_text_is_identity() {
        assert_eq!(run(json!({}), json!("as is")).await, json!("as is"));
        // Unknown parser types read as text
        assert_eq!(run(json!({"parserType": "xml"}), json!("<a/>")).await, json!("<a/>"));
    }
}
