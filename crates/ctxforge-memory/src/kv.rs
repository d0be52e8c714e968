//! Keyed memory applied from MemoryStore node intents.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::node_config::MemoryOperation;
use ctxforge_core::traits::MemoryBackend;
use ctxforge_core::types::MemoryIntent;

const CHARS_PER_TOKEN: usize = 4;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// Process-local memory with per-key TTL and a token budget per value.
///
/// `store` replaces the value, keeping the tail of long text. `append` keeps
/// a list and drops its oldest items once the list exceeds the budget.
#[derive(Default)]
pub struct KvMemory {
    entries: Mutex<HashMap<String, Entry>>,
}

impl KvMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|e| e.values().filter(|v| !v.expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_now(&self, intent: MemoryIntent) -> Result<Option<Value>> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CtxError::Database(e.to_string()))?;

        if entries.get(&intent.key).is_some_and(|e| e.expired(now)) {
            entries.remove(&intent.key);
        }

        let expires_at = intent.ttl_secs.map(|s| now + Duration::from_secs(s));
        let budget = intent.max_tokens.saturating_mul(CHARS_PER_TOKEN);

        let result = match intent.operation {
            MemoryOperation::Retrieve => entries.get(&intent.key).map(|e| e.value.clone()),
            MemoryOperation::Clear => {
                entries.remove(&intent.key);
                None
            }
            MemoryOperation::Store => {
                let value = truncate_tail(intent.value, budget);
                entries.insert(
                    intent.key.clone(),
                    Entry {
                        value: value.clone(),
                        expires_at,
                    },
                );
                Some(value)
            }
            MemoryOperation::Append => {
                let mut items = match entries.remove(&intent.key).map(|e| e.value) {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => vec![],
                };
                items.push(intent.value);
                while items.len() > 1 && estimated_chars(&items) > budget {
                    items.remove(0);
                }
                let value = Value::Array(items);
                entries.insert(
                    intent.key.clone(),
                    Entry {
                        value: value.clone(),
                        expires_at,
                    },
                );
                Some(value)
            }
        };

        debug!(key = %intent.key, operation = ?intent.operation, "Memory intent applied");
        Ok(result)
    }
}

impl MemoryBackend for KvMemory {
    fn apply(&self, intent: MemoryIntent) -> BoxFuture<'_, Result<Option<Value>>> {
        let result = self.apply_now(intent);
        Box::pin(async move { result })
    }
}

fn value_chars(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

fn estimated_chars(items: &[Value]) -> usize {
    items.iter().map(value_chars).sum()
}

/// Keep the last `budget` characters of a string value.
fn truncate_tail(value: Value, budget: usize) -> Value {
    match value {
        Value::String(s) => {
            let len = s.chars().count();
            if len <= budget {
                Value::String(s)
            } else {
                Value::String(s.chars().skip(len - budget).collect())
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(op: MemoryOperation, value: Value) -> MemoryIntent {
        MemoryIntent {
            operation: op,
            key: "k".into(),
            value,
            ttl_secs: None,
            max_tokens: 2000,
        }
    }

    #[tokio::test]
    async fn test_store_retrieve_clear() {
        let mem = KvMemory::new();
        mem.apply(intent(MemoryOperation::Store, json!("hello"))).await.unwrap();
        let got = mem
            .apply(intent(MemoryOperation::Retrieve, Value::Null))
            .await
            .unwrap();
        assert_eq!(got, Some(json!("hello")));

        mem.apply(intent(MemoryOperation::Clear, Value::Null)).await.unwrap();
        assert!(mem.is_empty());
        let got = mem
            .apply(intent(MemoryOperation::Retrieve, Value::Null))
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_append_respects_budget() {
        let mem = KvMemory::new();
        let mut i = intent(MemoryOperation::Append, json!("aaaa"));
        i.max_tokens = 2; // 8 chars
        mem.apply(i.clone()).await.unwrap();
        i.value = json!("bbbb");
        mem.apply(i.clone()).await.unwrap();
        i.value = json!("cccc");
        let held = mem.apply(i).await.unwrap();
        assert_eq!(held, Some(json!(["bbbb", "cccc"])));
    }

    #[tokio::test]
    async fn test_store_keeps_tail() {
        let mem = KvMemory::new();
        let mut i = intent(MemoryOperation::Store, json!("0123456789"));
        i.max_tokens = 1;
        assert_eq!(mem.apply(i).await.unwrap(), Some(json!("6789")));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let mem = KvMemory::new();
        let mut i = intent(MemoryOperation::Store, json!("short-lived"));
        i.ttl_secs = Some(0);
        mem.apply(i).await.unwrap();
        let got = mem
            .apply(intent(MemoryOperation::Retrieve, Value::Null))
            .await
            .unwrap();
        assert_eq!(got, None);
    }
}
