//! Long-term memory tools for the curator generator
//!
//! The tools are bound to the requesting session when registered; the model
//! never chooses whose memory log it touches.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use assessor_knowledge::MemoryStore;

use super::{ToolHandler, ToolRegistry, json_schema};

/// Register the memory tools for one session's log
pub fn register_memory_tools(registry: &mut ToolRegistry, store: Arc<dyn MemoryStore>, session_id: &str) {
    registry.register(Arc::new(RecordMemoryTool::new(store.clone(), session_id)));
    registry.register(Arc::new(PopLastMemoryTool::new(store.clone(), session_id)));
    registry.register(Arc::new(ListMemoriesTool::new(store, session_id)));
}

pub struct RecordMemoryTool {
    store: Arc<dyn MemoryStore>,
    session_id: String,
}

impl RecordMemoryTool {
    pub fn new(store: Arc<dyn MemoryStore>, session_id: &str) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait]
impl ToolHandler for RecordMemoryTool {
    fn name(&self) -> &str {
        "record_memory"
    }

    fn description(&self) -> &str {
        "Store a durable fact, preference or decision about the user."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "content": {
                    "type": "string",
                    "description": "The information to remember, as a short sentence"
                }
            }),
            vec!["content"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let content = match input.get("content") {
            Some(Value::String(s)) if !s.trim().is_empty() => Value::String(s.trim().to_string()),
            Some(Value::String(_)) | Some(Value::Null) | None => {
                return Err(anyhow::anyhow!("Missing 'content' parameter"));
            }
            Some(other) => other.clone(),
        };
        let record = self.store.append(&self.session_id, content).await?;
        debug!("Recorded memory for session {}", self.session_id);
        Ok(format!("Memória registrada em {}", record.timestamp.to_rfc3339()))
    }
}

pub struct PopLastMemoryTool {
    store: Arc<dyn MemoryStore>,
    session_id: String,
}

impl PopLastMemoryTool {
    pub fn new(store: Arc<dyn MemoryStore>, session_id: &str) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait]
impl ToolHandler for PopLastMemoryTool {
    fn name(&self) -> &str {
        "pop_last_memory"
    }

    fn description(&self) -> &str {
        "Remove the most recent memory of the session, used to replace an outdated fact."
    }

    fn input_schema(&self) -> Value {
        json_schema(json!({}), vec![])
    }

    async fn execute(&self, _input: Value) -> Result<String> {
        match self.store.pop_last(&self.session_id).await? {
            Some(record) => Ok(format!("Memória removida: {}", record)),
            None => Ok("Nenhuma memória encontrada.".to_string()),
        }
    }
}

pub struct ListMemoriesTool {
    store: Arc<dyn MemoryStore>,
    session_id: String,
}

impl ListMemoriesTool {
    pub fn new(store: Arc<dyn MemoryStore>, session_id: &str) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait]
impl ToolHandler for ListMemoriesTool {
    fn name(&self) -> &str {
        "list_memories"
    }

    fn description(&self) -> &str {
        "List every stored memory of the session in insertion order, to avoid duplicates."
    }

    fn input_schema(&self) -> Value {
        json_schema(json!({}), vec![])
    }

    async fn execute(&self, _input: Value) -> Result<String> {
        let records = self.store.list_all(&self.session_id).await?;
        if records.is_empty() {
            return Ok("Nenhuma memória encontrada.".to_string());
        }
        Ok(records.iter().map(|r| r.to_string()).collect::<Vec<_>>().join("\n"))
    }
}
