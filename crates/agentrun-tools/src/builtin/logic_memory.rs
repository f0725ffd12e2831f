// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured, namespaced memory storage generalized from `update_memory`'s
//! flat key-value file store into scoped records with provenance, plus the
//! two tools (query/update) exposed to the model. Pattern-matcher capture
//! and system-prompt injection live in `agentrun-core`'s logic-memory
//! middleware, which is the other consumer of the types defined here.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryScope {
    Session,
    User,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProvenance {
    pub source_type: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub namespace: String,
    pub scope: MemoryScope,
    pub memory_type: String,
    pub key: String,
    pub value: String,
    pub description: String,
    pub provenance: MemoryProvenance,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A capability a pattern-matcher advertises: which event kinds it can
/// inspect, and the matching operation itself.
pub trait PatternMatcher: Send + Sync {
    fn supported_event_types(&self) -> &[&str];

    /// Inspect `event_type`/`content` and return a candidate memory if it
    /// matched, without touching storage.
    fn match_event(&self, event_type: &str, content: &str) -> Option<Memory>;
}

/// Append-or-update map keyed by (namespace, key); persisted as JSON.
/// Access-count/last-accessed are updated on every successful read.
pub struct MemoryStore {
    path: Option<String>,
    inner: RwLock<HashMap<(String, String), Memory>>,
}

impl MemoryStore {
    pub fn new(path: Option<String>) -> Self {
        Self { path, inner: RwLock::new(HashMap::new()) }
    }

    pub fn default_path() -> String {
        let home = dirs::home_dir().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|| "/tmp".to_string());
        format!("{home}/.config/agentrun/memory.json")
    }

    async fn load(&self) {
        let path = self.path.clone().unwrap_or_else(Self::default_path);
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            if let Ok(records) = serde_json::from_str::<Vec<Memory>>(&content) {
                let mut guard = self.inner.write().await;
                if guard.is_empty() {
                    for m in records {
                        guard.insert((m.namespace.clone(), m.key.clone()), m);
                    }
                }
            }
        }
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let path = self.path.clone().unwrap_or_else(Self::default_path);
        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let guard = self.inner.read().await;
        let records: Vec<&Memory> = guard.values().collect();
        let json = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    pub async fn upsert(&self, memory: Memory) -> anyhow::Result<()> {
        self.load().await;
        let key = (memory.namespace.clone(), memory.key.clone());
        self.inner.write().await.insert(key, memory);
        self.persist().await
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Option<Memory> {
        self.load().await;
        let mut guard = self.inner.write().await;
        let found = guard.get_mut(&(namespace.to_string(), key.to_string()))?;
        found.access_count += 1;
        found.last_accessed = Utc::now();
        Some(found.clone())
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> bool {
        self.load().await;
        let removed = self.inner.write().await.remove(&(namespace.to_string(), key.to_string())).is_some();
        if removed {
            let _ = self.persist().await;
        }
        removed
    }

    /// Top-K memories in `namespace` with confidence >= `min_confidence`,
    /// ranked by confidence descending then recency descending.
    pub async fn top_k(&self, namespace: &str, k: usize, min_confidence: f64) -> Vec<Memory> {
        self.load().await;
        let guard = self.inner.read().await;
        let mut candidates: Vec<Memory> = guard
            .values()
            .filter(|m| m.namespace == namespace && m.provenance.confidence >= min_confidence)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.provenance
                .confidence
                .partial_cmp(&a.provenance.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_accessed.cmp(&a.last_accessed))
        });
        candidates.truncate(k);
        candidates
    }

    pub async fn list_namespace(&self, namespace: &str) -> Vec<Memory> {
        self.load().await;
        self.inner.read().await.values().filter(|m| m.namespace == namespace).cloned().collect()
    }
}

/// Reads stored memories: get a single key, or list/top-K a namespace.
pub struct LogicMemoryQueryTool {
    store: Arc<MemoryStore>,
}

impl LogicMemoryQueryTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for LogicMemoryQueryTool {
    fn name(&self) -> &str {
        "logic_memory_query"
    }

    fn description(&self) -> &str {
        "Query stored user/session/global preference memories by namespace and key, or \
         retrieve the top-ranked memories for a namespace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "namespace": {"type": "string"},
                "key": {"type": "string", "description": "Omit to list/rank the whole namespace"},
                "top_k": {"type": "integer", "description": "Max memories to return when key is omitted"},
                "min_confidence": {"type": "number"}
            },
            "required": ["namespace"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations { read_only: true, ..Default::default() }
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let namespace = match call.args.get("namespace").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'namespace'"),
        };

        if let Some(key) = call.args.get("key").and_then(|v| v.as_str()) {
            return match self.store.get(&namespace, key).await {
                Some(m) => ToolOutput::ok(&call.id, m.value),
                None => ToolOutput::err(&call.id, format!("memory not found: {namespace}/{key}")),
            };
        }

        let top_k = call.args.get("top_k").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let min_confidence = call.args.get("min_confidence").and_then(|v| v.as_f64()).unwrap_or(0.6);
        let memories = self.store.top_k(&namespace, top_k, min_confidence).await;
        if memories.is_empty() {
            return ToolOutput::ok(&call.id, "(no memories)");
        }
        let lines: Vec<String> = memories.iter().map(|m| format!("{}: {}", m.key, m.value)).collect();
        ToolOutput::ok(&call.id, lines.join("\n"))
    }
}

/// Writes (upserts or deletes) a memory record.
pub struct LogicMemoryUpdateTool {
    store: Arc<MemoryStore>,
}

impl LogicMemoryUpdateTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for LogicMemoryUpdateTool {
    fn name(&self) -> &str {
        "logic_memory_update"
    }

    fn description(&self) -> &str {
        "Set or delete a structured preference memory for a namespace/key. Operations: set, delete."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {"type": "string", "enum": ["set", "delete"]},
                "namespace": {"type": "string"},
                "key": {"type": "string"},
                "value": {"type": "string"},
                "memory_type": {"type": "string"},
                "description": {"type": "string"},
                "confidence": {"type": "number"}
            },
            "required": ["operation", "namespace", "key"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let op = match call.args.get("operation").and_then(|v| v.as_str()) {
            Some(o) => o.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'operation'"),
        };
        let namespace = match call.args.get("namespace").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'namespace'"),
        };
        let key = match call.args.get("key").and_then(|v| v.as_str()) {
            Some(k) => k.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'key'"),
        };

        debug!(op = %op, namespace = %namespace, key = %key, "logic_memory_update");

        match op.as_str() {
            "set" => {
                let value = match call.args.get("value").and_then(|v| v.as_str()) {
                    Some(v) => v.to_string(),
                    None => return ToolOutput::err(&call.id, "missing 'value' for set"),
                };
                let now = Utc::now();
                let memory = Memory {
                    namespace: namespace.clone(),
                    scope: MemoryScope::User,
                    memory_type: call.args.get("memory_type").and_then(|v| v.as_str()).unwrap_or("preference").to_string(),
                    key: key.clone(),
                    value,
                    description: call.args.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    provenance: MemoryProvenance {
                        source_type: "explicit_tool_call".to_string(),
                        confidence: call.args.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0),
                    },
                    access_count: 0,
                    last_accessed: now,
                    created_at: now,
                };
                match self.store.upsert(memory).await {
                    Ok(_) => ToolOutput::ok(&call.id, format!("set {namespace}/{key}")),
                    Err(e) => ToolOutput::err(&call.id, format!("save error: {e}")),
                }
            }
            "delete" => {
                if self.store.delete(&namespace, &key).await {
                    ToolOutput::ok(&call.id, format!("deleted {namespace}/{key}"))
                } else {
                    ToolOutput::err(&call.id, format!("memory not found: {namespace}/{key}"))
                }
            }
            other => ToolOutput::err(&call.id, format!("unknown operation: {other}")),
        }
    }
}
