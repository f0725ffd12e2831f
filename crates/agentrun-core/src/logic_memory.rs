// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Logic-memory capture and injection. Storage, provenance, and the
//! query/update tools live in `agentrun_tools::builtin::logic_memory`; this
//! module is the middleware that feeds the capture path from host events
//! and injects a ranked "User Preferences" section into the system prompt
//! on each model call.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

pub use agentrun_tools::{Memory, MemoryProvenance, MemoryScope, MemoryStore, PatternMatcher};

use crate::error::{LogicMemoryError, PipelineError};
use crate::pipeline::{Middleware, Next, PipelineRequest, PipelineResponse};

/// Where the preferences section is spliced into the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPoint {
    SystemPromptStart,
    SystemPromptEnd,
}

#[derive(Debug, Clone)]
pub struct LogicMemoryConfig {
    pub top_k: usize,
    pub min_confidence: f64,
    pub injection_point: InjectionPoint,
    pub injection_enabled: bool,
}

impl Default for LogicMemoryConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_confidence: 0.6,
            injection_point: InjectionPoint::SystemPromptStart,
            injection_enabled: true,
        }
    }
}

/// A raw capture-path event supplied by the host (`user_message`,
/// `user_feedback`, `user_revision`, ...).
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub event_type: String,
    pub content: String,
}

/// Resolve the namespace to inject for, by priority: an explicit
/// `namespace` field, else `user:{user_id}`, else `tenant:{tenant_id}`,
/// else `agent:{agent_id}`.
fn resolve_namespace(metadata: &Value) -> Option<String> {
    if let Some(ns) = metadata.get("namespace").and_then(|v| v.as_str()) {
        return Some(ns.to_string());
    }
    if let Some(id) = metadata.get("user_id").and_then(|v| v.as_str()) {
        return Some(format!("user:{id}"));
    }
    if let Some(id) = metadata.get("tenant_id").and_then(|v| v.as_str()) {
        return Some(format!("tenant:{id}"));
    }
    if let Some(id) = metadata.get("agent_id").and_then(|v| v.as_str()) {
        return Some(format!("agent:{id}"));
    }
    None
}

fn format_preferences_section(memories: &[Memory]) -> String {
    let mut out = String::from("## User Preferences\n");
    for m in memories {
        out.push_str(&format!("- {}: {}\n", m.key, m.value));
    }
    out
}

fn splice(system_prompt: &str, section: &str, point: InjectionPoint) -> String {
    match point {
        InjectionPoint::SystemPromptStart => format!("{section}\n{system_prompt}"),
        InjectionPoint::SystemPromptEnd => format!("{system_prompt}\n{section}"),
    }
}

/// Captures preference memories from host events via registered
/// pattern-matchers, and injects a ranked "User Preferences" section into
/// the outgoing system prompt of every model call.
pub struct LogicMemoryMiddleware {
    store: Arc<MemoryStore>,
    matchers: Vec<Arc<dyn PatternMatcher>>,
    config: LogicMemoryConfig,
    capture_tx: Option<mpsc::Sender<CaptureEvent>>,
}

impl LogicMemoryMiddleware {
    pub fn new(store: Arc<MemoryStore>, matchers: Vec<Arc<dyn PatternMatcher>>, config: LogicMemoryConfig) -> Self {
        Self { store, matchers, config, capture_tx: None }
    }

    /// Enable async capture: events handed to `capture` are pushed onto a
    /// bounded ring buffer and matched by a background consumer instead of
    /// inline. When the buffer is full the oldest event is dropped with a
    /// warning rather than blocking the caller.
    pub fn with_async_capture(mut self, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CaptureEvent>(capacity);
        let store = self.store.clone();
        let matchers = self.matchers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                Self::match_and_store(&store, &matchers, &event).await;
            }
        });
        self.capture_tx = Some(tx);
        self
    }

    async fn match_and_store(store: &Arc<MemoryStore>, matchers: &[Arc<dyn PatternMatcher>], event: &CaptureEvent) {
        for matcher in matchers {
            if !matcher.supported_event_types().contains(&event.event_type.as_str()) {
                continue;
            }
            if let Some(memory) = matcher.match_event(&event.event_type, &event.content) {
                if let Err(e) = store.upsert(memory).await {
                    warn!(error = %e, "failed to persist captured memory");
                }
            }
        }
    }

    /// Feed a host event (`user_message`, `user_feedback`, `user_revision`)
    /// through the capture path. Synchronous unless `with_async_capture`
    /// was used, in which case this only enqueues the event.
    pub async fn capture(&self, event_type: impl Into<String>, content: impl Into<String>) -> Result<(), LogicMemoryError> {
        let event = CaptureEvent { event_type: event_type.into(), content: content.into() };
        match &self.capture_tx {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    warn!("logic-memory capture buffer full; dropping oldest event");
                }
                Ok(())
            }
            None => {
                Self::match_and_store(&self.store, &self.matchers, &event).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Middleware for LogicMemoryMiddleware {
    fn name(&self) -> &str {
        "logic_memory"
    }

    fn priority(&self) -> i32 {
        crate::pipeline::priority::FEATURE_MIN + 50
    }

    async fn wrap_model_call(
        &self,
        request: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        if !self.config.injection_enabled {
            return next.call(request).await;
        }

        let namespace = match resolve_namespace(&request.metadata) {
            Some(ns) => ns,
            None => return next.call(request).await,
        };

        let memories = self.store.top_k(&namespace, self.config.top_k, self.config.min_confidence).await;
        if memories.is_empty() {
            return next.call(request).await;
        }

        let mut payload = request.payload.clone();
        let section = format_preferences_section(&memories);
        let system_prompt = payload.get("system_prompt").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let injected = splice(&system_prompt, &section, self.config.injection_point);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("system_prompt".to_string(), Value::String(injected));
        }

        let injected_request = PipelineRequest { kind: request.kind, payload, metadata: request.metadata };
        next.call(injected_request).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::pipeline::{RequestKind, Terminal};

    struct RecordingMatcher;

    impl PatternMatcher for RecordingMatcher {
        fn supported_event_types(&self) -> &[&str] {
            &["user_feedback"]
        }

        fn match_event(&self, event_type: &str, content: &str) -> Option<Memory> {
            if event_type != "user_feedback" {
                return None;
            }
            Some(Memory {
                namespace: "user:u1".to_string(),
                scope: MemoryScope::User,
                memory_type: "preference".to_string(),
                key: "style".to_string(),
                value: content.to_string(),
                description: "captured from feedback".to_string(),
                provenance: MemoryProvenance { source_type: "pattern_match".to_string(), confidence: 0.9 },
                access_count: 0,
                last_accessed: chrono::Utc::now(),
                created_at: chrono::Utc::now(),
            })
        }
    }

    struct EchoTerminal;

    #[async_trait]
    impl Terminal for EchoTerminal {
        async fn invoke(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
            Ok(PipelineResponse::new(request.payload))
        }
    }

    fn test_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(Some(format!("/tmp/agentrun_logic_memory_test_{}.json", uuid::Uuid::new_v4()))))
    }

    #[tokio::test]
    async fn capture_then_inject_adds_preferences_section() {
        let store = test_store();
        let mw = LogicMemoryMiddleware::new(store.clone(), vec![Arc::new(RecordingMatcher)], LogicMemoryConfig::default());
        mw.capture("user_feedback", "terse responses please").await.unwrap();

        let request = PipelineRequest {
            kind: RequestKind::ModelCall,
            payload: json!({"system_prompt": "base prompt"}),
            metadata: json!({"user_id": "u1"}),
        };
        let next = Next::terminal(Arc::new(EchoTerminal));
        let response = mw.wrap_model_call(request, next).await.unwrap();
        let prompt = response.payload.get("system_prompt").unwrap().as_str().unwrap();
        assert!(prompt.contains("User Preferences"));
        assert!(prompt.contains("terse responses please"));
        assert!(prompt.contains("base prompt"));
    }

    #[tokio::test]
    async fn no_namespace_passes_through_unchanged() {
        let store = test_store();
        let mw = LogicMemoryMiddleware::new(store, vec![], LogicMemoryConfig::default());
        let request = PipelineRequest {
            kind: RequestKind::ModelCall,
            payload: json!({"system_prompt": "base prompt"}),
            metadata: json!({}),
        };
        let next = Next::terminal(Arc::new(EchoTerminal));
        let response = mw.wrap_model_call(request, next).await.unwrap();
        assert_eq!(response.payload.get("system_prompt").unwrap().as_str().unwrap(), "base prompt");
    }

    #[tokio::test]
    async fn disabled_injection_skips_lookup_even_with_matches() {
        let store = test_store();
        let mw = LogicMemoryMiddleware::new(store.clone(), vec![Arc::new(RecordingMatcher)], LogicMemoryConfig {
            injection_enabled: false,
            ..Default::default()
        });
        mw.capture("user_feedback", "something").await.unwrap();
        let request = PipelineRequest {
            kind: RequestKind::ModelCall,
            payload: json!({"system_prompt": "base"}),
            metadata: json!({"user_id": "u1"}),
        };
        let next = Next::terminal(Arc::new(EchoTerminal));
        let response = mw.wrap_model_call(request, next).await.unwrap();
        assert_eq!(response.payload.get("system_prompt").unwrap().as_str().unwrap(), "base");
    }

    #[tokio::test]
    async fn namespace_priority_prefers_explicit_namespace_over_user_id() {
        assert_eq!(resolve_namespace(&json!({"namespace": "explicit", "user_id": "u1"})), Some("explicit".to_string()));
        assert_eq!(resolve_namespace(&json!({"tenant_id": "t1"})), Some("tenant:t1".to_string()));
        assert_eq!(resolve_namespace(&json!({"agent_id": "a1"})), Some("agent:a1".to_string()));
        assert_eq!(resolve_namespace(&json!({})), None);
    }

    #[tokio::test]
    async fn async_capture_persists_through_background_consumer() {
        let store = test_store();
        let mw = LogicMemoryMiddleware::new(store.clone(), vec![Arc::new(RecordingMatcher)], LogicMemoryConfig::default())
            .with_async_capture(8);
        mw.capture("user_feedback", "async captured").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let found = store.get("user:u1", "style").await;
        assert!(found.is_some());
        assert_eq!(found.unwrap().value, "async captured");
    }
}
