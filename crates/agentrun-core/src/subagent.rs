// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Subagent manager: an in-process registry of background agent runs,
//! generalized from `task_tool`'s synchronous depth-limited spawn into an
//! async lifecycle state machine with cancellation, timeout, and resume.
//! Registry operations are linearizable under a single mutex, and the
//! worker task's own completion check preserves "stop wins over completion"
//! when cancellation and natural return race.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use agentrun_config::AgentMode;
use agentrun_tools::{ApprovalPolicy, Tool, ToolCall, ToolOutput};

use crate::agent::{Agent, AgentContext};
use crate::error::SubagentError;
use crate::events::AgentEvent;

const MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SubagentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubagentStatus::Completed | SubagentStatus::Failed | SubagentStatus::Stopped)
    }
}

#[derive(Debug, Clone)]
pub struct SubagentRecord {
    pub id: String,
    pub prompt: String,
    pub mode: AgentMode,
    pub status: SubagentStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The id this run was resumed from, if any.
    pub resumed_from: Option<String>,
}

/// Returned by `start`/`resume`: the caller's handle on a newly registered run.
#[derive(Debug, Clone)]
pub struct SubagentHandle {
    pub id: String,
}

struct Entry {
    record: SubagentRecord,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Builds an isolated `Agent` for a subagent run. The manager never
/// constructs tool registries or providers itself — it only knows how to
/// drive the resulting agent through one turn and observe the outcome.
pub trait SubagentFactory: Send + Sync {
    fn build(&self, mode: AgentMode) -> Agent;
}

pub struct SubagentManager {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    factory: Arc<dyn SubagentFactory>,
    depth: Arc<AtomicUsize>,
}

impl SubagentManager {
    pub fn new(factory: Arc<dyn SubagentFactory>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), factory, depth: Arc::new(AtomicUsize::new(0)) }
    }

    /// Start a new subagent run. Atomic: the id is generated and inserted
    /// under the same lock acquisition, so two concurrent starts can never
    /// collide or observe a half-registered record.
    pub async fn start(&self, prompt: String, mode: AgentMode, resumed_from: Option<String>) -> Result<SubagentHandle, SubagentError> {
        if self.depth.load(Ordering::SeqCst) >= MAX_DEPTH {
            return Err(SubagentError::MaxDepthExceeded);
        }

        let id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let record = SubagentRecord {
            id: id.clone(),
            prompt: prompt.clone(),
            mode,
            status: SubagentStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            resumed_from,
        };

        {
            let mut entries = self.entries.lock().await;
            entries.insert(id.clone(), Entry { record, cancel_tx: Some(cancel_tx) });
        }

        self.depth.fetch_add(1, Ordering::SeqCst);

        let mut agent = self.factory.build(mode);
        let entries_handle = self.entries.clone();
        let id_for_task = id.clone();
        let depth = self.depth.clone();

        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
            let run = agent.submit_with_cancel(&prompt, tx, cancel_rx).await;

            let mut output = String::new();
            let mut aborted = false;
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::TextDelta(delta) => output.push_str(&delta),
                    AgentEvent::Aborted { partial_text } => {
                        aborted = true;
                        if output.is_empty() {
                            output = partial_text;
                        }
                    }
                    _ => {}
                }
            }

            depth.fetch_sub(1, Ordering::SeqCst);

            let mut entries = entries_handle.lock().await;
            if let Some(entry) = entries.get_mut(&id_for_task) {
                // A concurrent stop() already finalized this record as
                // Stopped — it wins regardless of how the run actually ended.
                if entry.record.status == SubagentStatus::Stopped {
                    return;
                }
                entry.record.finished_at = Some(Utc::now());
                entry.cancel_tx = None;
                match run {
                    Ok(_) if aborted => {
                        entry.record.status = SubagentStatus::Stopped;
                        entry.record.error = Some("subagent stopped by request".to_string());
                        entry.record.output = Some(output);
                    }
                    Ok(_) => {
                        entry.record.status = SubagentStatus::Completed;
                        entry.record.output = Some(output);
                    }
                    Err(e) => {
                        entry.record.status = SubagentStatus::Failed;
                        entry.record.error = Some(e.to_string());
                    }
                }
            }
        });

        Ok(SubagentHandle { id })
    }

    pub async fn query(&self, id: &str) -> Result<SubagentRecord, SubagentError> {
        let entries = self.entries.lock().await;
        entries.get(id).map(|e| e.record.clone()).ok_or_else(|| SubagentError::NotFound(id.to_string()))
    }

    /// Valid only from Running; transitions eagerly to Stopped under the
    /// registry lock so a racing worker completion observes it and backs off.
    pub async fn stop(&self, id: &str) -> Result<(), SubagentError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id).ok_or_else(|| SubagentError::NotFound(id.to_string()))?;
        if entry.record.status != SubagentStatus::Running {
            return Err(SubagentError::NotRunning(id.to_string()));
        }
        if let Some(cancel_tx) = entry.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        entry.record.status = SubagentStatus::Stopped;
        entry.record.error = Some("subagent stopped by request".to_string());
        entry.record.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Valid only from a terminal (not-running) state: starts a fresh run
    /// with the same prompt/mode, linked back to the original id.
    pub async fn resume(&self, id: &str) -> Result<SubagentHandle, SubagentError> {
        let (prompt, mode) = {
            let entries = self.entries.lock().await;
            let entry = entries.get(id).ok_or_else(|| SubagentError::NotFound(id.to_string()))?;
            if !entry.record.status.is_terminal() {
                return Err(SubagentError::AlreadyRunning(id.to_string()));
            }
            (entry.record.prompt.clone(), entry.record.mode)
        };
        self.start(prompt, mode, Some(id.to_string())).await
    }

    pub async fn list(&self) -> Vec<SubagentRecord> {
        let entries = self.entries.lock().await;
        let mut records: Vec<SubagentRecord> = entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    /// Apply a derived timeout: if the run is still active after `duration`,
    /// cancel it exactly as `stop` would.
    pub fn spawn_timeout_watchdog(self: &Arc<Self>, id: String, duration: std::time::Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = manager.stop(&id).await;
        });
    }
}

fn mode_from_str(s: &str) -> Option<AgentMode> {
    match s {
        "research" => Some(AgentMode::Research),
        "plan" => Some(AgentMode::Plan),
        "agent" => Some(AgentMode::Agent),
        _ => None,
    }
}

fn mode_to_str(mode: AgentMode) -> &'static str {
    match mode {
        AgentMode::Research => "research",
        AgentMode::Plan => "plan",
        AgentMode::Agent => "agent",
    }
}

fn status_to_str(status: SubagentStatus) -> &'static str {
    match status {
        SubagentStatus::Pending => "pending",
        SubagentStatus::Running => "running",
        SubagentStatus::Completed => "completed",
        SubagentStatus::Failed => "failed",
        SubagentStatus::Stopped => "stopped",
    }
}

/// `task` tool: starts a subagent (async mode returns the id immediately;
/// sync mode polls until terminal).
pub struct TaskTool {
    manager: Arc<SubagentManager>,
}

impl TaskTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task. By default returns a task id \
         immediately (async); pass \"async\": false to block until it finishes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string"},
                "mode": {"type": "string", "enum": ["research", "plan", "agent"]},
                "async": {"type": "boolean", "description": "default true"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["prompt"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let mode = match call.args.get("mode").and_then(|v| v.as_str()) {
            Some(m) => match mode_from_str(m) {
                Some(mode) => mode,
                None => return ToolOutput::err(&call.id, format!("unknown mode: {m}")),
            },
            None => AgentMode::Agent,
        };
        let is_async = call.args.get("async").and_then(|v| v.as_bool()).unwrap_or(true);

        let handle = match self.manager.start(prompt, mode, None).await {
            Ok(h) => h,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };

        if let Some(timeout) = call.args.get("timeout_secs").and_then(|v| v.as_u64()) {
            self.manager.spawn_timeout_watchdog(handle.id.clone(), std::time::Duration::from_secs(timeout));
        }

        if is_async {
            return ToolOutput::ok(&call.id, format!("started subagent {}", handle.id));
        }

        loop {
            match self.manager.query(&handle.id).await {
                Ok(record) if record.status.is_terminal() => {
                    return match record.status {
                        SubagentStatus::Completed => ToolOutput::ok(&call.id, record.output.unwrap_or_default()),
                        SubagentStatus::Failed => ToolOutput::err(&call.id, record.error.unwrap_or_default()),
                        SubagentStatus::Stopped => ToolOutput::err(
                            &call.id,
                            record.error.unwrap_or_else(|| "subagent stopped by request".to_string()),
                        ),
                        SubagentStatus::Pending | SubagentStatus::Running => unreachable!(),
                    };
                }
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            }
        }
    }
}

pub struct QuerySubagentTool {
    manager: Arc<SubagentManager>,
}

impl QuerySubagentTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for QuerySubagentTool {
    fn name(&self) -> &str {
        "query_subagent"
    }

    fn description(&self) -> &str {
        "Check the status and output of a subagent started with `task`."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]})
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'id'"),
        };
        match self.manager.query(&id).await {
            Ok(record) => ToolOutput::ok(&call.id, describe(&record)),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

pub struct StopSubagentTool {
    manager: Arc<SubagentManager>,
}

impl StopSubagentTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for StopSubagentTool {
    fn name(&self) -> &str {
        "stop_subagent"
    }

    fn description(&self) -> &str {
        "Stop a running subagent."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]})
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'id'"),
        };
        match self.manager.stop(&id).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("stopped {id}")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

pub struct ResumeSubagentTool {
    manager: Arc<SubagentManager>,
}

impl ResumeSubagentTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ResumeSubagentTool {
    fn name(&self) -> &str {
        "resume_subagent"
    }

    fn description(&self) -> &str {
        "Resume a stopped/completed/failed subagent by starting a fresh run with the same prompt."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]})
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'id'"),
        };
        match self.manager.resume(&id).await {
            Ok(handle) => ToolOutput::ok(&call.id, format!("resumed as {}", handle.id)),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

pub struct ListSubagentsTool {
    manager: Arc<SubagentManager>,
}

impl ListSubagentsTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ListSubagentsTool {
    fn name(&self) -> &str {
        "list_subagents"
    }

    fn description(&self) -> &str {
        "List all subagents started in this session and their status."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let records = self.manager.list().await;
        if records.is_empty() {
            return ToolOutput::ok(&call.id, "(no subagents)");
        }
        let lines: Vec<String> = records.iter().map(describe).collect();
        ToolOutput::ok(&call.id, lines.join("\n"))
    }
}

fn describe(record: &SubagentRecord) -> String {
    format!(
        "{} [{}] mode={} prompt={:?}",
        record.id,
        status_to_str(record.status),
        mode_to_str(record.mode),
        record.prompt.chars().take(60).collect::<String>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrun_config::{AgentConfig, Config};
    use agentrun_tools::ToolRegistry;
    use tokio::sync::Mutex as TokioMutex;

    struct StubFactory;

    impl SubagentFactory for StubFactory {
        fn build(&self, mode: AgentMode) -> Agent {
            let tools = Arc::new(ToolRegistry::new());
            let config = Arc::new(AgentConfig::default());
            let mode_lock = Arc::new(TokioMutex::new(mode));
            let (_tx, rx) = mpsc::channel(16);
            Agent::new(
                Arc::new(agentrun_model::MockProvider),
                tools,
                config,
                AgentContext::default(),
                mode_lock,
                rx,
                32_000,
            )
        }
    }

    fn manager() -> Arc<SubagentManager> {
        Arc::new(SubagentManager::new(Arc::new(StubFactory)))
    }

    #[tokio::test]
    async fn start_then_query_eventually_completes() {
        let mgr = manager();
        let handle = mgr.start("do a thing".into(), AgentMode::Agent, None).await.unwrap();

        for _ in 0..50 {
            let record = mgr.query(&handle.id).await.unwrap();
            if record.status.is_terminal() {
                assert_eq!(record.status, SubagentStatus::Completed);
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("subagent never reached a terminal state");
    }

    #[tokio::test]
    async fn query_unknown_id_is_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.query("nope").await, Err(SubagentError::NotFound(_))));
    }

    #[tokio::test]
    async fn stop_on_unknown_id_is_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.stop("nope").await, Err(SubagentError::NotFound(_))));
    }

    #[tokio::test]
    async fn stop_after_completion_is_not_running() {
        let mgr = manager();
        let handle = mgr.start("fast".into(), AgentMode::Agent, None).await.unwrap();

        for _ in 0..50 {
            if mgr.query(&handle.id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert!(matches!(mgr.stop(&handle.id).await, Err(SubagentError::NotRunning(_))));
    }

    // ── S4 / stop-wins-over-completion scenario ─────────────────────────────

    #[tokio::test]
    async fn stop_immediately_after_start_wins_the_race() {
        let mgr = manager();
        let handle = mgr.start("work".into(), AgentMode::Agent, None).await.unwrap();
        mgr.stop(&handle.id).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let record = mgr.query(&handle.id).await.unwrap();
        assert_eq!(record.status, SubagentStatus::Stopped);
        assert_eq!(record.error.as_deref(), Some("subagent stopped by request"));
    }

    #[tokio::test]
    async fn resume_after_completion_starts_a_linked_run() {
        let mgr = manager();
        let handle = mgr.start("original".into(), AgentMode::Agent, None).await.unwrap();

        for _ in 0..50 {
            if mgr.query(&handle.id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let resumed = mgr.resume(&handle.id).await.unwrap();
        assert_ne!(resumed.id, handle.id);
        let record = mgr.query(&resumed.id).await.unwrap();
        assert_eq!(record.resumed_from.as_deref(), Some(handle.id.as_str()));
        assert_eq!(record.prompt, "original");
    }

    #[tokio::test]
    async fn resume_while_running_is_rejected() {
        let mgr = manager();
        let handle = mgr.start("slow".into(), AgentMode::Agent, None).await.unwrap();
        assert!(matches!(mgr.resume(&handle.id).await, Err(SubagentError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn list_returns_started_runs() {
        let mgr = manager();
        mgr.start("a".into(), AgentMode::Agent, None).await.unwrap();
        mgr.start("b".into(), AgentMode::Agent, None).await.unwrap();
        let records = mgr.list().await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn depth_limit_rejects_beyond_max() {
        let mgr = manager();
        for _ in 0..MAX_DEPTH {
            mgr.start("busy".into(), AgentMode::Agent, None).await.unwrap();
        }
        assert!(matches!(
            mgr.start("one too many".into(), AgentMode::Agent, None).await,
            Err(SubagentError::MaxDepthExceeded)
        ));
    }
}
