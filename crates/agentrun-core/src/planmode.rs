// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Plan-mode state machine: a read-only-mostly gate generalized from
//! `switch_mode`'s downgrade-only `AgentMode` transition into a binary
//! {inactive, active} state with an explicit tool allow-list.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::PlanModeError;

const ADJECTIVES: &[&str] = &["quiet", "bold", "amber", "swift", "quiet", "hollow", "bright"];
const NOUNS: &[&str] = &["otter", "ridge", "harbor", "ember", "cinder", "falcon", "delta"];

#[derive(Debug, Clone)]
pub struct PlanModeState {
    pub active: bool,
    pub plan_id: Option<String>,
    pub plan_file_path: Option<String>,
    pub entered_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Default for PlanModeState {
    fn default() -> Self {
        Self { active: false, plan_id: None, plan_file_path: None, entered_at: None, reason: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanRecordStatus {
    PendingApproval,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: String,
    pub content: String,
    pub status: PlanRecordStatus,
    pub created_at: DateTime<Utc>,
}

/// Tools admitted while plan mode is active, regardless of path.
const PATH_INDEPENDENT_ALLOWLIST: &[&str] = &[
    "read", "glob", "grep", "web_fetch", "web_search", "ask_question", "exit_plan_mode",
];

/// Owns the current plan-mode state and the registry of exited plans,
/// installing a tool-gate predicate that callers consult before dispatch.
pub struct PlanModeManager {
    state: Arc<RwLock<PlanModeState>>,
    plans: RwLock<HashMap<String, PlanRecord>>,
    work_dir: std::path::PathBuf,
}

impl PlanModeManager {
    pub fn new(work_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            state: Arc::new(RwLock::new(PlanModeState::default())),
            plans: RwLock::new(HashMap::new()),
            work_dir: work_dir.into(),
        }
    }

    pub fn state_handle(&self) -> Arc<RwLock<PlanModeState>> {
        self.state.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.state.read().await.active
    }

    /// Generate a unique adjective-adjective-noun-style slug, create the plan
    /// file with its template, and transition to active.
    pub async fn enter(&self, reason: impl Into<String>) -> Result<PlanModeState, PlanModeError> {
        let mut state = self.state.write().await;
        if state.active {
            return Err(PlanModeError::AlreadyActive(
                state.plan_id.clone().unwrap_or_default(),
            ));
        }

        let plans_dir = self.work_dir.join(".plans");
        let plan_id = self.unique_plan_id(&plans_dir).await;
        let plan_path = plans_dir.join(format!("{plan_id}.md"));
        let now = Utc::now();

        let template = format!(
            "# Plan: {plan_id}\n\
             Created: {}\n\n\
             ## Overview\n\n\
             ## Steps\n\n\
             ## Critical Files\n\n\
             ## Risks & Mitigations\n\n\
             ## Success Criteria\n",
            now.to_rfc3339()
        );

        if tokio::fs::create_dir_all(&plans_dir).await.is_ok() {
            let _ = tokio::fs::write(&plan_path, template).await;
        }

        state.active = true;
        state.plan_id = Some(plan_id.clone());
        state.plan_file_path = Some(plan_path.to_string_lossy().to_string());
        state.entered_at = Some(now);
        state.reason = Some(reason.into());

        Ok(state.clone())
    }

    async fn unique_plan_id(&self, plans_dir: &std::path::Path) -> String {
        for _ in 0..20 {
            let a = ADJECTIVES[(Uuid::new_v4().as_u128() % ADJECTIVES.len() as u128) as usize];
            let b = ADJECTIVES[(Uuid::new_v4().as_u128() % ADJECTIVES.len() as u128) as usize];
            let n = NOUNS[(Uuid::new_v4().as_u128() % NOUNS.len() as u128) as usize];
            let candidate = format!("{a}-{b}-{n}");
            if !plans_dir.join(format!("{candidate}.md")).exists() {
                return candidate;
            }
        }
        Uuid::new_v4().to_string()
    }

    /// Check whether `tool_name` (with `path`, if it writes a file) may run
    /// while plan mode is active. Always returns `Ok(())` when inactive.
    pub async fn check_tool_allowed(&self, tool_name: &str, write_path: Option<&str>) -> Result<(), PlanModeError> {
        let state = self.state.read().await;
        if !state.active {
            return Ok(());
        }
        if PATH_INDEPENDENT_ALLOWLIST.contains(&tool_name) {
            return Ok(());
        }
        if tool_name == "task" {
            // Task(explore-only): admitted, the isolation boundary enforces
            // read-only behaviour inside the subagent itself.
            return Ok(());
        }
        if tool_name == "write" {
            if let (Some(path), Some(plan_path)) = (write_path, state.plan_file_path.as_deref()) {
                if path == plan_path {
                    return Ok(());
                }
            }
            return Err(PlanModeError::ToolNotAllowed(tool_name.to_string()));
        }
        Err(PlanModeError::ToolNotAllowed(tool_name.to_string()))
    }

    /// Read the plan file (or the most recently modified `.plans/*.md` if no
    /// path was recorded), store a `PlanRecord`, and transition to inactive.
    pub async fn exit(&self) -> Result<PlanRecord, PlanModeError> {
        let mut state = self.state.write().await;
        if !state.active {
            return Err(PlanModeError::NotActive);
        }

        let path = match &state.plan_file_path {
            Some(p) => std::path::PathBuf::from(p),
            None => self.most_recent_plan_file().await.ok_or(PlanModeError::NoPlanFile)?,
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .unwrap_or_default();

        let record = PlanRecord {
            id: state.plan_id.clone().unwrap_or_default(),
            content,
            status: PlanRecordStatus::PendingApproval,
            created_at: Utc::now(),
        };
        self.plans.write().await.insert(record.id.clone(), record.clone());

        state.active = false;
        state.plan_id = None;
        state.plan_file_path = None;
        state.entered_at = None;
        state.reason = None;

        Ok(record)
    }

    async fn most_recent_plan_file(&self) -> Option<std::path::PathBuf> {
        let plans_dir = self.work_dir.join(".plans");
        let mut entries = tokio::fs::read_dir(&plans_dir).await.ok()?;
        let mut best: Option<(std::path::PathBuf, std::time::SystemTime)> = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if let Ok(modified) = meta.modified() {
                    if best.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
                        best = Some((path, modified));
                    }
                }
            }
        }
        best.map(|(p, _)| p)
    }

    pub async fn get_plan(&self, id: &str) -> Option<PlanRecord> {
        self.plans.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir() -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        std::path::PathBuf::from(format!("/tmp/agentrun_planmode_test_{}_{n}", std::process::id()))
    }

    #[tokio::test]
    async fn enter_creates_plan_file_and_activates() {
        let dir = tmp_dir();
        let mgr = PlanModeManager::new(&dir);
        let state = mgr.enter("test plan").await.unwrap();
        assert!(state.active);
        let path = state.plan_file_path.unwrap();
        assert!(tokio::fs::metadata(&path).await.is_ok());
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("## Overview"));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn entering_twice_fails() {
        let dir = tmp_dir();
        let mgr = PlanModeManager::new(&dir);
        mgr.enter("first").await.unwrap();
        let err = mgr.enter("second").await.unwrap_err();
        assert!(matches!(err, PlanModeError::AlreadyActive(_)));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    // ── S3: plan-mode gate scenario ──────────────────────────────────────────

    #[tokio::test]
    async fn s3_plan_mode_gate_scenario() {
        let dir = tmp_dir();
        let mgr = PlanModeManager::new(&dir);
        let state = mgr.enter("s3").await.unwrap();
        let plan_path = state.plan_file_path.clone().unwrap();

        assert!(mgr.check_tool_allowed("bash", None).await.is_err());
        assert!(mgr.check_tool_allowed("write", Some(&plan_path)).await.is_ok());
        assert!(mgr.check_tool_allowed("write", Some("/src/main.go")).await.is_err());

        mgr.exit().await.unwrap();
        assert!(mgr.check_tool_allowed("bash", None).await.is_ok());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn read_only_tools_always_admitted_while_active() {
        let dir = tmp_dir();
        let mgr = PlanModeManager::new(&dir);
        mgr.enter("x").await.unwrap();
        for t in ["read", "glob", "grep", "web_fetch", "web_search", "ask_question"] {
            assert!(mgr.check_tool_allowed(t, None).await.is_ok(), "{t} should be allowed");
        }
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn exit_without_entering_fails() {
        let dir = tmp_dir();
        let mgr = PlanModeManager::new(&dir);
        assert!(matches!(mgr.exit().await.unwrap_err(), PlanModeError::NotActive));
    }

    #[tokio::test]
    async fn exit_stores_plan_record_pending_approval() {
        let dir = tmp_dir();
        let mgr = PlanModeManager::new(&dir);
        mgr.enter("record me").await.unwrap();
        let record = mgr.exit().await.unwrap();
        assert_eq!(record.status, PlanRecordStatus::PendingApproval);
        let fetched = mgr.get_plan(&record.id).await.unwrap();
        assert_eq!(fetched.id, record.id);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn check_tool_allowed_is_noop_when_inactive() {
        let dir = tmp_dir();
        let mgr = PlanModeManager::new(&dir);
        assert!(mgr.check_tool_allowed("bash", None).await.is_ok());
    }
}
