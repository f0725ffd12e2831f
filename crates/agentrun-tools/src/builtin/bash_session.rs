// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistent background shells, generalized from `shell`'s one-shot
//! subprocess-isolation pattern: `run_in_background` hands the command to
//! this registry instead of waiting for it, and output is polled
//! incrementally rather than returned all at once.
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

use super::shell::head_tail_truncate;

struct Session {
    child: Option<Child>,
    output: Arc<Mutex<String>>,
    cursor: usize,
    running: Arc<std::sync::atomic::AtomicBool>,
    command: String,
}

/// Registers spawned background shells, keyed by id, under a single mutex —
/// operations on the map (spawn, read, kill, list) are linearizable.
pub struct BashSessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl BashSessionRegistry {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    pub async fn spawn(&self, command: String, workdir: Option<String>) -> anyhow::Result<String> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(wd) = &workdir {
            cmd.current_dir(wd);
        }

        let mut child = cmd.spawn()?;
        let id = Uuid::new_v4().to_string();
        let output = Arc::new(Mutex::new(String::new()));
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stdout) = stdout {
            spawn_line_reader(stdout, output.clone());
        }
        if let Some(stderr) = stderr {
            spawn_line_reader(stderr, output.clone());
        }

        self.sessions.lock().await.insert(
            id.clone(),
            Session { child: Some(child), output, cursor: 0, running, command },
        );

        Ok(id)
    }

    /// Return output appended since the last read, draining the cursor so
    /// repeated polls never re-deliver the same lines.
    pub async fn read_new_output(&self, id: &str) -> Option<(String, bool)> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id)?;
        session.try_reap();

        let buf = session.output.lock().await;
        let new_output = buf[session.cursor.min(buf.len())..].to_string();
        drop(buf);
        session.cursor += new_output.len();
        let running = session.running.load(std::sync::atomic::Ordering::SeqCst);
        Some((head_tail_truncate(&new_output), running))
    }

    pub async fn kill(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(id) {
            if let Some(child) = session.child.as_mut() {
                let _ = child.start_kill();
            }
            session.running.store(false, std::sync::atomic::Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub async fn list(&self) -> Vec<(String, String, bool)> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .iter_mut()
            .map(|(id, s)| {
                s.try_reap();
                (id.clone(), s.command.clone(), s.running.load(std::sync::atomic::Ordering::SeqCst))
            })
            .collect()
    }
}

impl Session {
    /// Non-blocking check of whether the child has exited, updating `running`.
    fn try_reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                self.running.store(false, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }
}

impl Default for BashSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_line_reader<R: tokio::io::AsyncRead + Unpin + Send + 'static>(reader: R, output: Arc<Mutex<String>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = output.lock().await;
            buf.push_str(&line);
            buf.push('\n');
        }
    });
}

/// Polls the accumulated output of a background shell started via `shell`
/// with `run_in_background: true`.
pub struct BashOutputTool {
    registry: Arc<BashSessionRegistry>,
}

impl BashOutputTool {
    pub fn new(registry: Arc<BashSessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for BashOutputTool {
    fn name(&self) -> &str {
        "bash_output"
    }

    fn description(&self) -> &str {
        "Read output produced by a background shell since the last poll. Returns `[running]` \
         or `[exited]` to indicate whether the shell is still alive."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"shell_id": {"type": "string"}},
            "required": ["shell_id"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("shell_id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'shell_id'"),
        };
        match self.registry.read_new_output(&id).await {
            Some((output, running)) => {
                let marker = if running { "[running]" } else { "[exited]" };
                let body = if output.is_empty() { "(no new output)".to_string() } else { output };
                ToolOutput::ok(&call.id, format!("{marker}\n{body}"))
            }
            None => ToolOutput::err(&call.id, format!("unknown shell_id: {id}")),
        }
    }
}

/// Terminates a background shell by id.
pub struct KillShellTool {
    registry: Arc<BashSessionRegistry>,
}

impl KillShellTool {
    pub fn new(registry: Arc<BashSessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for KillShellTool {
    fn name(&self) -> &str {
        "kill_shell"
    }

    fn description(&self) -> &str {
        "Terminate a background shell started with `run_in_background: true`."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"shell_id": {"type": "string"}},
            "required": ["shell_id"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("shell_id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'shell_id'"),
        };
        if self.registry.kill(&id).await {
            ToolOutput::ok(&call.id, format!("killed {id}"))
        } else {
            ToolOutput::err(&call.id, format!("unknown shell_id: {id}"))
        }
    }
}
