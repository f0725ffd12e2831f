// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thin stand-in for the runtime's code-execution surface: writes a script
//! to a temp file and runs it with the matching interpreter, reusing
//! `shell`'s subprocess-isolation and head/tail-truncation conventions. The
//! tool-bridge HTTP server the production system backs this with is out of
//! scope here.
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolAnnotations, ToolCall, ToolOutput};

use super::shell::head_tail_truncate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    Node,
    Bash,
}

impl Language {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "python" | "python3" => Some(Language::Python),
            "node" | "javascript" | "js" => Some(Language::Node),
            "bash" | "shell" | "sh" => Some(Language::Bash),
            _ => None,
        }
    }

    fn interpreter(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Node => "node",
            Language::Bash => "bash",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Node => "js",
            Language::Bash => "sh",
        }
    }
}

/// Runs a snippet of Python, Node.js, or Bash code and returns its output.
pub struct CodeExecuteTool {
    pub timeout_secs: u64,
}

impl Default for CodeExecuteTool {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[async_trait]
impl Tool for CodeExecuteTool {
    fn name(&self) -> &str {
        "code_execute"
    }

    fn description(&self) -> &str {
        "Run a Python, Node.js, or Bash script and return its stdout + stderr. \
         Prefer this over shell one-liners for anything beyond a few lines."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "language": {"type": "string", "enum": ["python", "node", "bash"]},
                "code": {"type": "string"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["language", "code"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations { destructive: true, open_world: true, ..Default::default() }
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let language = match call.args.get("language").and_then(|v| v.as_str()).and_then(Language::parse) {
            Some(l) => l,
            None => return ToolOutput::err(&call.id, "missing or unsupported 'language'"),
        };
        let code = match call.args.get("code").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'code'"),
        };
        let timeout = call.args.get("timeout_secs").and_then(|v| v.as_u64()).unwrap_or(self.timeout_secs);

        let script_path = std::env::temp_dir().join(format!("agentrun_code_execute_{}.{}", Uuid::new_v4(), language.extension()));
        if let Err(e) = tokio::fs::write(&script_path, &code).await {
            return ToolOutput::err(&call.id, format!("failed to write script: {e}"));
        }

        debug!(language = ?language, "executing code_execute tool");

        let mut cmd = Command::new(language.interpreter());
        cmd.arg(&script_path);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let result = tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;
        let _ = tokio::fs::remove_file(&script_path).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr));
                }
                let code = output.status.code().unwrap_or(-1);
                if code == 0 {
                    if content.is_empty() {
                        content = "(no output)".to_string();
                    }
                    ToolOutput::ok(&call.id, content)
                } else {
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(&call.id, format!("timeout after {timeout}s")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "c1".into(), name: "code_execute".into(), args }
    }

    #[tokio::test]
    async fn runs_python_and_returns_stdout() {
        let t = CodeExecuteTool::default();
        let out = t.execute(&call(json!({"language": "python", "code": "print('hi')"}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("hi"));
    }

    #[tokio::test]
    async fn runs_bash_and_returns_stdout() {
        let t = CodeExecuteTool::default();
        let out = t.execute(&call(json!({"language": "bash", "code": "echo hi"}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("hi"));
    }

    #[tokio::test]
    async fn unsupported_language_is_error() {
        let t = CodeExecuteTool::default();
        let out = t.execute(&call(json!({"language": "ruby", "code": "puts 1"}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn missing_code_is_error() {
        let t = CodeExecuteTool::default();
        let out = t.execute(&call(json!({"language": "bash"}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn nonzero_exit_is_error() {
        let t = CodeExecuteTool::default();
        let out = t.execute(&call(json!({"language": "bash", "code": "exit 3"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("[exit 3]"));
    }
}
