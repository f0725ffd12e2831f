// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Local;
use std::path::Path;

use agentrun_config::AgentMode;

/// Optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root, when known.
    pub project_root: Option<&'a Path>,
    /// Text appended verbatim after the Guidelines section.
    pub append: Option<&'a str>,
}

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - Check `logic_memory_query` at session start for stored project preferences."
    }

    pub fn tool_usage() -> &'static str {
        "- Prefer `edit_file` over `write` for modifying existing files (preserves surrounding context).\n\
         - Discovery workflow: `glob` to find files → `grep` to narrow → `read_file` with specific ranges for context.\n\
         - Batch `read_file` calls in parallel — read all potentially relevant files in one turn."
    }

    pub fn workflow_efficiency() -> &'static str {
        "- Use `todo_write` for multi-step tasks (3+ steps); update silently and mark complete after finishing each step.\n\
         - Use `enter_plan_mode`/`exit_plan_mode` to propose a plan before large changes.\n\
         - Store durable preferences via `logic_memory_update`; retrieve them with `logic_memory_query`.\n\
         - Delegate independent, isolable work to `task` rather than doing it serially."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, try a different approach before repeating the same call.\n\
         - Never bypass plan-mode restrictions; if a tool is blocked, call `exit_plan_mode` first."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n{}\n\n\
         ### Tool Usage Patterns\n{}\n\n\
         ### Workflow Efficiency\n{}\n\n\
         ### Error Handling\n{}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::workflow_efficiency(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt for the given agent mode.
pub fn system_prompt(mode: AgentMode, custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let identity = format!(
        "You are a coding agent with a middleware-based request pipeline, automatic \
         context compaction, and a subagent manager for delegating isolated work.\n\n\
         Operating mode: `{mode}`\n\
         Current date and time: `{now}`",
        now = Local::now().format("%Y-%m-%d %H:%M:%S"),
    );

    let mode_instructions = match mode {
        AgentMode::Research => {
            "You may read files, search the codebase, and look up information. \
             You MUST NOT write, modify, or delete any files."
        }
        AgentMode::Plan => {
            "Analyse the request and produce a clear, structured plan. You may read \
             files to inform the plan but MUST NOT modify them, except to write the \
             active plan file via `write`. Use `ask_question` rather than free-form \
             prose questions when the request is ambiguous."
        }
        AgentMode::Agent => {
            "You can read and write files, run shell commands, and search the \
             codebase. Work systematically, verify your changes, and complete all \
             open todos before ending your turn."
        }
    };

    let project_section = ctx.project_root.map(|root| {
        format!(
            "\n\n## Project Context\nProject root: `{}`. Prefer absolute paths in tool calls.",
            root.display()
        )
    }).unwrap_or_default();

    let guidelines_section = build_guidelines_section();
    let append_section = ctx.append.map(|extra| format!("\n\n{extra}")).unwrap_or_default();

    format!(
        "{identity}\n\n{mode_instructions}{project_section}\n\n{guidelines_section}{append_section}",
    )
}
