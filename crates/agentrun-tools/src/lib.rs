// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod events;
pub mod policy;
pub mod registry;
pub mod tool;

pub use events::{TodoItem, ToolEvent};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ComponentRegistry, ToolRegistry, ToolSchema};
pub use tool::{
    OutputCategory, RiskLevel, Tool, ToolAnnotations, ToolCall, ToolOutput, ToolOutputPart,
};

pub use builtin::ask_question::{AskQuestionTool, Question, QuestionRequest};
pub use builtin::bash_session::{BashOutputTool, BashSessionRegistry, KillShellTool};
pub use builtin::code_execute::CodeExecuteTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::glob_file_search::GlobFileSearchTool;
pub use builtin::grep::GrepTool;
pub use builtin::logic_memory::{
    LogicMemoryQueryTool, LogicMemoryUpdateTool, Memory, MemoryProvenance, MemoryScope,
    MemoryStore, PatternMatcher,
};
pub use builtin::read_file::ReadFileTool;
pub use builtin::shell::ShellTool;
pub use builtin::switch_mode::SwitchModeTool;
pub use builtin::todo_write::TodoWriteTool;
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::web_search::WebSearchTool;
pub use builtin::write::WriteTool;
