// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-subsystem error enums. Each mirrors one error kind group from the
//! runtime's error-handling design: validation/compression/provider failures
//! degrade or surface depending on the subsystem, never silently.
use thiserror::Error;

/// Errors raised while composing or running the middleware pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("middleware '{0}' failed: {1}")]
    MiddlewareFailed(String, #[source] anyhow::Error),
    #[error("provider call failed: {0}")]
    ProviderFailed(#[source] anyhow::Error),
    #[error("request cancelled")]
    Cancelled,
    #[error("pipeline composition failed: {0}")]
    CompositionFailed(String),
}

/// Errors raised by the summarization / observation-compression engine.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("compressor failed: {0}")]
    CompressionFailed(String),
    #[error("summary generation failed: {0}")]
    SummaryFailed(#[source] anyhow::Error),
    #[error("no messages eligible for compaction")]
    NothingToCompact,
}

/// Errors raised by the subagent manager.
#[derive(Debug, Error)]
pub enum SubagentError {
    #[error("subagent not found: {0}")]
    NotFound(String),
    #[error("subagent {0} is not running")]
    NotRunning(String),
    #[error("subagent {0} is already running")]
    AlreadyRunning(String),
    #[error("subagent {0} timed out after {1:?}")]
    Timeout(String, std::time::Duration),
    #[error("subagent stopped by request")]
    Stopped,
    #[error("maximum subagent nesting depth exceeded")]
    MaxDepthExceeded,
}

/// Errors raised by the plan-mode state machine.
#[derive(Debug, Error)]
pub enum PlanModeError {
    #[error("plan-mode-violation: tool '{0}' is not permitted while plan mode is active")]
    ToolNotAllowed(String),
    #[error("plan mode is not active")]
    NotActive,
    #[error("plan mode is already active")]
    AlreadyActive(String),
    #[error("no plan file found")]
    NoPlanFile,
    #[error("plan record not found: {0}")]
    PlanNotFound(String),
}

/// Errors raised by logic-memory capture and injection.
#[derive(Debug, Error)]
pub enum LogicMemoryError {
    #[error("pattern matcher failed: {0}")]
    MatcherFailed(String),
    #[error("memory store error: {0}")]
    StoreFailed(#[source] anyhow::Error),
    #[error("no namespace could be resolved for injection")]
    NoNamespace,
}
