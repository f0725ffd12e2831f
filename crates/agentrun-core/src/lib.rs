// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod error;
mod events;
mod logic_memory;
mod optimizer;
mod pipeline;
mod planmode;
mod prompts;
mod reference;
mod session;
mod streaming;
mod subagent;

pub use agent::{build_pipeline, Agent, AgentContext, ToolRegistryTerminal};
pub use compact::{
    apply_metadata_visibility_mode, apply_replace_mode, compact_session, compact_session_with_strategy,
    emergency_compact, estimate_tokens, progressive_compact, smart_truncate, CompactionOutputMode,
    SummarizationMiddleware, VisibilityTaggedMessage, KEEP_LAST_MESSAGES, PREVIOUS_SUMMARY_PREFIX,
    PROGRESSIVE_COMPACTION_STEPS, SUMMARIZATION_THRESHOLD_TOKENS,
};
pub use error::{CompactionError, LogicMemoryError, PipelineError, PlanModeError, SubagentError};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use logic_memory::{
    CaptureEvent, InjectionPoint, LogicMemoryConfig, LogicMemoryMiddleware, Memory, MemoryProvenance,
    MemoryScope, MemoryStore, PatternMatcher,
};
pub use optimizer::{
    CompressionOutcome, Compressor, ObservationOptimizerConfig, ObservationOptimizerMiddleware,
    OptimizerDecision, OptimizerPayload, OptimizerStrategy, TruncatingCompressor,
};
pub use pipeline::{
    priority, Middleware, MiddlewareChain, Next, Pipeline, PipelineRequest, PipelineResponse, RequestKind,
    Terminal,
};
pub use planmode::{PlanModeState, PlanRecord, PlanRecordStatus, PlanModeManager};
pub use prompts::{system_prompt, PromptContext};
pub use reference::{extract_references, Reference, ReferenceKind, ReferenceRegistry};
pub use session::{Session, TurnRecord};
pub use streaming::{StreamingMessage, Surface, SurfaceRegistry};
pub use subagent::{SubagentHandle, SubagentManager, SubagentRecord, SubagentStatus};
