// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Observation / tool-result optimizer: the middleware that decides, per
//! tool result, whether to leave it alone, compress it to a summary, or
//! evict its full body to disk and leave a short preview behind. References
//! recovered along the way (file paths, URLs, symbols) are harvested into
//! the shared [`ReferenceRegistry`] so a later tool call can resolve a
//! pointer that no longer appears verbatim in the model's context.
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use agentrun_model::ToolResultCompression;

use crate::error::PipelineError;
use crate::pipeline::{priority, Middleware, Next, PipelineRequest, PipelineResponse, RequestKind};
use crate::reference::{extract_references, Reference, ReferenceKind, ReferenceRegistry};

/// Below this length a tool result is left untouched — compressing a short
/// result costs more context (the wrapper text) than it saves.
const DEFAULT_MIN_LENGTH: usize = 2_000;

/// Lines of the original content kept visible in an eviction banner.
const DEFAULT_EVICT_PREVIEW_LINES: usize = 10;

/// The outcome of compressing one tool result: what replaces it in the
/// model's context, plus the bookkeeping needed to populate
/// [`agentrun_model::ToolResultCompression`] and the reference registry.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub summary: String,
    pub references: Vec<Reference>,
    pub compression_ratio: f64,
    pub original_length: usize,
    pub hash: String,
}

/// Compresses a tool result's raw text into a shorter summary. Separated
/// from the policy so alternative strategies (model-generated summaries,
/// for example) can be swapped in without touching the middleware.
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(&self, tool_name: &str, content: &str) -> CompressionOutcome;
}

/// Default [`Compressor`]: head+tail extraction plus regex-based reference
/// harvesting, grounded on the same line-budget approach as
/// [`crate::compact::smart_truncate`] but tuned for a short summary rather
/// than a truncated-but-still-large body.
pub struct TruncatingCompressor {
    pub summary_lines: usize,
}

impl Default for TruncatingCompressor {
    fn default() -> Self {
        Self { summary_lines: 20 }
    }
}

#[async_trait]
impl Compressor for TruncatingCompressor {
    async fn compress(&self, tool_name: &str, content: &str) -> CompressionOutcome {
        let references = extract_references(content);
        let lines: Vec<&str> = content.lines().collect();
        let head: Vec<&str> = lines.iter().take(self.summary_lines).copied().collect();
        let summary = if lines.len() > self.summary_lines {
            format!(
                "[{tool_name} output summarized: {} of {} lines shown]\n{}",
                head.len(),
                lines.len(),
                head.join("\n")
            )
        } else {
            content.to_string()
        };
        let original_length = content.len();
        let compression_ratio = if original_length == 0 {
            1.0
        } else {
            summary.len() as f64 / original_length as f64
        };
        CompressionOutcome {
            summary,
            references,
            compression_ratio,
            original_length,
            hash: ToolResultCompression::hash_content(content),
        }
    }
}

/// Per-result handling, decided by [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStrategy {
    /// Replace the body with a short model/regex-derived summary, keeping it
    /// inline in the message.
    Summary,
    /// Persist the full body to `{evict_path}/{tool_name}_{call_id}.txt` and
    /// leave a preview banner in its place.
    Evict,
}

#[derive(Debug, Clone)]
pub struct ObservationOptimizerConfig {
    /// Results at or below this length are never touched.
    pub min_length: usize,
    /// Strategy applied to every eligible result.
    pub strategy: OptimizerStrategy,
    /// Directory evicted bodies are written under. Only consulted when
    /// `strategy == Evict`.
    pub evict_path: PathBuf,
    /// Lines of the original content shown in the eviction banner.
    pub evict_preview_lines: usize,
}

impl Default for ObservationOptimizerConfig {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_LENGTH,
            strategy: OptimizerStrategy::Summary,
            evict_path: PathBuf::from("/tmp/agentrun-evicted"),
            evict_preview_lines: DEFAULT_EVICT_PREVIEW_LINES,
        }
    }
}

/// What the policy decided for one tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizerDecision {
    Skip,
    Apply(OptimizerStrategy),
}

/// Per-result policy: skip short results, error results, and results
/// already marked compressed; otherwise apply the configured strategy.
pub fn decide(config: &ObservationOptimizerConfig, content_len: usize, is_error: bool, already_compressed: bool) -> OptimizerDecision {
    if is_error || already_compressed || content_len <= config.min_length {
        OptimizerDecision::Skip
    } else {
        OptimizerDecision::Apply(config.strategy)
    }
}

/// Wire-format shape of a tool result passed through the pipeline as JSON:
/// mirrors the fields the middleware needs without depending on
/// `agentrun_tools::ToolOutput` directly, so the pipeline payload contract
/// stays decoupled from any one crate's concrete type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerPayload {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub compressed: bool,
    /// Structured parts (e.g. images) carried alongside `content`, untouched
    /// by compression — the optimizer only ever rewrites the plain-text
    /// summary, never image data.
    #[serde(default)]
    pub parts: Vec<Value>,
}

/// The system-core middleware implementing the Observation / Tool-Result
/// Optimizer: wraps every tool call, inspects its result, and — per
/// [`decide`] — leaves it alone, summarizes it, or evicts it to disk.
/// Harvested references are registered into the shared [`ReferenceRegistry`]
/// regardless of strategy, so later tool calls can resolve a pointer even
/// when its surrounding text is gone from the model's context.
pub struct ObservationOptimizerMiddleware {
    config: ObservationOptimizerConfig,
    compressor: Arc<dyn Compressor>,
    registry: Arc<ReferenceRegistry>,
}

impl ObservationOptimizerMiddleware {
    pub fn new(config: ObservationOptimizerConfig, compressor: Arc<dyn Compressor>, registry: Arc<ReferenceRegistry>) -> Self {
        Self { config, compressor, registry }
    }

    fn register_references(&self, refs: &[Reference]) {
        for r in refs {
            self.registry.register(r.clone());
        }
    }

    async fn evict(&self, tool_name: &str, call_id: &str, content: &str) -> std::io::Result<String> {
        if let Err(e) = tokio::fs::create_dir_all(&self.config.evict_path).await {
            warn!(error = %e, "failed to create eviction directory; falling back to summary");
            return Err(e);
        }
        let file_name = format!("{tool_name}_{call_id}.txt");
        let path = self.config.evict_path.join(&file_name);
        tokio::fs::write(&path, content).await?;

        let preview: Vec<&str> = content.lines().take(self.config.evict_preview_lines).collect();
        let total_lines = content.lines().count();
        Ok(format!(
            "[tool result evicted to {} ({} bytes, {total_lines} lines); first {} lines shown]\n{}",
            path.display(),
            content.len(),
            preview.len(),
            preview.join("\n")
        ))
    }
}

#[async_trait]
impl Middleware for ObservationOptimizerMiddleware {
    fn name(&self) -> &str {
        "observation_optimizer"
    }

    fn priority(&self) -> i32 {
        priority::OBSERVATION_OPTIMIZER
    }

    async fn wrap_tool_call(
        &self,
        request: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        let tool_name = match &request.kind {
            RequestKind::ToolCall { tool_name } => tool_name.clone(),
            RequestKind::ModelCall => return next.call(request).await,
        };

        let response = next.call(request).await?;
        let mut payload: OptimizerPayload = match serde_json::from_value(response.payload.clone()) {
            Ok(p) => p,
            // Response doesn't match the expected shape (e.g. a test double
            // or a tool this middleware predates) — pass it through.
            Err(_) => return Ok(response),
        };

        let decision = decide(&self.config, payload.content.len(), payload.is_error, payload.compressed);
        let strategy = match decision {
            OptimizerDecision::Skip => return Ok(response),
            OptimizerDecision::Apply(s) => s,
        };

        let outcome = self.compressor.compress(&tool_name, &payload.content).await;
        self.register_references(&outcome.references);

        let new_content = match strategy {
            OptimizerStrategy::Summary => outcome.summary.clone(),
            OptimizerStrategy::Evict => match self.evict(&tool_name, &payload.call_id, &payload.content).await {
                Ok(banner) => banner,
                Err(_) => outcome.summary.clone(),
            },
        };

        payload.content = new_content;
        payload.compressed = true;

        let mut metadata = response.metadata;
        let compression_meta = serde_json::json!({
            "compressed": true,
            "original_length": outcome.original_length,
            "content_hash": outcome.hash,
            "compression_ratio": outcome.compression_ratio,
            "references": outcome.references.iter().map(|r| serde_json::json!({
                "type": reference_kind_str(r.kind),
                "value": r.value,
                "context": r.context,
            })).collect::<Vec<_>>(),
        });
        merge_compression_metadata(&mut metadata, compression_meta);

        Ok(PipelineResponse {
            payload: serde_json::to_value(&payload).unwrap_or(Value::Null),
            metadata,
        })
    }
}

fn reference_kind_str(kind: ReferenceKind) -> &'static str {
    match kind {
        ReferenceKind::FilePath => "file_path",
        ReferenceKind::Url => "url",
        ReferenceKind::Symbol => "symbol",
    }
}

fn merge_compression_metadata(metadata: &mut Value, compression: Value) {
    if !metadata.is_object() {
        *metadata = serde_json::json!({});
    }
    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("compression".to_string(), compression);
    }
}
