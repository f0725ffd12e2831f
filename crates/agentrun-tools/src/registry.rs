// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agentrun_config::AgentMode;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::{Tool, ToolCall, ToolOutput};

/// A tool schema – mirrors agentrun_model::ToolSchema but keeps tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, Arc<dyn Tool>> is Sync (String is Sync, Arc<T: Send + Sync> is Sync)
// - Tools implement Send + Sync (required by the Tool trait)
// - No interior mutability exists after construction (all methods take &self)
// - Parallel tool execution is safe because tools are immutable after registration
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for ALL registered tools (mode-unfiltered).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| ToolSchema {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        }).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Produce schemas only for tools available in the given mode.
    pub fn schemas_for_mode(&self, mode: AgentMode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values()
            .filter(|t| t.modes().contains(&mode))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(
                &call.id,
                format!("unknown tool: {}", call.name),
            ),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn names_for_mode(&self, mode: AgentMode) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values()
            .filter(|t| t.modes().contains(&mode))
            .map(|t| t.name().to_string())
            .collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

/// A constructor bound to a UI component type-name: given that component's
/// properties, produce its initial rendered value.
pub type ComponentConstructor = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

#[derive(Debug, Error)]
pub enum ComponentRegistryError {
    #[error("invalid component type name '{0}': must match [A-Za-z][A-Za-z0-9]*")]
    InvalidName(String),
    #[error("component registry is frozen; cannot register '{0}'")]
    Frozen(String),
}

/// Frozen-after-startup whitelist mapping UI component type-name →
/// constructor. Registration before freeze is idempotent for the same
/// binding; a different constructor for an existing name is ignored with a
/// warning rather than silently overwritten.
pub struct ComponentRegistry {
    constructors: Mutex<HashMap<String, ComponentConstructor>>,
    frozen: AtomicBool,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self { constructors: Mutex::new(HashMap::new()), frozen: AtomicBool::new(false) }
    }

    fn name_pattern() -> &'static Regex {
        static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").unwrap())
    }

    pub fn register(&self, name: &str, constructor: ComponentConstructor) -> Result<(), ComponentRegistryError> {
        if !Self::name_pattern().is_match(name) {
            return Err(ComponentRegistryError::InvalidName(name.to_string()));
        }
        if self.frozen.load(Ordering::SeqCst) {
            return Err(ComponentRegistryError::Frozen(name.to_string()));
        }

        let mut constructors = self.constructors.lock().unwrap();
        match constructors.get(name) {
            Some(existing) if Arc::ptr_eq(existing, &constructor) => {}
            Some(_) => warn!(name, "ignoring conflicting constructor for already-registered component type"),
            None => {
                constructors.insert(name.to_string(), constructor);
            }
        }
        Ok(())
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn get(&self, name: &str) -> Option<ComponentConstructor> {
        self.constructors.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.constructors.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
