// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Onion-model middleware composition: middlewares are sorted by ascending
//! priority (lower = outer layer) and composed into a single continuation
//! that descends through each layer's request hook, invokes the terminal
//! handler, then ascends back through each layer's response hook in
//! reverse order.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PipelineError;

/// Priority bands, per the composition contract: lower numbers are outer
/// layers and run first on the way in, last on the way out.
pub mod priority {
    pub const SYSTEM_CORE_MIN: i32 = 0;
    pub const SYSTEM_CORE_MAX: i32 = 100;
    pub const FEATURE_MIN: i32 = 100;
    pub const FEATURE_MAX: i32 = 500;
    pub const USER_MIN: i32 = 500;
    pub const USER_MAX: i32 = 1000;

    pub const OBSERVATION_OPTIMIZER: i32 = 20;
    pub const SUMMARIZATION: i32 = 40;
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub kind: RequestKind,
    pub payload: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    ModelCall,
    ToolCall { tool_name: String },
}

#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub payload: Value,
    pub metadata: Value,
}

impl PipelineResponse {
    pub fn new(payload: Value) -> Self {
        Self { payload, metadata: Value::Null }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A continuation a middleware invokes to delegate to the next inner layer
/// (or, for the innermost middleware, the terminal handler).
pub struct Next<'a> {
    inner: Box<dyn FnOnce(PipelineRequest) -> BoxFuture<'a, Result<PipelineResponse, PipelineError>> + Send + 'a>,
}

impl<'a> Next<'a> {
    pub fn call(self, request: PipelineRequest) -> BoxFuture<'a, Result<PipelineResponse, PipelineError>> {
        (self.inner)(request)
    }

    /// A continuation that goes straight to `terminal`. Useful for testing
    /// a single middleware in isolation, and used internally as the
    /// innermost layer of a composed chain.
    pub fn terminal(terminal: Arc<dyn Terminal>) -> Next<'static> {
        Next {
            inner: Box::new(move |request| {
                let terminal = terminal.clone();
                Box::pin(async move { terminal.invoke(request).await })
            }),
        }
    }
}

/// Each middleware observes/mutates the request on the way in and the
/// response on the way out, by wrapping `next`.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    /// Tool names this middleware injects into the registry at startup.
    fn injected_tools(&self) -> Vec<String> {
        Vec::new()
    }

    async fn wrap_model_call(
        &self,
        request: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        next.call(request).await
    }

    async fn wrap_tool_call(
        &self,
        request: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        next.call(request).await
    }

    async fn on_agent_start(&self) {}

    async fn on_agent_stop(&self) {}
}

/// Terminal handler invoked by the innermost continuation: the provider for
/// model calls, or the tool's `execute` for tool calls.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn invoke(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError>;
}

/// Registered middlewares, kept sorted by (priority, registration order) so
/// composition is deterministic and tie-broken stably.
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self { middlewares: Vec::new() }
    }

    /// Insert, keeping the stable ascending-priority ordering. Since this
    /// appends then sorts with a stable sort, equal-priority entries retain
    /// registration order.
    pub fn register(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
        self.middlewares.sort_by_key(|m| m.priority());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Middleware>> {
        self.middlewares.iter()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn run_start_hooks(&self) {
        for m in &self.middlewares {
            m.on_agent_start().await;
        }
    }

    pub async fn run_stop_hooks(&self) {
        for m in &self.middlewares {
            m.on_agent_stop().await;
        }
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Composes a `MiddlewareChain` with a terminal handler into a callable
/// pipeline for model calls and tool calls.
pub struct Pipeline {
    chain: MiddlewareChain,
    model_terminal: Arc<dyn Terminal>,
    tool_terminal: Arc<dyn Terminal>,
}

impl Pipeline {
    pub fn new(
        chain: MiddlewareChain,
        model_terminal: Arc<dyn Terminal>,
        tool_terminal: Arc<dyn Terminal>,
    ) -> Self {
        Self { chain, model_terminal, tool_terminal }
    }

    pub async fn run_model_call(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        self.run(request, true).await
    }

    pub async fn run_tool_call(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        self.run(request, false).await
    }

    async fn run(&self, request: PipelineRequest, is_model_call: bool) -> Result<PipelineResponse, PipelineError> {
        let terminal = if is_model_call { self.model_terminal.clone() } else { self.tool_terminal.clone() };
        let continuation = Self::build(&self.chain.middlewares, 0, terminal, is_model_call);
        continuation.call(request).await
    }

    /// Build the continuation recursively from the outermost (index 0, the
    /// lowest priority) to the terminal handler. Each layer's `next` is the
    /// continuation built from `index + 1`.
    fn build<'a>(
        middlewares: &'a [Arc<dyn Middleware>],
        index: usize,
        terminal: Arc<dyn Terminal>,
        is_model_call: bool,
    ) -> Next<'a> {
        if index >= middlewares.len() {
            return Next::terminal(terminal);
        }

        let middleware = middlewares[index].clone();
        Next {
            inner: Box::new(move |request| {
                let inner_next = Self::build(middlewares, index + 1, terminal, is_model_call);
                Box::pin(async move {
                    if is_model_call {
                        middleware.wrap_model_call(request, inner_next).await
                    } else {
                        middleware.wrap_tool_call(request, inner_next).await
                    }
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct RecordingMiddleware {
        name: String,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for RecordingMiddleware {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn wrap_model_call(
            &self,
            request: PipelineRequest,
            next: Next<'_>,
        ) -> Result<PipelineResponse, PipelineError> {
            self.log.lock().unwrap().push(format!("{}:in", self.name));
            let response = next.call(request).await?;
            self.log.lock().unwrap().push(format!("{}:out", self.name));
            Ok(response)
        }
    }

    struct EchoTerminal;

    #[async_trait]
    impl Terminal for EchoTerminal {
        async fn invoke(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
            Ok(PipelineResponse::new(request.payload))
        }
    }

    struct FailingMiddleware {
        priority: i32,
    }

    #[async_trait]
    impl Middleware for FailingMiddleware {
        fn name(&self) -> &str {
            "failing"
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn wrap_model_call(
            &self,
            _request: PipelineRequest,
            _next: Next<'_>,
        ) -> Result<PipelineResponse, PipelineError> {
            Err(PipelineError::MiddlewareFailed("failing".into(), anyhow::anyhow!("boom")))
        }
    }

    fn model_request() -> PipelineRequest {
        PipelineRequest { kind: RequestKind::ModelCall, payload: Value::String("hi".into()), metadata: Value::Null }
    }

    // ── Testable property 9: ordering ───────────────────────────────────────

    #[tokio::test]
    async fn ordering_is_outer_in_inner_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.register(Arc::new(RecordingMiddleware { name: "outer".into(), priority: 10, log: log.clone() }));
        chain.register(Arc::new(RecordingMiddleware { name: "inner".into(), priority: 50, log: log.clone() }));

        let pipeline = Pipeline::new(chain, Arc::new(EchoTerminal), Arc::new(EchoTerminal));
        pipeline.run_model_call(model_request()).await.unwrap();

        let recorded = log.lock().unwrap().clone();
        assert_eq!(recorded, vec!["outer:in", "inner:in", "inner:out", "outer:out"]);
    }

    #[tokio::test]
    async fn equal_priority_ties_break_by_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.register(Arc::new(RecordingMiddleware { name: "first".into(), priority: 30, log: log.clone() }));
        chain.register(Arc::new(RecordingMiddleware { name: "second".into(), priority: 30, log: log.clone() }));

        let pipeline = Pipeline::new(chain, Arc::new(EchoTerminal), Arc::new(EchoTerminal));
        pipeline.run_model_call(model_request()).await.unwrap();

        let recorded = log.lock().unwrap().clone();
        assert_eq!(recorded, vec!["first:in", "second:in", "second:out", "first:out"]);
    }

    #[tokio::test]
    async fn middleware_failure_aborts_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.register(Arc::new(RecordingMiddleware { name: "outer".into(), priority: 10, log: log.clone() }));
        chain.register(Arc::new(FailingMiddleware { priority: 20 }));
        chain.register(Arc::new(RecordingMiddleware { name: "inner".into(), priority: 90, log: log.clone() }));

        let pipeline = Pipeline::new(chain, Arc::new(EchoTerminal), Arc::new(EchoTerminal));
        let result = pipeline.run_model_call(model_request()).await;

        assert!(result.is_err());
        let recorded = log.lock().unwrap().clone();
        // inner middleware never ran; outer observed the failure via its own continuation.
        assert_eq!(recorded, vec!["outer:in"]);
    }

    #[tokio::test]
    async fn empty_chain_invokes_terminal_directly() {
        let chain = MiddlewareChain::new();
        let pipeline = Pipeline::new(chain, Arc::new(EchoTerminal), Arc::new(EchoTerminal));
        let response = pipeline.run_model_call(model_request()).await.unwrap();
        assert_eq!(response.payload, Value::String("hi".into()));
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_for_every_registered_middleware() {
        static STARTS: AtomicU32 = AtomicU32::new(0);

        struct CountingMiddleware;

        #[async_trait]
        impl Middleware for CountingMiddleware {
            fn name(&self) -> &str {
                "counting"
            }
            fn priority(&self) -> i32 {
                10
            }
            async fn on_agent_start(&self) {
                STARTS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut chain = MiddlewareChain::new();
        chain.register(Arc::new(CountingMiddleware));
        chain.register(Arc::new(CountingMiddleware));
        chain.run_start_hooks().await;
        assert_eq!(STARTS.load(Ordering::SeqCst), 2);
    }
}
