//! Tool-call interception.
//!
//! The interceptor sits between the agents and the tool/MCP surface. It
//! never alters a call: it times it, records a [`ToolCall`] plus a short
//! synthetic [`ThinkingStep`] into whichever trace is currently routed, and
//! surfaces tool errors unchanged. When unbound or unrouted it is a no-op.
//!
//! One interceptor is shared between the tool surface and the
//! orchestrator: the orchestrator binds it to each round's trace store and
//! routes it to the active stage's trace as the runtime transitions.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::trace::{ThinkingStep, ToolCall, TraceStore};

/// Routes tool events into the active stage's live trace.
///
/// Binding and routing are synchronous (stage-transition observers are not
/// async); the locks are only held for the swap.
#[derive(Clone, Default)]
pub struct ToolCallInterceptor {
    store: Arc<RwLock<Option<Arc<TraceStore>>>>,
    /// Trace id of the currently active stage, set by the orchestrator.
    route: Arc<RwLock<Option<String>>>,
}

impl ToolCallInterceptor {
    /// An interceptor not yet bound to any store; records nothing until
    /// [`bind`](Self::bind) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// An interceptor bound to `store` from the start.
    pub fn bound(store: Arc<TraceStore>) -> Self {
        let interceptor = Self::new();
        interceptor.bind(store);
        interceptor
    }

    /// Bind (or re-bind) the interceptor to a trace store. Routing is
    /// cleared: trace ids from the previous binding are meaningless.
    pub fn bind(&self, store: Arc<TraceStore>) {
        *self.route.write().expect("route lock") = None;
        *self.store.write().expect("store lock") = Some(store);
    }

    /// Route subsequent tool events to `trace_id`.
    pub fn route_to(&self, trace_id: impl Into<String>) {
        let trace_id = trace_id.into();
        debug!("Interceptor routing tool events to trace {}", trace_id);
        *self.route.write().expect("route lock") = Some(trace_id);
    }

    /// Stop recording; tool calls pass through untouched.
    pub fn disable(&self) {
        *self.route.write().expect("route lock") = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.route.read().expect("route lock").is_some()
            && self.store.read().expect("store lock").is_some()
    }

    /// Record one completed tool call into the active trace.
    pub async fn record(
        &self,
        tool_name: &str,
        arguments: HashMap<String, Value>,
        success: bool,
        response: &str,
        duration_secs: f64,
    ) {
        let store = match self.store.read().expect("store lock").clone() {
            Some(store) => store,
            None => return,
        };
        let trace_id = match self.route.read().expect("route lock").clone() {
            Some(id) => id,
            None => return,
        };

        let now = Utc::now();
        let call = ToolCall {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            timestamp: now,
            success,
            response: response.to_string(),
            duration: duration_secs,
        };
        if let Err(e) = store.add_tool_call(&trace_id, call).await {
            warn!("Failed to record tool call on trace {}: {}", trace_id, e);
            return;
        }

        let outcome = if success { "Success" } else { "Failed" };
        let preview: String = response.chars().take(200).collect();
        let step = ThinkingStep {
            reasoning: format!("Used tool {} - {}: {}", tool_name, outcome, preview),
            tool_choice: tool_name.to_string(),
            justification: format!("tool call, duration: {:.2}s", duration_secs),
            timestamp: now,
        };
        if let Err(e) = store.add_thinking_step(&trace_id, step).await {
            warn!("Failed to record thinking step on trace {}: {}", trace_id, e);
        }
    }

    /// Time an async tool invocation, record it, and pass its result
    /// through unchanged. Tool errors are recorded as failed calls and then
    /// re-surfaced.
    pub async fn observe<T, F, Fut>(
        &self,
        tool_name: &str,
        arguments: HashMap<String, Value>,
        invoke: F,
    ) -> Result<T>
    where
        T: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = invoke().await;
        let duration = start.elapsed().as_secs_f64();

        match &result {
            Ok(value) => {
                self.record(tool_name, arguments, true, &value.to_string(), duration)
                    .await;
            }
            Err(e) => {
                self.record(tool_name, arguments, false, &e.to_string(), duration)
                    .await;
            }
        }
        result
    }
}
