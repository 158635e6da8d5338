//! Function invocation
//!
//! The executor picks an execution mode from the function's runtime API
//! version: version 2 and later run in a fresh worker process per
//! invocation, older functions run in-process through the handler table.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use funcstack_core::RequestId;

use crate::event::InvocationEvent;
use crate::function::FunctionDescriptor;
use crate::identity::ClientContext;
use crate::native::HandlerTable;
use crate::worker::{WorkerConfig, WorkerRunner};

pub const TIMEOUT_ERROR: &str = "Runtime.TimeoutError";
pub const HANDLER_NOT_FOUND: &str = "Runtime.HandlerNotFound";
pub const HANDLER_PANIC: &str = "Runtime.HandlerPanic";
pub const BUILD_ERROR: &str = "BuildError";

/// Error raised by a function, or by the machinery running it
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{error_type}: {error_message}")]
pub struct InvocationError {
    #[serde(default = "default_error_type")]
    pub error_type: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default, deserialize_with = "deserialize_stack_trace")]
    pub stack_trace: Vec<String>,
}

fn default_error_type() -> String {
    "Error".to_string()
}

/// Stack traces arrive either as one string or as a list of lines
fn deserialize_stack_trace<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Trace {
        Lines(Vec<String>),
        Text(String),
    }

    Ok(match Option::<Trace>::deserialize(deserializer)? {
        Some(Trace::Lines(lines)) => lines,
        Some(Trace::Text(text)) => text.lines().map(str::to_string).collect(),
        None => Vec::new(),
    })
}

impl InvocationError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Vec::new(),
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    pub fn timeout(function: &str, timeout: Duration) -> Self {
        Self::new(
            TIMEOUT_ERROR,
            format!(
                "Function '{function}' timed out after {:.2} seconds",
                timeout.as_secs_f64()
            ),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.error_type == TIMEOUT_ERROR
    }
}

/// Context handed to in-process handlers
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: RequestId,
    pub function_name: String,
    pub client_context: Option<ClientContext>,
    pub environment: HashMap<String, String>,
    deadline: Instant,
}

impl InvocationContext {
    pub fn new(
        function_name: impl Into<String>,
        request_id: RequestId,
        client_context: Option<ClientContext>,
        environment: HashMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id,
            function_name: function_name.into(),
            client_context,
            environment,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn get_remaining_time_in_millis(&self) -> u64 {
        self.remaining_time().as_millis() as u64
    }
}

/// Value produced by a function
#[derive(Debug)]
pub struct FunctionOutput {
    pub value: Value,
    /// Connection carrying a streamed body
    pub stream: Option<TcpStream>,
}

impl FunctionOutput {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            stream: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Direct,
    Isolated,
}

impl ExecutionMode {
    pub fn for_runtime_api_version(version: u32) -> Self {
        if version >= 2 {
            Self::Isolated
        } else {
            Self::Direct
        }
    }
}

/// Runs functions in the mode their build metadata asks for
pub struct Executor {
    handlers: Arc<HandlerTable>,
    worker: WorkerRunner,
    environment: HashMap<String, String>,
}

impl Executor {
    pub fn new(
        handlers: Arc<HandlerTable>,
        worker: WorkerConfig,
        environment: HashMap<String, String>,
    ) -> Self {
        Self {
            handlers,
            worker: WorkerRunner::new(worker),
            environment,
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    /// Names of direct-mode functions with no handler registered for their
    /// entry file. Functions that fail to build are skipped.
    pub async fn unhandled_functions(&self, functions: &[Arc<FunctionDescriptor>]) -> Vec<String> {
        let mut names = Vec::new();
        for function in functions {
            let Ok(data) = function.build_data().await else {
                continue;
            };
            let direct = ExecutionMode::for_runtime_api_version(data.runtime_api_version)
                == ExecutionMode::Direct;
            if direct && self.handlers.get(&data.entry_path).is_none() {
                names.push(function.name().to_string());
            }
        }
        names.sort();
        names
    }

    pub async fn invoke(
        &self,
        function: &FunctionDescriptor,
        event: &InvocationEvent,
        client_context: Option<&ClientContext>,
        request_id: &RequestId,
        timeout: Duration,
    ) -> Result<FunctionOutput, InvocationError> {
        let data = function
            .build_data()
            .await
            .map_err(|e| InvocationError::new(BUILD_ERROR, e.to_string()))?;

        let mode = ExecutionMode::for_runtime_api_version(data.runtime_api_version);
        debug!(
            function = %function.name(),
            request_id = %request_id,
            mode = ?mode,
            timeout_ms = timeout.as_millis() as u64,
            "Invoking function"
        );

        match mode {
            ExecutionMode::Direct => {
                let context = InvocationContext::new(
                    function.name(),
                    request_id.clone(),
                    client_context.cloned(),
                    self.environment.clone(),
                    timeout,
                );
                let value = self
                    .handlers
                    .invoke(&data.entry_path, event.clone(), context, timeout)
                    .await?;
                Ok(FunctionOutput::value(value))
            }
            ExecutionMode::Isolated => {
                self.worker
                    .run(
                        function.name(),
                        &data.entry_path,
                        event,
                        client_context,
                        &self.environment,
                        timeout,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_from_worker_payload() {
        let error: InvocationError = serde_json::from_value(json!({
            "errorType": "TypeError",
            "errorMessage": "x is not a function",
            "stackTrace": "TypeError: x is not a function\n    at handler (hello.js:3:5)",
        }))
        .unwrap();
        assert_eq!(error.error_type, "TypeError");
        assert_eq!(error.stack_trace.len(), 2);

        let error: InvocationError = serde_json::from_value(json!({
            "errorMessage": "boom",
            "stackTrace": ["a", "b", "c"],
        }))
        .unwrap();
        assert_eq!(error.error_type, "Error");
        assert_eq!(error.stack_trace, vec!["a", "b", "c"]);
        assert_eq!(error.to_string(), "Error: boom");
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(ExecutionMode::for_runtime_api_version(1), ExecutionMode::Direct);
        assert_eq!(ExecutionMode::for_runtime_api_version(2), ExecutionMode::Isolated);
        assert_eq!(ExecutionMode::for_runtime_api_version(3), ExecutionMode::Isolated);
    }

    #[test]
    fn test_remaining_time() {
        let context = InvocationContext::new(
            "hello",
            RequestId::new(),
            None,
            HashMap::new(),
            Duration::from_secs(30),
        );
        let remaining = context.get_remaining_time_in_millis();
        assert!(remaining > 29_000 && remaining <= 30_000);
    }

    #[tokio::test]
    async fn test_unhandled_direct_functions() {
        use crate::builder::{FunctionSettings, FunctionSource, ScriptBuilder};
        use crate::native::handler_fn;

        let dir = tempfile::tempdir().unwrap();
        let settings = ["legacy", "registered"]
            .into_iter()
            .map(|name| {
                let settings = FunctionSettings {
                    runtime_api_version: Some(1),
                    ..Default::default()
                };
                (name.to_string(), settings)
            })
            .collect();
        let builder = Arc::new(ScriptBuilder::default().with_settings(settings));

        let functions: Vec<Arc<FunctionDescriptor>> = ["legacy", "registered", "worker"]
            .into_iter()
            .map(|name| {
                let main_file = dir.path().join(format!("{name}.js"));
                std::fs::write(&main_file, "").unwrap();
                Arc::new(FunctionDescriptor::new(
                    FunctionSource {
                        name: name.to_string(),
                        main_file,
                        directory: None,
                    },
                    builder.clone(),
                ))
            })
            .collect();

        let handlers = Arc::new(HandlerTable::new());
        handlers.register(
            dir.path().join("registered.js"),
            handler_fn(|_event, _context| async { Ok(Value::Null) }),
        );
        let executor = Executor::new(handlers, WorkerConfig::default(), HashMap::new());

        assert_eq!(executor.unhandled_functions(&functions).await, vec!["legacy"]);
    }

    #[test]
    fn test_timeout_error() {
        let error = InvocationError::timeout("slow", Duration::from_millis(1500));
        assert!(error.is_timeout());
        assert!(error.error_message.contains("1.50 seconds"));
    }
}
