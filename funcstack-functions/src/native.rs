//! In-process handlers
//!
//! Functions on the older runtime API run inside the server process. Their
//! handlers are registered ahead of time, keyed by the entry file the build
//! produces for them.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::event::InvocationEvent;
use crate::invocation::{InvocationContext, InvocationError, HANDLER_NOT_FOUND, HANDLER_PANIC};

#[async_trait]
pub trait NativeHandler: Send + Sync {
    async fn call(
        &self,
        event: InvocationEvent,
        context: InvocationContext,
    ) -> Result<Value, InvocationError>;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> NativeHandler for FnHandler<F>
where
    F: Fn(InvocationEvent, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
{
    async fn call(
        &self,
        event: InvocationEvent,
        context: InvocationContext,
    ) -> Result<Value, InvocationError> {
        (self.0)(event, context).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn NativeHandler>
where
    F: Fn(InvocationEvent, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers by canonical entry path
#[derive(Default)]
pub struct HandlerTable {
    handlers: DashMap<PathBuf, Arc<dyn NativeHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: impl AsRef<Path>, handler: Arc<dyn NativeHandler>) {
        let entry = canonical(entry.as_ref());
        debug!(entry = %entry.display(), "Registered native handler");
        self.handlers.insert(entry, handler);
    }

    pub fn unregister(&self, entry: impl AsRef<Path>) -> bool {
        self.handlers.remove(&canonical(entry.as_ref())).is_some()
    }

    pub fn get(&self, entry: &Path) -> Option<Arc<dyn NativeHandler>> {
        self.handlers
            .get(entry)
            .or_else(|| self.handlers.get(&canonical(entry)))
            .map(|handler| handler.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for an entry. A panicking handler becomes an
    /// invocation error. The timeout is not enforced here: an overrun is
    /// only reported.
    pub async fn invoke(
        &self,
        entry: &Path,
        event: InvocationEvent,
        context: InvocationContext,
        timeout: Duration,
    ) -> Result<Value, InvocationError> {
        let handler = self.get(entry).ok_or_else(|| {
            InvocationError::new(
                HANDLER_NOT_FOUND,
                format!("No handler is registered for {}", entry.display()),
            )
        })?;

        let function = context.function_name.clone();
        let started = Instant::now();
        let result = match AssertUnwindSafe(handler.call(event, context))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(InvocationError::new(HANDLER_PANIC, panic_message(panic.as_ref()))),
        };

        let elapsed = started.elapsed();
        if elapsed > timeout {
            warn!(
                function = %function,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "Function ran past its timeout"
            );
        }
        result
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Handler panicked".to_string()
    }
}
