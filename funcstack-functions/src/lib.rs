//! Function emulation for funcstack
//!
//! Discovers functions on disk, keeps their builds current, and serves them
//! over HTTP: requests are adapted into invocation events, run in-process or
//! in a worker process, and the results are written back according to the
//! function's kind.

pub mod builder;
pub mod dispatch;
pub mod event;
pub mod function;
pub mod geo;
pub mod handlers;
pub mod identity;
pub mod invocation;
pub mod native;
pub mod registry;
pub mod schedule;
pub mod watcher;
pub mod worker;

pub use builder::{BuildError, BuildOutput, FunctionBuilder, FunctionSettings, FunctionSource, ScriptBuilder};
pub use dispatch::{Dispatcher, Timeouts};
pub use event::{InvocationEvent, RequestAdapter};
pub use function::{FunctionDescriptor, FunctionKind};
pub use geo::{GeoLocator, GeoMode, HttpGeoLocator, StaticGeoLocator};
pub use handlers::{router, FunctionsState};
pub use identity::IdentityProvider;
pub use invocation::{Executor, InvocationContext, InvocationError};
pub use native::{handler_fn, HandlerTable, NativeHandler};
pub use registry::FunctionRegistry;
pub use watcher::FunctionWatcher;
pub use worker::WorkerConfig;
