//! Function runtime sidecar: serves `faas.Function/Call` and routes each call
//! to a registered handler.

pub mod builtin;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod event;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod service;
pub mod translate;

pub use config::{EnvOverrides, FunctionEntry, RuntimeConfig};
pub use dispatcher::Dispatcher;
pub use error::{FaasError, Result, RuntimeError};
pub use event::{HttpEvent, InvocationContext, InvocationEvent};
pub use handler::{handler_fn, Completion, Handler, HandlerCatalog, HttpResponse, Output};
pub use lifecycle::Runtime;
pub use registry::Registry;
pub use service::FunctionService;
