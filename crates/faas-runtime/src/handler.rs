//! Handler calling convention.
//!
//! A handler receives `(event, context, completion)` and must deliver exactly
//! one result through the [`Completion`]. Returning an error (or panicking)
//! from [`Handler::invoke`] is the synchronous failure path; delivering an
//! error through the completion is the asynchronous one. The dispatcher
//! treats both the same way.

use crate::event::{InvocationContext, InvocationEvent};
use async_trait::async_trait;
use faas_common::Headers;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

pub type HandlerResult = anyhow::Result<Output>;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn invoke(
        &self,
        event: InvocationEvent,
        context: InvocationContext,
        completion: Completion,
    ) -> anyhow::Result<()>;
}

// --- Completion ---

/// Single-resolution result channel given to a handler.
///
/// Clones share the same slot: the first delivery wins and any later one is
/// dropped.
#[derive(Clone)]
pub struct Completion {
    slot: Arc<Mutex<Option<oneshot::Sender<HandlerResult>>>>,
}

impl Completion {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<HandlerResult>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (completion, rx)
    }

    /// Delivers the result. Returns `false` if a result was already delivered
    /// or nobody is waiting any more.
    pub fn complete(&self, result: HandlerResult) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                debug!("Completion already delivered, ignoring repeated result");
                false
            }
        }
    }

    pub fn succeed(&self, output: impl Into<Output>) -> bool {
        self.complete(Ok(output.into()))
    }

    pub fn fail(&self, err: impl Into<anyhow::Error>) -> bool {
        self.complete(Err(err.into()))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.slot.lock().map(|s| s.is_some()).unwrap_or(false);
        f.debug_struct("Completion").field("pending", &pending).finish()
    }
}

// --- Output ---

/// What a handler hands back.
pub enum Output {
    /// No result. Encodes as an empty payload.
    Empty,
    /// Raw bytes, passed through unchanged in generic mode.
    Bytes(Vec<u8>),
    /// Any serializable value; serialization happens at encode time.
    Json(JsonOutput),
    /// Structured HTTP-flavored response.
    Http(HttpResponse),
}

impl Output {
    pub fn json<T: Serialize + Send + 'static>(value: T) -> Self {
        Output::Json(JsonOutput(Box::new(value)))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Output::json(value.into())
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Empty => f.write_str("Empty"),
            Output::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Output::Json(_) => f.write_str("Json(..)"),
            Output::Http(r) => f.debug_tuple("Http").field(r).finish(),
        }
    }
}

impl From<()> for Output {
    fn from(_: ()) -> Self {
        Output::Empty
    }
}

impl From<Vec<u8>> for Output {
    fn from(bytes: Vec<u8>) -> Self {
        Output::Bytes(bytes)
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::json(value)
    }
}

impl From<HttpResponse> for Output {
    fn from(response: HttpResponse) -> Self {
        Output::Http(response)
    }
}

trait ToJson: Send {
    fn to_json(&self) -> serde_json::Result<Value>;
}

impl<T: Serialize + Send> ToJson for T {
    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Type-erased serializable handler result.
pub struct JsonOutput(Box<dyn ToJson>);

impl JsonOutput {
    pub fn to_value(&self) -> serde_json::Result<Value> {
        self.0.to_json()
    }
}

/// Structured HTTP-flavored response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_base64_encoded: Option<bool>,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.get_or_insert_with(Headers::new).insert(key, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_base64(mut self, encoded: bool) -> Self {
        self.is_base64_encoded = Some(encoded);
        self
    }
}

// --- Closure handlers ---

/// Handler built from an async closure; its result goes to the completion.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InvocationEvent, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(InvocationEvent, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn invoke(
        &self,
        event: InvocationEvent,
        context: InvocationContext,
        completion: Completion,
    ) -> anyhow::Result<()> {
        let result = (self.f)(event, context).await;
        completion.complete(result);
        Ok(())
    }
}

// --- Catalog ---

/// Handler implementations available to the registry, keyed by
/// `"<module>.<export>"` identifiers as written in function entries.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.handlers.insert(id.into(), Arc::new(handler));
        self
    }

    pub fn with(mut self, id: impl Into<String>, handler: impl Handler) -> Self {
        self.register(id, handler);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("HandlerCatalog").field("ids", &ids).finish()
    }
}
