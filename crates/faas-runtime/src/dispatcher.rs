//! Per-call state machine: Received -> Resolved -> Invoking -> Completed.

use crate::encoder::{self, encode_generic, encode_http};
use crate::event::{InvocationContext, InvocationEvent};
use crate::handler::{Completion, Output};
use crate::registry::{RegisteredFunction, Registry};
use crate::translate::translate;
use faas_common::{metadata, FaasError, InvocationType, Message, Result};
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const NOT_COMPLETED: &str = "handler returned without completing";

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    abort: CancellationToken,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_abort(registry, CancellationToken::new())
    }

    /// Cancelling `abort` fails every in-flight and future call with
    /// [`FaasError::Aborted`].
    pub fn with_abort(registry: Arc<Registry>, abort: CancellationToken) -> Self {
        Self { registry, abort }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Handles one call end to end. Errors are call-level failures; an
    /// HTTP-mode call reports handler failures as HTTP responses instead.
    pub async fn dispatch(&self, request: Message) -> Result<Message> {
        debug!(phase = "received", mode = %request.r#type, "Call received");

        let invocation = translate(&request).map_err(|err| {
            warn!(
                function = request.metadata_value(metadata::FUNCTION_NAME).unwrap_or_default(),
                invoke_id = request.metadata_value(metadata::INVOKE_ID).unwrap_or_default(),
                error = %err,
                "Rejected call"
            );
            err
        })?;
        let mode = invocation.kind;

        let function = match self.registry.resolve(&invocation.function_name) {
            Ok(function) => function,
            Err(err) => {
                info!(
                    function = %invocation.function_name,
                    invoke_id = %invocation.context.invoke_id,
                    %mode,
                    "Function not found"
                );
                return match mode {
                    InvocationType::Generic => Err(err),
                    InvocationType::Http => Ok(encoder::http_error(&err)),
                };
            }
        };

        let mut context = invocation.context;
        context.function_name = function.name.clone();
        let invoke_id = context.invoke_id.clone();
        debug!(
            phase = "resolved",
            function = %function.name,
            handler = %function.handler_id,
            invoke_id = %invoke_id,
            "Function resolved"
        );

        let outcome = self.invoke(function, invocation.event, context).await;
        debug!(
            phase = "completed",
            function = %function.name,
            invoke_id = %invoke_id,
            ok = outcome.is_ok(),
            "Invocation completed"
        );
        if let Err(err) = &outcome {
            error!(function = %function.name, invoke_id = %invoke_id, error = %err, "Invocation failed");
        }

        match mode {
            InvocationType::Generic => encode_generic(&request, outcome?).map_err(|err| {
                error!(function = %function.name, invoke_id = %invoke_id, error = %err, "Encoding response failed");
                err
            }),
            InvocationType::Http => match outcome {
                Err(err @ FaasError::Aborted(_)) => Err(err),
                outcome => Ok(encode_http(outcome)),
            },
        }
    }

    async fn invoke(
        &self,
        function: &RegisteredFunction,
        event: InvocationEvent,
        context: InvocationContext,
    ) -> Result<Output> {
        if self.abort.is_cancelled() {
            return Err(FaasError::Aborted("runtime is shutting down".to_string()));
        }

        let (completion, mut delivered) = Completion::channel();
        let handler = Arc::clone(&function.handler);
        debug!(phase = "invoking", function = %function.name, invoke_id = %context.invoke_id, "Invoking handler");
        let mut task = tokio::spawn(async move { handler.invoke(event, context, completion).await });
        let mut returned = false;

        loop {
            tokio::select! {
                biased;

                result = &mut delivered => {
                    match result {
                        Ok(Ok(output)) => return Ok(output),
                        Ok(Err(err)) => return Err(FaasError::UserCodeInvoke(format!("{err:#}"))),
                        Err(_) if returned => {
                            return Err(FaasError::UserCodeInvoke(NOT_COMPLETED.to_string()))
                        }
                        // Completion dropped while the handler unwinds; its
                        // return value or panic carries the reason.
                        Err(_) => {
                            tokio::select! {
                                biased;
                                joined = &mut task => {
                                    return Err(FaasError::UserCodeInvoke(
                                        handler_failure(joined).unwrap_or_else(|| NOT_COMPLETED.to_string()),
                                    ));
                                }
                                _ = self.abort.cancelled() => {
                                    task.abort();
                                    return Err(FaasError::Aborted("runtime is shutting down".to_string()));
                                }
                            }
                        }
                    }
                }

                joined = &mut task, if !returned => {
                    returned = true;
                    // On a clean return the completion may still arrive from a
                    // clone the handler handed off.
                    if let Some(text) = handler_failure(joined) {
                        return Err(FaasError::UserCodeInvoke(text));
                    }
                }

                _ = self.abort.cancelled() => {
                    task.abort();
                    return Err(FaasError::Aborted("runtime is shutting down".to_string()));
                }
            }
        }
    }
}

/// Failure text of a finished handler task; `None` for a clean return.
fn handler_failure(joined: std::result::Result<anyhow::Result<()>, JoinError>) -> Option<String> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(join_err) => Some(panic_text(join_err)),
    }
}

fn panic_text(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FunctionEntry;
    use crate::handler::{handler_fn, Handler, HandlerCatalog, HttpResponse};
    use async_trait::async_trait;
    use faas_common::{decode_headers, metadata};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailsSync;

    #[async_trait]
    impl Handler for FailsSync {
        async fn invoke(
            &self,
            _event: InvocationEvent,
            _context: InvocationContext,
            _completion: Completion,
        ) -> anyhow::Result<()> {
            anyhow::bail!("thrown before completing")
        }
    }

    struct Panics;

    #[async_trait]
    impl Handler for Panics {
        async fn invoke(
            &self,
            _event: InvocationEvent,
            _context: InvocationContext,
            _completion: Completion,
        ) -> anyhow::Result<()> {
            panic!("kaboom")
        }
    }

    struct NeverCompletes;

    #[async_trait]
    impl Handler for NeverCompletes {
        async fn invoke(
            &self,
            _event: InvocationEvent,
            _context: InvocationContext,
            _completion: Completion,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct CompletesTwice;

    #[async_trait]
    impl Handler for CompletesTwice {
        async fn invoke(
            &self,
            _event: InvocationEvent,
            _context: InvocationContext,
            completion: Completion,
        ) -> anyhow::Result<()> {
            completion.succeed(Output::text("first"));
            completion.succeed(Output::text("second"));
            completion.fail(anyhow::anyhow!("third"));
            Ok(())
        }
    }

    /// Returns immediately and completes later from a spawned task.
    struct CompletesLater;

    #[async_trait]
    impl Handler for CompletesLater {
        async fn invoke(
            &self,
            _event: InvocationEvent,
            _context: InvocationContext,
            completion: Completion,
        ) -> anyhow::Result<()> {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                completion.succeed(Output::text("later"));
            });
            Ok(())
        }
    }

    struct Hangs;

    #[async_trait]
    impl Handler for Hangs {
        async fn invoke(
            &self,
            _event: InvocationEvent,
            _context: InvocationContext,
            completion: Completion,
        ) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            completion.succeed(());
            Ok(())
        }
    }

    fn dispatcher(catalog: HandlerCatalog, names: &[(&str, &str)]) -> Dispatcher {
        let entries: Vec<_> = names
            .iter()
            .map(|(name, handler)| FunctionEntry::new(*name, *handler))
            .collect();
        let registry = Registry::load(&entries, Path::new("/code"), &catalog).unwrap();
        Dispatcher::new(Arc::new(registry))
    }

    fn echo_catalog(calls: Arc<AtomicUsize>) -> HandlerCatalog {
        HandlerCatalog::new().with(
            "index.handler",
            handler_fn(move |event: InvocationEvent, ctx: InvocationContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let name = event
                        .as_json()
                        .and_then(|v| v["name"].as_str())
                        .unwrap_or("nobody")
                        .to_string();
                    Ok::<_, anyhow::Error>(Output::json(
                        json!({"greeting": format!("hello {name}"), "function": ctx.function_name}),
                    ))
                }
            }),
        )
    }

    fn generic(function: &str, payload: &[u8]) -> Message {
        Message::new("", payload.to_vec()).with_metadata(metadata::FUNCTION_NAME, function)
    }

    fn payload_json(msg: &Message) -> Value {
        serde_json::from_slice(&msg.payload).unwrap()
    }

    fn user_code_error(result: Result<Message>) -> String {
        match result {
            Err(FaasError::UserCodeInvoke(text)) => text,
            other => panic!("expected UserCodeInvoke, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generic_call_echoes_envelope() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(echo_catalog(calls.clone()), &[("greet", "index.handler")]);

        let request = generic("greet", br#"{"name":"edge"}"#).with_metadata("trace", "t-1");
        let response = d.dispatch(request).await.unwrap();

        assert_eq!(payload_json(&response), json!({"greeting": "hello edge", "function": "greet"}));
        assert_eq!(response.r#type, "");
        assert_eq!(response.metadata_value("trace"), Some("t-1"));
        assert_eq!(response.metadata_value(metadata::FUNCTION_NAME), Some("greet"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_function_is_default_route() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(echo_catalog(calls), &[("greet", "index.handler")]);

        let response = d.dispatch(Message::new("", b"{}".to_vec())).await.unwrap();
        assert_eq!(payload_json(&response)["function"], "greet");
    }

    #[tokio::test]
    async fn test_missing_function_is_not_found_without_invoking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(echo_catalog(calls.clone()), &[("greet", "index.handler")]);

        let err = d.dispatch(generic("nope", b"{}")).await.unwrap_err();
        assert_eq!(err, FaasError::NotFound("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_functions_is_not_found() {
        let d = dispatcher(HandlerCatalog::new(), &[]);
        let err = d.dispatch(Message::new("", Vec::new())).await.unwrap_err();
        assert!(matches!(err, FaasError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unsupported_type_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(echo_catalog(calls.clone()), &[("greet", "index.handler")]);
        let err = d.dispatch(Message::new("SQS", Vec::new())).await.unwrap_err();
        assert!(matches!(err, FaasError::UnsupportedType(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_completion_error_is_user_code_invoke() {
        let catalog = HandlerCatalog::new().with(
            "index.handler",
            handler_fn(|_, _| async { Err::<Output, _>(anyhow::anyhow!("db unavailable")) }),
        );
        let d = dispatcher(catalog, &[("greet", "index.handler")]);
        let text = user_code_error(d.dispatch(generic("greet", b"{}")).await);
        assert_eq!(text, "db unavailable");
    }

    #[tokio::test]
    async fn test_sync_failures_are_user_code_invoke() {
        let catalog = HandlerCatalog::new()
            .with("fails.sync", FailsSync)
            .with("panics.handler", Panics)
            .with("never.handler", NeverCompletes);
        let d = dispatcher(
            catalog,
            &[
                ("a", "fails.sync"),
                ("b", "panics.handler"),
                ("c", "never.handler"),
            ],
        );

        let text = user_code_error(d.dispatch(generic("a", b"")).await);
        assert_eq!(text, "thrown before completing");

        let text = user_code_error(d.dispatch(generic("b", b"")).await);
        assert_eq!(text, "handler panicked: kaboom");

        let text = user_code_error(d.dispatch(generic("c", b"")).await);
        assert_eq!(text, NOT_COMPLETED);
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let catalog = HandlerCatalog::new().with("twice.handler", CompletesTwice);
        let d = dispatcher(catalog, &[("twice", "twice.handler")]);
        let response = d.dispatch(generic("twice", b"")).await.unwrap();
        assert_eq!(response.payload, br#""first""#.to_vec());
    }

    #[tokio::test]
    async fn test_completion_after_return() {
        let catalog = HandlerCatalog::new().with("later.handler", CompletesLater);
        let d = dispatcher(catalog, &[("later", "later.handler")]);
        let response = d.dispatch(generic("later", b"")).await.unwrap();
        assert_eq!(response.payload, br#""later""#.to_vec());
    }

    #[tokio::test]
    async fn test_unserializable_result_is_user_code_return() {
        let catalog = HandlerCatalog::new().with(
            "index.handler",
            handler_fn(|_, _| async {
                let mut bad = std::collections::HashMap::new();
                bad.insert((1, 2), "tuple keys");
                Ok::<_, anyhow::Error>(Output::json(bad))
            }),
        );
        let d = dispatcher(catalog, &[("greet", "index.handler")]);
        let err = d.dispatch(generic("greet", b"")).await.unwrap_err();
        assert!(matches!(err, FaasError::UserCodeReturn(_)));
    }

    #[tokio::test]
    async fn test_abort_fails_in_flight_call() {
        let catalog = HandlerCatalog::new().with("hangs.handler", Hangs);
        let d = dispatcher(catalog, &[("hang", "hangs.handler")]);
        let abort = d.abort_token();

        let call = tokio::spawn({
            let d = d.clone();
            async move { d.dispatch(generic("hang", b"")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.cancel();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(FaasError::Aborted(_))));

        // Calls after the abort never reach the handler.
        let result = d.dispatch(generic("hang", b"")).await;
        assert!(matches!(result, Err(FaasError::Aborted(_))));
    }

    // --- HTTP mode ---

    fn http(function: &str, body: &str) -> Message {
        Message::new("HTTP", body.as_bytes().to_vec())
            .with_metadata(metadata::FUNCTION_NAME, function)
            .with_metadata(metadata::PATH, "/greet")
            .with_metadata(metadata::HTTP_METHOD, "GET")
    }

    #[tokio::test]
    async fn test_http_greet() {
        let catalog = HandlerCatalog::new().with(
            "index.handler",
            handler_fn(|event: InvocationEvent, _| async move {
                let method = event.as_http().map(|e| e.http_method.clone()).unwrap_or_default();
                assert_eq!(method, "GET");
                Ok::<_, anyhow::Error>(Output::json(json!({"statusCode": 200, "body": "hi"})))
            }),
        );
        let d = dispatcher(catalog, &[("greet", "index.handler")]);

        let response = d.dispatch(http("greet", "")).await.unwrap();
        assert_eq!(response.r#type, "HTTP");
        assert_eq!(response.metadata_value(metadata::STATUS_CODE), Some("200"));
        assert_eq!(response.payload, b"hi".to_vec());
        let headers = decode_headers(response.metadata_value(metadata::HEADERS).unwrap());
        assert_eq!(headers.get("Content-Type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_http_failures_become_responses() {
        let catalog = HandlerCatalog::new()
            .with(
                "fails.handler",
                handler_fn(|_, _| async { Err::<Output, _>(anyhow::anyhow!("boom")) }),
            )
            .with(
                "shape.handler",
                handler_fn(|_, _| async { Ok::<_, anyhow::Error>(Output::json(json!({"body": "x"}))) }),
            )
            .with(
                "typed.handler",
                handler_fn(|_, _| async {
                    Ok::<_, anyhow::Error>(Output::Http(HttpResponse::new(302).with_header("Location", "/")))
                }),
            );
        let d = dispatcher(
            catalog,
            &[
                ("fails", "fails.handler"),
                ("shape", "shape.handler"),
                ("typed", "typed.handler"),
            ],
        );

        let cases = [
            ("missing", "404", "no route"),
            ("fails", "500", "boom"),
            ("shape", "502", "function response error"),
        ];
        for (function, status, message) in cases {
            let response = d.dispatch(http(function, "")).await.unwrap();
            assert_eq!(response.metadata_value(metadata::STATUS_CODE), Some(status));
            assert_eq!(
                payload_json(&response),
                json!({"errorCode": status, "message": message})
            );
        }

        let response = d.dispatch(http("typed", "")).await.unwrap();
        assert_eq!(response.metadata_value(metadata::STATUS_CODE), Some("302"));
        assert!(response.payload.is_empty());
    }

    #[tokio::test]
    async fn test_http_sync_failures_keep_handler_text() {
        let catalog = HandlerCatalog::new()
            .with("fails.sync", FailsSync)
            .with("panics.handler", Panics);
        let d = dispatcher(catalog, &[("throws", "fails.sync"), ("panics", "panics.handler")]);

        let cases = [
            ("throws", "thrown before completing"),
            ("panics", "handler panicked: kaboom"),
        ];
        for (function, message) in cases {
            let response = d.dispatch(http(function, "")).await.unwrap();
            assert_eq!(response.metadata_value(metadata::STATUS_CODE), Some("500"));
            assert_eq!(
                payload_json(&response),
                json!({"errorCode": "500", "message": message})
            );
        }
    }

    // --- Log fields ---

    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<std::sync::Mutex<Vec<std::collections::BTreeMap<String, String>>>>);

    struct FieldMap(std::collections::BTreeMap<String, String>);

    impl tracing::field::Visit for FieldMap {
        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut fields = FieldMap(Default::default());
            event.record(&mut fields);
            self.0.lock().unwrap().push(fields.0);
        }
    }

    #[tokio::test]
    async fn test_rejected_call_logs_correlation_fields() {
        use tracing_subscriber::layer::SubscriberExt;

        let captured = CapturedEvents::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(captured.clone()),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(echo_catalog(calls), &[("greet", "index.handler")]);
        let request = Message::new("SMTP", Vec::new())
            .with_metadata(metadata::FUNCTION_NAME, "greet")
            .with_metadata(metadata::INVOKE_ID, "inv-42");
        assert!(d.dispatch(request).await.is_err());

        let events = captured.0.lock().unwrap();
        let rejected = events
            .iter()
            .find(|fields| fields.get("message").map(String::as_str) == Some("Rejected call"))
            .expect("rejection must be logged");
        assert_eq!(rejected.get("function").map(String::as_str), Some("greet"));
        assert_eq!(rejected.get("invoke_id").map(String::as_str), Some("inv-42"));
    }

    #[tokio::test]
    async fn test_http_malformed_request_is_call_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(echo_catalog(calls), &[("greet", "index.handler")]);
        let request = http("greet", "").with_metadata(metadata::IS_BASE64_ENCODED, "maybe");
        let err = d.dispatch(request).await.unwrap_err();
        assert!(matches!(err, FaasError::MalformedRequest(_)));
    }
}
