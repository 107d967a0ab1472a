//! Handlers compiled into the `faas-runtime` binary.

use crate::encoder::{APPLICATION_JSON, CONTENT_TYPE};
use crate::event::{InvocationContext, InvocationEvent};
use crate::handler::{handler_fn, HandlerCatalog, HttpResponse, Output};
use serde_json::json;

pub const ECHO: &str = "echo.handler";
pub const ECHO_HTTP: &str = "echo.http";
pub const HEALTH: &str = "health.handler";

pub fn builtin_catalog() -> HandlerCatalog {
    HandlerCatalog::new()
        .with(ECHO, handler_fn(|event, _| async move { echo(event) }))
        .with(ECHO_HTTP, handler_fn(|event, ctx| async move { echo_http(event, ctx) }))
        .with(
            HEALTH,
            handler_fn(|_, _| async { Ok::<_, anyhow::Error>(Output::json(json!({"status": "ok"}))) }),
        )
}

fn echo(event: InvocationEvent) -> anyhow::Result<Output> {
    Ok(match event {
        InvocationEvent::Json(value) => Output::json(value),
        InvocationEvent::Raw(bytes) => Output::Bytes(bytes),
        InvocationEvent::Http(http) => Output::json(http),
    })
}

fn echo_http(event: InvocationEvent, ctx: InvocationContext) -> anyhow::Result<Output> {
    let body = serde_json::to_string(&json!({
        "function": ctx.function_name,
        "invokeId": ctx.invoke_id,
        "event": event,
    }))?;
    Ok(Output::Http(
        HttpResponse::new(200)
            .with_header(CONTENT_TYPE, APPLICATION_JSON)
            .with_body(body),
    ))
}
