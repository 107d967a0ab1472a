//! Request translation: wire message -> (event, context).

use crate::event::{HttpEvent, InvocationContext, InvocationEvent, RequestContext};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use faas_common::{decode_headers, metadata, FaasError, InvocationType, Message, Result};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A translated call, ready for handler resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kind: InvocationType,
    /// Requested function name; empty selects the default function.
    pub function_name: String,
    pub event: InvocationEvent,
    pub context: InvocationContext,
}

pub fn translate(request: &Message) -> Result<Invocation> {
    let kind = InvocationType::parse(&request.r#type)?;

    let function_name = request
        .metadata_value(metadata::FUNCTION_NAME)
        .unwrap_or_default()
        .to_string();
    let invoke_id = request
        .metadata_value(metadata::INVOKE_ID)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let event = match kind {
        InvocationType::Generic => decode_generic(&request.payload),
        InvocationType::Http => InvocationEvent::Http(decode_http(request, &invoke_id)?),
    };

    let context = InvocationContext {
        invoke_id,
        function_name: function_name.clone(),
        metadata: request.metadata.clone(),
    };

    Ok(Invocation {
        kind,
        function_name,
        event,
        context,
    })
}

/// JSON if the payload parses, the raw bytes otherwise. Never fails.
pub fn decode_generic(payload: &[u8]) -> InvocationEvent {
    match serde_json::from_slice(payload) {
        Ok(value) => InvocationEvent::Json(value),
        Err(_) => InvocationEvent::Raw(payload.to_vec()),
    }
}

fn decode_http(request: &Message, invoke_id: &str) -> Result<HttpEvent> {
    let get = |key: &str| request.metadata_value(key).unwrap_or_default().to_string();

    let path = get(metadata::PATH);
    let http_method = get(metadata::HTTP_METHOD);

    let declared_base64 = match request.metadata_value(metadata::IS_BASE64_ENCODED) {
        None | Some("") => false,
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            FaasError::MalformedRequest(format!("{} must be true or false, got {raw:?}", metadata::IS_BASE64_ENCODED))
        })?,
    };

    let (body, is_base64_encoded) = match String::from_utf8(request.payload.clone()) {
        Ok(text) => (text, declared_base64),
        Err(_) if declared_base64 => {
            return Err(FaasError::MalformedRequest(
                "body declared base64 but is not text".to_string(),
            ))
        }
        Err(_) => (BASE64.encode(&request.payload), true),
    };

    Ok(HttpEvent {
        resource: path.clone(),
        path_parameters: BTreeMap::new(),
        query_string_parameters: parse_query(&get(metadata::QUERY_STRING_PARAMETERS)),
        headers: decode_headers(&get(metadata::HEADERS)),
        body,
        is_base64_encoded,
        request_context: RequestContext {
            request_id: invoke_id.to_string(),
            resource_path: path.clone(),
            http_method: http_method.clone(),
            ..Default::default()
        },
        path,
        http_method,
    })
}

/// `a=1&b=x%20y` -> `{a: "1", b: "x y"}`. Repeated keys: last wins.
fn parse_query(raw: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(raw.trim_start_matches('?').as_bytes())
        .into_owned()
        .collect()
}
