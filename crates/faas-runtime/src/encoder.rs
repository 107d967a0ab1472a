//! Response encoding: handler outcome -> wire message.
//!
//! Generic mode echoes the request envelope with the new payload and reports
//! failures as call-level errors. HTTP mode always produces a message: shape
//! violations in the handler's response degrade to a `502` response.

use crate::handler::{HttpResponse, Output};
use faas_common::{
    encode_headers, metadata, try_encode_headers, FaasError, Headers, InvocationType, Message,
    Result,
};
use serde_json::{json, Map, Value};
use tracing::error;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";

const NO_ROUTE: &str = "no route";
const FUNCTION_RESPONSE_ERROR: &str = "function response error";

// --- Generic mode ---

pub fn encode_generic(request: &Message, output: Output) -> Result<Message> {
    let payload = match output {
        Output::Empty => Vec::new(),
        Output::Bytes(bytes) => bytes,
        Output::Json(json) => {
            let value = json
                .to_value()
                .map_err(|e| FaasError::UserCodeReturn(e.to_string()))?;
            match value {
                Value::String(s) if s.is_empty() => Vec::new(),
                value => serde_json::to_vec(&value)
                    .map_err(|e| FaasError::UserCodeReturn(e.to_string()))?,
            }
        }
        Output::Http(response) => serde_json::to_vec(&response)
            .map_err(|e| FaasError::UserCodeReturn(e.to_string()))?,
    };

    Ok(Message {
        r#type: request.r#type.clone(),
        metadata: request.metadata.clone(),
        payload,
    })
}

// --- HTTP mode ---

/// Encodes an HTTP-mode outcome. Never fails.
pub fn encode_http(outcome: Result<Output>) -> Message {
    let output = match outcome {
        Ok(output) => output,
        Err(err) => return http_error(&err),
    };

    match response_from_output(output).and_then(encode_http_response) {
        Ok(msg) => msg,
        Err(reason) => {
            error!(%reason, "Function response error");
            http_error(&FaasError::UserCodeReturn(reason))
        }
    }
}

/// Structured error response: `{"errorCode": "<status>", "message": "..."}`.
pub fn http_error(err: &FaasError) -> Message {
    let status = err.http_status();
    let message = match err {
        FaasError::NotFound(_) => NO_ROUTE.to_string(),
        FaasError::UserCodeInvoke(text) => text.clone(),
        FaasError::UserCodeReturn(_) => FUNCTION_RESPONSE_ERROR.to_string(),
        other => other.to_string(),
    };
    let body = json!({ "errorCode": status.to_string(), "message": message });

    let mut msg = Message::new(InvocationType::Http.as_str(), body.to_string().into_bytes());
    msg.metadata
        .insert(metadata::STATUS_CODE.to_string(), status.to_string());
    msg.metadata.insert(
        metadata::HEADERS.to_string(),
        encode_headers(&Headers::new().with(CONTENT_TYPE, APPLICATION_JSON)),
    );
    msg
}

/// Fails when the headers cannot travel in the delimited wire form.
pub fn encode_http_response(response: HttpResponse) -> std::result::Result<Message, String> {
    let mut headers = response.headers.unwrap_or_default();
    if let Some(body) = &response.body {
        if !headers.contains_ignore_case(CONTENT_TYPE) {
            let derived = if serde_json::from_str::<Value>(body).is_ok() {
                APPLICATION_JSON
            } else {
                TEXT_PLAIN
            };
            headers.insert(CONTENT_TYPE, derived);
        }
    }

    let payload = response.body.unwrap_or_default().into_bytes();
    let mut msg = Message::new(InvocationType::Http.as_str(), payload);
    msg.metadata.insert(
        metadata::STATUS_CODE.to_string(),
        response.status_code.to_string(),
    );
    if !headers.is_empty() {
        let wire = try_encode_headers(&headers)
            .ok_or("header key or value overlaps a header separator token")?;
        msg.metadata.insert(metadata::HEADERS.to_string(), wire);
    }
    if let Some(encoded) = response.is_base64_encoded {
        msg.metadata
            .insert(metadata::IS_BASE64_ENCODED.to_string(), encoded.to_string());
    }
    Ok(msg)
}

/// Turns whatever the handler returned into a validated [`HttpResponse`].
/// The error is the reason logged for the resulting `502`.
pub fn response_from_output(output: Output) -> std::result::Result<HttpResponse, String> {
    match output {
        Output::Http(response) => Ok(response),
        Output::Json(json) => {
            let value = json
                .to_value()
                .map_err(|e| format!("response is not serializable: {e}"))?;
            response_from_value(value)
        }
        Output::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => response_from_value(Value::String(text)),
            Err(_) => Err("response is not object or string".to_string()),
        },
        Output::Empty => Err("response is not object or string".to_string()),
    }
}

/// Validates an untyped response. Strings are parsed as JSON first; `null`
/// fields count as absent.
pub fn response_from_value(value: Value) -> std::result::Result<HttpResponse, String> {
    let value = match value {
        Value::String(text) => serde_json::from_str(&text)
            .map_err(|e| format!("response string is not JSON: {e}"))?,
        other => other,
    };
    let Value::Object(mut fields) = value else {
        return Err("response is not object or string".to_string());
    };

    let status_code = match take(&mut fields, "statusCode") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|code| u16::try_from(code).ok())
            .ok_or_else(|| format!("statusCode {n} is not a valid status code"))?,
        Some(_) => return Err("statusCode is not a number".to_string()),
        None => return Err("missing statusCode".to_string()),
    };

    let headers = match take(&mut fields, "headers") {
        None => None,
        Some(Value::Object(map)) => Some(headers_from_map(map)?),
        Some(_) => return Err("headers is not an object".to_string()),
    };

    let is_base64_encoded = match take(&mut fields, "isBase64Encoded") {
        None => None,
        Some(Value::Bool(flag)) => Some(flag),
        Some(_) => return Err("isBase64Encoded is not bool".to_string()),
    };

    let body = match take(&mut fields, "body") {
        None => None,
        Some(Value::String(body)) => Some(body),
        Some(_) => return Err("body is not str".to_string()),
    };

    Ok(HttpResponse {
        status_code,
        headers,
        body,
        is_base64_encoded,
    })
}

fn take(fields: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match fields.remove(key) {
        Some(Value::Null) | None => None,
        Some(value) => Some(value),
    }
}

fn headers_from_map(map: Map<String, Value>) -> std::result::Result<Headers, String> {
    let mut headers = Headers::new();
    for (key, value) in map {
        match value {
            Value::String(v) => headers.insert(key, v),
            _ => return Err(format!("value of header {key:?} is not str")),
        }
    }
    Ok(headers)
}
