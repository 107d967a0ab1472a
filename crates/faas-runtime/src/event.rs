//! Normalized invocation inputs handed to user handlers.

use faas_common::Headers;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The event argument of a handler call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InvocationEvent {
    /// Generic payload that decoded as JSON.
    Json(Value),
    /// Generic payload that is not JSON, passed through untouched.
    Raw(Vec<u8>),
    Http(HttpEvent),
}

impl InvocationEvent {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            InvocationEvent::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            InvocationEvent::Raw(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_http(&self) -> Option<&HttpEvent> {
        match self {
            InvocationEvent::Http(e) => Some(e),
            _ => None,
        }
    }
}

/// API-gateway style request reconstructed from call metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEvent {
    pub path: String,
    pub resource: String,
    pub http_method: String,
    pub path_parameters: BTreeMap<String, String>,
    pub query_string_parameters: BTreeMap<String, String>,
    pub headers: Headers,
    pub body: String,
    pub is_base64_encoded: bool,
    pub request_context: RequestContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub stage: String,
    pub request_id: String,
    pub resource_path: String,
    pub http_method: String,
    pub api_id: String,
    pub source_ip: String,
}

/// Per-call context. Created for one invocation and dropped with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub invoke_id: String,
    pub function_name: String,
    /// Request metadata, copied verbatim.
    pub metadata: HashMap<String, String>,
}

impl InvocationContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}
