//! Messages and service glue for the `faas.Function` gRPC service.
//!
//! Request and response share one message type: a `type` discriminator, a
//! flat string metadata map and an opaque payload.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(map = "string, string", tag = "2")]
    pub metadata: HashMap<String, String>,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            r#type: kind.into(),
            metadata: HashMap::new(),
            payload: payload.into(),
        }
    }

    /// Builder-style metadata setter, mostly useful for callers and tests.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

// Generated by build.rs: `function_client` and `function_server` modules.
include!(concat!(env!("OUT_DIR"), "/faas.Function.rs"));
