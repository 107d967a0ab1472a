// Wire contract shared by the function runtime and whoever calls it.

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod headers;
pub mod proto;

pub use headers::{
    decode_headers, encode_headers, try_encode_headers, Headers, HEADER_DELIM, HEADER_EQUALS,
};
pub use proto::function_client::FunctionClient;
pub use proto::function_server::{Function, FunctionServer};
pub use proto::Message;

/// Metadata keys understood on the `faas.Function/Call` channel.
pub mod metadata {
    pub const FUNCTION_NAME: &str = "functionName";
    pub const INVOKE_ID: &str = "invokeId";
    pub const PATH: &str = "path";
    pub const HTTP_METHOD: &str = "httpMethod";
    pub const QUERY_STRING_PARAMETERS: &str = "queryStringParameters";
    pub const HEADERS: &str = "headers";
    pub const IS_BASE64_ENCODED: &str = "isBase64Encoded";
    pub const STATUS_CODE: &str = "statusCode";
}

// --- Call-level error taxonomy ---
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaasError {
    #[error("Unsupported invocation type: {0}")]
    UnsupportedType(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Function not found: {0}")]
    NotFound(String),

    #[error("[UserCodeInvoke]: {0}")]
    UserCodeInvoke(String),

    #[error("[UserCodeReturn]: {0}")]
    UserCodeReturn(String),

    #[error("Invocation aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, FaasError>;

impl FaasError {
    /// Status code used when the failure is reported as an HTTP-flavored response.
    pub fn http_status(&self) -> u16 {
        match self {
            FaasError::UnsupportedType(_) | FaasError::MalformedRequest(_) => 400,
            FaasError::NotFound(_) => 404,
            FaasError::UserCodeInvoke(_) => 500,
            FaasError::UserCodeReturn(_) => 502,
            FaasError::Aborted(_) => 503,
        }
    }
}

impl From<FaasError> for tonic::Status {
    fn from(err: FaasError) -> Self {
        let message = err.to_string();
        match err {
            FaasError::UnsupportedType(_) | FaasError::MalformedRequest(_) => {
                tonic::Status::invalid_argument(message)
            }
            FaasError::NotFound(_) => tonic::Status::not_found(message),
            FaasError::UserCodeInvoke(_) => tonic::Status::unknown(message),
            FaasError::UserCodeReturn(_) => tonic::Status::internal(message),
            FaasError::Aborted(_) => tonic::Status::aborted(message),
        }
    }
}

/// Invocation flavor selected by the message `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationType {
    Generic,
    Http,
}

impl InvocationType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "" | "GENERIC" => Ok(InvocationType::Generic),
            "HTTP" => Ok(InvocationType::Http),
            other => Err(FaasError::UnsupportedType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationType::Generic => "GENERIC",
            InvocationType::Http => "HTTP",
        }
    }
}

impl std::fmt::Display for InvocationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
