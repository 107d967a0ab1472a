use thiserror::Error;

pub use faas_common::FaasError;

// --- Startup / serving errors ---
// Call-level failures use `FaasError`; everything here is fatal to the process.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config Parse Error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Transport Error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Server task failed: {0}")]
    ServerTask(String),
}

impl RuntimeError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RuntimeError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
