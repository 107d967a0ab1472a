//! gRPC surface: `faas.Function/Call` backed by the dispatcher.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use faas_common::{Function, FunctionServer, Message};
use std::path::Path;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FunctionService {
    dispatcher: Dispatcher,
}

impl FunctionService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Wraps the service with the configured message size limits.
    pub fn into_server(self, max_message_size: usize) -> FunctionServer<Self> {
        FunctionServer::new(self)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size)
    }
}

#[tonic::async_trait]
impl Function for FunctionService {
    async fn call(&self, request: Request<Message>) -> std::result::Result<Response<Message>, Status> {
        let message = request.into_inner();
        let response = self.dispatcher.dispatch(message).await?;
        Ok(Response::new(response))
    }
}

/// Mutual TLS when `ca`, `cert` and `key` are all set and readable.
/// Anything less falls back to plaintext.
pub fn tls_config(server: &ServerConfig) -> Option<ServerTlsConfig> {
    let (Some(ca), Some(cert), Some(key)) = (&server.ca, &server.cert, &server.key) else {
        if server.ca.is_some() || server.cert.is_some() || server.key.is_some() {
            warn!("Partial TLS configuration (ca, cert and key are all required), serving plaintext");
        } else {
            info!("No TLS configuration, serving plaintext");
        }
        return None;
    };

    let (ca_pem, cert_pem, key_pem) = match (read_pem(ca), read_pem(cert), read_pem(key)) {
        (Ok(ca), Ok(cert), Ok(key)) => (ca, cert, key),
        (ca_res, cert_res, key_res) => {
            let unreadable = [ca_res.err(), cert_res.err(), key_res.err()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("; ");
            warn!(%unreadable, "TLS files unreadable, serving plaintext");
            return None;
        }
    };

    info!(ca = %ca.display(), cert = %cert.display(), "Serving with mutual TLS");
    Some(
        ServerTlsConfig::new()
            .identity(Identity::from_pem(cert_pem, key_pem))
            .client_ca_root(Certificate::from_pem(ca_pem)),
    )
}

fn read_pem(path: &Path) -> std::result::Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))
}
