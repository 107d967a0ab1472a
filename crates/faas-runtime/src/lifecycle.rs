//! Startup and shutdown of the sidecar.
//!
//! Shutdown sequence: stop accepting connections, give in-flight calls up to
//! `server.timeout` to finish, then abort whatever is still running and drop
//! the server if it does not wind down within [`ABORT_DRAIN`].

use crate::config::RuntimeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, RuntimeError};
use crate::handler::HandlerCatalog;
use crate::registry::Registry;
use crate::service::{tls_config, FunctionService};
use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tracing::{info, warn};

/// How long aborted calls get to flush their error responses.
pub const ABORT_DRAIN: Duration = Duration::from_secs(1);

pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    abort: CancellationToken,
}

impl Runtime {
    /// Resolves every configured function. Fails on the first invalid entry.
    pub fn load(config: RuntimeConfig, catalog: &HandlerCatalog) -> Result<Self> {
        let entries = config.function_entries()?;
        let registry = Registry::load(&entries, &config.code_path, catalog)?;

        if registry.is_empty() {
            warn!("No functions registered, every call will be answered with NotFound");
        }
        info!(
            name = %config.name,
            functions = registry.len(),
            code_path = %config.code_path.display(),
            "Runtime loaded"
        );

        Ok(Self {
            config,
            registry: Arc::new(registry),
            abort: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::with_abort(Arc::clone(&self.registry), self.abort.clone())
    }

    /// Binds `server.address` and serves until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.server.address)
            .await
            .map_err(|e| {
                RuntimeError::config(format!(
                    "cannot listen on {}: {e}",
                    self.config.server.address
                ))
            })?;
        info!(address = %listener.local_addr()?, "Listening");

        self.serve_with_incoming(TcpListenerStream::new(listener), shutdown)
            .await
    }

    /// Serves connections from `incoming` until `shutdown` resolves, then runs
    /// the shutdown sequence.
    pub async fn serve_with_incoming<I, IO, IE, F>(self, incoming: I, shutdown: F) -> Result<()>
    where
        I: Stream<Item = std::result::Result<IO, IE>> + Send + 'static,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IO::ConnectInfo: Clone + Send + Sync + 'static,
        IE: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let server_config = &self.config.server;

        let mut builder = Server::builder();
        if let Some(tls) = tls_config(server_config) {
            builder = builder.tls_config(tls)?;
        }
        let service = FunctionService::new(self.dispatcher())
            .into_server(server_config.max_message_size());

        let stop_accepting = CancellationToken::new();
        let stop = stop_accepting.clone();
        let mut server = tokio::spawn(
            builder
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async move { stop.cancelled().await }),
        );
        info!(name = %self.config.name, "Serving faas.Function/Call");

        tokio::select! {
            joined = &mut server => {
                warn!("Server stopped before shutdown was requested");
                return join_result(joined);
            }
            _ = shutdown => {}
        }

        info!("Shutdown requested, no longer accepting connections");
        stop_accepting.cancel();

        match server_config.timeout {
            Some(grace) => match tokio::time::timeout(grace, &mut server).await {
                Ok(joined) => {
                    info!("In-flight calls finished, server stopped");
                    return join_result(joined);
                }
                Err(_) => {
                    warn!(grace = ?grace, "Grace period elapsed, aborting in-flight calls")
                }
            },
            None => info!("No shutdown grace configured, aborting in-flight calls"),
        }

        self.abort.cancel();
        match tokio::time::timeout(ABORT_DRAIN, &mut server).await {
            Ok(joined) => {
                info!("Server stopped");
                join_result(joined)
            }
            Err(_) => {
                warn!("Server still busy after abort, dropping it");
                server.abort();
                Ok(())
            }
        }
    }
}

fn join_result(
    joined: std::result::Result<std::result::Result<(), tonic::transport::Error>, JoinError>,
) -> Result<()> {
    match joined {
        Ok(served) => served.map_err(RuntimeError::from),
        Err(err) => Err(RuntimeError::ServerTask(err.to_string())),
    }
}
