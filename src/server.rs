//! Listener setup and lifecycle for the CSI gRPC endpoint.
//!
//! The plugin listens either on a unix domain socket (`unix:///path`) or on a
//! TCP address (`tcp://host:port`). Readiness flips on once both services are
//! registered and the listener is bound, and the server drains on SIGINT or
//! SIGTERM.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::transport::server::Router;
use tracing::{info, warn};

use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::driver::{ControllerService, IdentityService, ReadinessFlag};

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

/// Errors raised while binding or serving the gRPC endpoint.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The endpoint string could not be understood.
    #[error("invalid CSI endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint {
        /// Endpoint as configured.
        endpoint: String,
        /// Reason the endpoint was rejected.
        reason: String,
    },
    /// Binding the listener failed.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        /// Endpoint being bound.
        endpoint: String,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The transport failed while serving.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Parsed listen address for the gRPC endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ListenEndpoint {
    /// Unix domain socket at the given path.
    Unix(Utf8PathBuf),
    /// TCP socket address.
    Tcp(SocketAddr),
}

impl FromStr for ListenEndpoint {
    type Err = ServeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ServeError::InvalidEndpoint {
            endpoint: value.to_owned(),
            reason: reason.to_owned(),
        };
        let trimmed = value.trim();
        if let Some(path) = trimmed.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(invalid("unix endpoint requires a socket path"));
            }
            let socket = Utf8PathBuf::from(path);
            if socket.is_relative() {
                return Err(invalid("unix socket path must be absolute"));
            }
            return Ok(Self::Unix(socket));
        }
        if let Some(address) = trimmed.strip_prefix(TCP_SCHEME) {
            return address
                .parse::<SocketAddr>()
                .map(Self::Tcp)
                .map_err(|err| invalid(&err.to_string()));
        }
        Err(invalid("expected a unix:// or tcp:// scheme"))
    }
}

/// gRPC server hosting the Controller and Identity services.
pub struct PluginServer {
    controller: ControllerService,
    identity: IdentityService,
    readiness: ReadinessFlag,
}

impl PluginServer {
    /// Builds the server; the Identity service reports `readiness`.
    #[must_use]
    pub fn new(controller: ControllerService, readiness: ReadinessFlag) -> Self {
        Self {
            controller,
            identity: IdentityService::new(readiness.clone()),
            readiness,
        }
    }

    /// Serves on `endpoint` until SIGINT or SIGTERM arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError`] when binding or the transport fails.
    pub async fn serve(self, endpoint: &ListenEndpoint) -> Result<(), ServeError> {
        self.serve_with_shutdown(endpoint, shutdown_signal()).await
    }

    /// Serves on `endpoint` until `signal` resolves.
    ///
    /// A stale unix socket left by a previous process is removed before
    /// binding and the socket file is removed again on shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError`] when binding or the transport fails.
    pub async fn serve_with_shutdown<F>(
        self,
        endpoint: &ListenEndpoint,
        signal: F,
    ) -> Result<(), ServeError>
    where
        F: Future<Output = ()>,
    {
        match endpoint {
            ListenEndpoint::Tcp(address) => {
                let listener = TcpListener::bind(address).await.map_err(|source| {
                    ServeError::Bind {
                        endpoint: address.to_string(),
                        source,
                    }
                })?;
                self.serve_tcp(listener, signal).await
            }
            ListenEndpoint::Unix(path) => {
                let listener = bind_unix(path).await?;
                info!(endpoint = %path, "serving CSI on unix socket");
                let router = self.router();
                let outcome = router
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal)
                    .await;
                remove_socket(path).await;
                outcome.map_err(ServeError::from)
            }
        }
    }

    /// Serves on an already bound TCP listener until `signal` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Transport`] when the transport fails.
    pub async fn serve_tcp<F>(self, listener: TcpListener, signal: F) -> Result<(), ServeError>
    where
        F: Future<Output = ()>,
    {
        match listener.local_addr() {
            Ok(address) => info!(endpoint = %address, "serving CSI on tcp"),
            Err(err) => warn!(error = %err, "tcp listener has no local address"),
        }
        let router = self.router();
        router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(ServeError::from)
    }

    fn router(self) -> Router {
        let router = Server::builder()
            .add_service(ControllerServer::new(self.controller))
            .add_service(IdentityServer::new(self.identity));
        self.readiness.set_ready();
        router
    }
}

async fn bind_unix(path: &Utf8Path) -> Result<UnixListener, ServeError> {
    let bind_error = |source| ServeError::Bind {
        endpoint: format!("{UNIX_SCHEME}{path}"),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(bind_error)?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(endpoint = %path, "removed stale socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(bind_error(err)),
    }
    UnixListener::bind(path).map_err(bind_error)
}

async fn remove_socket(path: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(endpoint = %path, error = %err, "failed to remove socket");
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "SIGINT handler failed");
            }
        }
        () = terminate => {}
    }
    info!("shutdown signal received");
}
