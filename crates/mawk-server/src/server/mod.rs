//! Listener lifecycle.
//!
//! One listener per configured server. Every listener shares the route table
//! of the active snapshot and owns its signing key, proxy targets and TLS
//! acceptor. Shutdown stops accepting, asks open connections to finish, and
//! aborts whatever is still running after [`SHUTDOWN_TIMEOUT`].
//!
//! ## Module Structure
//!
//! - `mod.rs`: [`ListenerPlan`], [`ListenerManager`] and the accept loop
//! - `service`: per-request middleware (auth, HTTP/2 enforcement, internal endpoints)
//! - `auth`: basic authentication
//! - `tls`: acceptor construction
//! - `network`: socket setup

mod auth;
mod network;
mod service;
mod tls;

use futures::future::join_all;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub use network::create_listener;
pub use service::ServiceState;
pub use tls::create_tls_acceptor;

use crate::config::{BasicAuthConfig, ConfigError, ServerConfig};
use crate::expression::Context;
use crate::handler::{ProxyTable, ProxyTarget};
use crate::jwt::{JwtError, SigningKey};

/// Bound on how long in-flight connections may run after shutdown starts.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("server {name:?}: {source}")]
    Jwt {
        name: String,
        #[source]
        source: JwtError,
    },
    #[error("server {name:?}: tls: {error:#}")]
    Tls { name: String, error: anyhow::Error },
    #[error("server {name:?}: bind {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A listener compiled from its server block.
pub struct ListenerPlan {
    pub name: Arc<str>,
    pub host: String,
    pub addr: SocketAddr,
    pub scheme: &'static str,
    pub http2_only: bool,
    pub basic_auth: Option<BasicAuthConfig>,
    pub signing: Option<Arc<SigningKey>>,
    pub proxies: Arc<ProxyTable>,
    pub tls: Option<TlsAcceptor>,
}

impl ListenerPlan {
    /// Resolve the bind address, load the signing key and TLS material.
    ///
    /// `key_ctx` evaluates key material templates; only load-time functions
    /// are expected in it.
    pub fn from_config(config: &ServerConfig, key_ctx: &Context) -> Result<Self, ServeError> {
        let signing = config
            .jwt
            .as_ref()
            .map(|jwt| SigningKey::from_config(jwt, key_ctx))
            .transpose()
            .map_err(|source| ServeError::Jwt {
                name: config.name.clone(),
                source,
            })?
            .map(Arc::new);

        let tls = config
            .tls
            .as_ref()
            .map(|tls| create_tls_acceptor(&tls.cert_path, &tls.key_path))
            .transpose()
            .map_err(|error| ServeError::Tls {
                name: config.name.clone(),
                error,
            })?;

        let proxies: HashMap<String, ProxyTarget> = config
            .proxy
            .iter()
            .map(|p| (p.name.clone(), ProxyTarget::from(p)))
            .collect();

        Ok(Self {
            name: Arc::from(config.name.as_str()),
            host: config.host.clone(),
            addr: config.bind_addr()?,
            scheme: config.scheme(),
            http2_only: config.http2_only,
            basic_auth: config.basic_auth.clone(),
            signing,
            proxies: Arc::new(proxies),
            tls,
        })
    }
}

impl fmt::Debug for ListenerPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerPlan")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("scheme", &self.scheme)
            .field("http2_only", &self.http2_only)
            .field("basic_auth", &self.basic_auth.is_some())
            .field("signing", &self.signing)
            .field("proxies", &self.proxies.keys().collect::<Vec<_>>())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Running listeners of one snapshot.
pub struct ListenerManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    addrs: Vec<(Arc<str>, SocketAddr)>,
}

impl ListenerManager {
    /// Bind every listener, then start their accept loops.
    ///
    /// Nothing is spawned unless every bind succeeds.
    pub async fn start(states: Vec<Arc<ServiceState>>) -> Result<Self, ServeError> {
        let mut bound = Vec::with_capacity(states.len());
        for state in states {
            let plan = &state.plan;
            let listener = create_listener(plan.addr).map_err(|source| ServeError::Bind {
                name: plan.name.to_string(),
                addr: plan.addr,
                source,
            })?;
            bound.push((state, listener));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(bound.len());
        let mut addrs = Vec::with_capacity(bound.len());
        for (state, listener) in bound {
            let addr = listener.local_addr().unwrap_or(state.plan.addr);
            info!(
                server = %state.plan.name,
                %addr,
                scheme = state.plan.scheme,
                "listener started"
            );
            addrs.push((state.plan.name.clone(), addr));
            let shutdown_rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(accept_loop(listener, state, shutdown_rx)));
        }

        Ok(Self {
            shutdown_tx,
            tasks,
            addrs,
        })
    }

    /// Bound addresses by server name.
    pub fn local_addrs(&self) -> &[(Arc<str>, SocketAddr)] {
        &self.addrs
    }

    /// Signal every listener and wait until all of them have drained.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "listener task failed");
            }
        }
    }
}

impl fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerManager")
            .field("addrs", &self.addrs)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServiceState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let name = state.plan.name.clone();
    let (drain_tx, _) = broadcast::channel::<()>(1);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        let drain_rx = drain_tx.subscribe();
                        connections.spawn(serve_connection(stream, peer, state, drain_rx));
                    }
                    Err(e) => {
                        error!(server = %name, error = %e, "accept error");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.recv() => {
                info!(server = %name, "listener shutting down");
                break;
            }
        }
    }

    drop(listener);
    let _ = drain_tx.send(());
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            server = %name,
            open = connections.len(),
            "graceful shutdown timed out, closing connections"
        );
        connections.abort_all();
    }
    info!(server = %name, "listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServiceState>,
    drain_rx: broadcast::Receiver<()>,
) {
    match state.plan.tls.clone() {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => drive(tls, peer, state, drain_rx).await,
            Err(e) => debug!(%peer, error = %e, "tls handshake failed"),
        },
        None => drive(stream, peer, state, drain_rx).await,
    }
}

async fn drive<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<ServiceState>,
    mut drain_rx: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| service::handle(req, Arc::clone(&state)));
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "connection error");
                }
                break;
            }
            _ = drain_rx.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
