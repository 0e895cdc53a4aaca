//! Connection lifecycle controller
//!
//! Owns the listening socket and every connection accepted on it:
//!
//! ```text
//! accept
//!   → admission gate (one permit per live connection)
//!   → security hooks (IP filter, rate limiter; 403/429 and close)
//!   → acceptor (plain or TLS, ALPN)
//!   → protocol choice (ALPN, else prior-knowledge sniff)
//!   → HTTP/1.1 or HTTP/2 driver
//! ```
//!
//! Shutdown is two-phase. Draining stops the accept loop and tells drivers
//! to finish what they have; after the grace period the remaining
//! connections are terminated.

use crate::app::Application;
use crate::config::{validate_config, ConfigError, ServerConfig, TimeoutConfig};
use crate::http::session::sniff_protocol;
use crate::http::{
    self, h2, Acceptor, ConnectionInfo, HttpResponse, PlainAcceptor, Protocol, Status, TlsConfig,
    TlsError,
};
use crate::lifecycle::{AdmissionGate, AdmissionPermit, Shutdown, ShutdownSignal};
use crate::observability::{self, ConnectionGauge};
use crate::security::ip_filter::ParseIpNetError;
use crate::security::{SecurityHooks, Verdict};
use crate::service::Service;
use crate::streamer::WorkerPool;
use bytes::BytesMut;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

/// Pause after a failed accept(2), e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Result type for server setup and run
pub type Result<T> = std::result::Result<T, ServerError>;

/// Why the server could not start
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Security(#[from] ParseIpNetError),

    #[error("invalid HTTP/2 settings: {0}")]
    Http2(#[from] h2::Error),
}

/// Assembles a [`Server`] from configuration and an application
pub struct ServerBuilder {
    config: ServerConfig,
    app: Arc<dyn Application>,
    acceptor: Option<Arc<dyn Acceptor>>,
    hooks: Option<SecurityHooks>,
    shutdown: Option<Shutdown>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig, app: impl Application) -> Self {
        ServerBuilder {
            config,
            app: Arc::new(app),
            acceptor: None,
            hooks: None,
            shutdown: None,
        }
    }

    /// Use a custom transport instead of the one `config.tls` selects
    pub fn acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Replace the hooks built from `config.security`
    pub fn security(mut self, hooks: SecurityHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Share an existing shutdown controller
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Validate the configuration and bind the listener
    ///
    /// Must be called inside a tokio runtime.
    pub async fn bind(self) -> Result<Server> {
        let config = self.config;
        validate_config(&config).map_err(ConfigError::Validation)?;

        let bind_error = |source: io::Error| ServerError::Bind {
            addr: config.listener.bind_address.clone(),
            source,
        };
        let addr: SocketAddr = config
            .listener
            .bind_address
            .parse()
            .map_err(|e| bind_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let listener =
            bind_listener(addr, config.listener.backlog, config.listener.reuse_port).map_err(bind_error)?;

        let hooks = match self.hooks {
            Some(hooks) => hooks,
            None => SecurityHooks::from_config(&config.security)?,
        };

        let acceptor: Arc<dyn Acceptor> = match (self.acceptor, &config.tls) {
            (Some(acceptor), _) => acceptor,
            (None, Some(tls)) => {
                let mut builder = TlsConfig::server()
                    .http2(config.http2.enabled)
                    .handshake_timeout(config.timeouts.tls_handshake());
                if let Some(cert) = &tls.cert_path {
                    builder = builder.cert_file(cert)?;
                }
                if let Some(key) = &tls.key_path {
                    builder = builder.key_file(key)?;
                }
                Arc::new(builder.build()?)
            }
            (None, None) => Arc::new(PlainAcceptor),
        };

        let h2_settings = if config.http2.enabled {
            Some(config.http2.settings()?)
        } else {
            None
        };
        let prometheus = if config.observability.prometheus {
            observability::prometheus_handle()
        } else {
            None
        };

        let workers = WorkerPool::new(config.workers.pool_size, config.workers.channel_capacity);
        let service = Service::new(self.app, workers)
            .with_limits(config.limits.clone())
            .with_timeouts(config.timeouts.clone())
            .with_http2(h2_settings)
            .with_cors(hooks.cors.clone())
            .with_endpoints(&config.observability, prometheus);

        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(
            address = %local_addr,
            tls = config.tls.is_some(),
            http2 = config.http2.enabled,
            workers = config.workers.pool_size,
            max_connections = config.listener.max_connections,
            "listener bound"
        );

        Ok(Server {
            listener,
            gate: AdmissionGate::new(config.listener.max_connections),
            context: Arc::new(ConnectionContext {
                acceptor,
                service: Arc::new(service),
                sniff_h2: config.http2.enabled && config.http2.prior_knowledge,
                timeouts: config.timeouts,
            }),
            hooks,
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}

/// Shared by every connection task
struct ConnectionContext {
    acceptor: Arc<dyn Acceptor>,
    service: Arc<Service>,
    sniff_h2: bool,
    timeouts: TimeoutConfig,
}

/// A bound server, ready to run
pub struct Server {
    listener: TcpListener,
    gate: AdmissionGate,
    context: Arc<ConnectionContext>,
    hooks: SecurityHooks,
    shutdown: Shutdown,
}

impl Server {
    pub fn builder(config: ServerConfig, app: impl Application) -> ServerBuilder {
        ServerBuilder::new(config, app)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for starting a graceful shutdown
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown, then drain
    ///
    /// Returns once every connection has finished or been terminated.
    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            gate,
            context,
            hooks,
            shutdown,
        } = self;
        let mut signal = shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            let Some(permit) = gate.acquire(&signal).await else {
                break;
            };

            let accepted = tokio::select! {
                biased;
                _ = signal.draining() => break,
                accepted = listener.accept() => accepted,
            };

            while let Some(joined) = connections.try_join_next() {
                log_join(joined);
            }

            match accepted {
                Ok((stream, peer)) => {
                    admit(stream, peer, permit, &hooks, &context, &signal, &mut connections);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    drop(permit);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        drain(connections, &shutdown, context.timeouts.shutdown_grace()).await;
        Ok(())
    }
}

/// Run the admission checks and start the connection task
fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    permit: AdmissionPermit,
    hooks: &SecurityHooks,
    context: &Arc<ConnectionContext>,
    signal: &ShutdownSignal,
    connections: &mut JoinSet<()>,
) {
    let verdict = hooks.check(peer.ip());
    if verdict != Verdict::Allow {
        observability::record_rejection(verdict.as_str());
        debug!(peer = %peer, reason = verdict.as_str(), "connection rejected");

        let status = match verdict {
            Verdict::Forbidden => Status::FORBIDDEN,
            _ => Status::TOO_MANY_REQUESTS,
        };
        let context = context.clone();
        // The answer still occupies a connection slot until it is written.
        connections.spawn(async move {
            let _permit = permit;
            reject(stream, status, context).await;
        });
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "TCP_NODELAY not set");
    }

    let context = context.clone();
    let signal = signal.clone();
    connections.spawn(async move {
        let _permit = permit;
        let _gauge = ConnectionGauge::open();
        handle_connection(stream, peer, context, signal).await;
    });
}

/// Answer a refused connection with a terminal status and close it
async fn reject(stream: TcpStream, status: Status, context: Arc<ConnectionContext>) {
    let response = HttpResponse::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Connection", "close")
        .body(status.reason_phrase())
        .build();

    let write = async {
        let mut accepted = context.acceptor.wrap(stream).await?;
        accepted.session.write_all(&response.to_wire(true)).await?;
        accepted.session.shutdown().await
    };
    match tokio::time::timeout(context.timeouts.write(), write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "rejection not delivered"),
        Err(_) => debug!("rejection timed out"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    signal: ShutdownSignal,
) {
    let accepted = match context.acceptor.wrap(stream).await {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!(peer = %peer, error = %e, "transport setup failed");
            return;
        }
    };

    let info = ConnectionInfo::new(peer, accepted.secure);
    let mut session = accepted.session;
    let mut prelude = BytesMut::new();

    let protocol = match accepted.alpn {
        Some(protocol) => protocol,
        None if context.sniff_h2 => {
            let sniff = sniff_protocol(&mut session, &mut prelude);
            match tokio::time::timeout(context.timeouts.keep_alive(), sniff).await {
                Ok(Ok(protocol)) => protocol,
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "connection failed before first request");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "connection idle before first request");
                    return;
                }
            }
        }
        None => Protocol::Http1,
    };

    let span = info_span!(
        "connection",
        conn_id = %info.id,
        peer = %peer,
        protocol = %protocol,
        secure = info.secure,
    );

    async move {
        debug!("connection opened");
        let service = context.service.clone();
        let result = match protocol {
            Protocol::Http1 => http::server::serve(session, prelude, info, service, signal)
                .await
                .map_err(|e| e.to_string()),
            Protocol::Http2 => h2::serve(session, prelude, info, service, signal)
                .await
                .map_err(|e| e.to_string()),
        };
        match result {
            Ok(()) => debug!("connection closed"),
            Err(error) => debug!(%error, "connection closed with error"),
        }
    }
    .instrument(span)
    .await
}

/// Wait out the grace period, then terminate what is left
async fn drain(mut connections: JoinSet<()>, shutdown: &Shutdown, grace: Duration) {
    shutdown.drain();
    info!(
        active = connections.len(),
        grace_ms = grace.as_millis() as u64,
        "draining connections"
    );

    let finished = tokio::time::timeout(grace, async {
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }
    })
    .await
    .is_ok();

    if !finished {
        warn!(remaining = connections.len(), "grace period expired, terminating connections");
        shutdown.terminate();
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    shutdown.terminate();
    info!("server stopped");
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!(error = %e, "connection task panicked");
        }
    }
}

/// Create the listening socket
///
/// `SO_REUSEPORT` lets several processes share one port.
fn bind_listener(addr: SocketAddr, backlog: u32, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    set_reuse_port(&socket, reuse_port)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    TcpListener::from_std(socket.into())
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket, enabled: bool) -> io::Result<()> {
    if enabled {
        socket.set_reuse_port(true)?;
    }
    Ok(())
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket, enabled: bool) -> io::Result<()> {
    if enabled {
        warn!("SO_REUSEPORT is not supported on this platform");
    }
    Ok(())
}
