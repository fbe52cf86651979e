//! XMPP server implementation.
//!
//! Accepts client-to-server connections on an already bound listener and
//! runs one [`ConnectionActor`] task per connection, all sharing a single
//! routing actor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::connection::ConnectionActor;
use crate::parser::DEFAULT_MAX_STANZA_SIZE;
use crate::router::{Router, DEFAULT_ROUTER_CAPACITY};
use crate::stream::WireTap;
use crate::XmppError;

/// Default per-connection outbound queue depth.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Default deadline for completing stream negotiation.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// XMPP server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Address to bind for C2S connections (default: 0.0.0.0:5222)
    pub c2s_addr: SocketAddr,
    /// Domain in stream headers and bound identifiers (default: localhost)
    pub domain: String,
    /// TLS certificate path (PEM format)
    pub tls_cert_path: PathBuf,
    /// TLS private key path (PEM format)
    pub tls_key_path: PathBuf,
    /// Routing actor inbox depth
    pub router_capacity: usize,
    /// Per-connection outbound queue depth
    pub outbound_capacity: usize,
    /// Deadline for header-to-bind negotiation; `None` waits forever
    pub negotiation_timeout: Option<Duration>,
    /// Largest top-level element accepted from a client, in bytes
    pub max_stanza_size: usize,
    /// Mirror encrypted output to stdout
    pub wire_log: bool,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            domain: "localhost".to_string(),
            tls_cert_path: PathBuf::from("server.crt"),
            tls_key_path: PathBuf::from("server.key"),
            router_capacity: DEFAULT_ROUTER_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            wire_log: false,
        }
    }
}

/// XMPP server instance.
pub struct XmppServer {
    config: Arc<XmppServerConfig>,
    tls_acceptor: TlsAcceptor,
    listener: TcpListener,
    router: Router,
    router_task: JoinHandle<()>,
    wire_tap: Option<WireTap>,
    shutdown: CancellationToken,
}

impl XmppServer {
    /// Create a server around a bound listener and spawn its routing actor.
    pub fn new(
        config: XmppServerConfig,
        tls_acceptor: TlsAcceptor,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Self {
        let (router, router_task) = Router::spawn(config.router_capacity);
        let wire_tap = config.wire_log.then(WireTap::stdout);
        Self {
            config: Arc::new(config),
            tls_acceptor,
            listener,
            router,
            router_task,
            wire_tap,
            shutdown,
        }
    }

    /// Handle to the routing actor.
    ///
    /// Clones keep the actor alive; drop them before awaiting [`run`](Self::run)
    /// to completion after shutdown.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Local address of the listener.
    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown token is cancelled, then wait
    /// for every connection task and the routing actor to finish.
    pub async fn run(self) -> Result<(), XmppError> {
        let Self {
            config,
            tls_acceptor,
            listener,
            router,
            router_task,
            wire_tap,
            shutdown,
        } = self;

        let addr = listener.local_addr()?;
        info!(addr = %addr, domain = %config.domain, "XMPP C2S server listening");

        let mut connections = JoinSet::new();

        loop {
            let (stream, peer_addr) = tokio::select! {
                // Reap finished connection tasks as we go.
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept C2S connection");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let tls_acceptor = tls_acceptor.clone();
            let router = router.clone();
            let config = Arc::clone(&config);
            let wire_tap = wire_tap.clone();
            let shutdown = shutdown.clone();

            connections.spawn(
                async move {
                    if let Err(e) = ConnectionActor::handle_connection(
                        stream,
                        peer_addr,
                        tls_acceptor,
                        router,
                        config,
                        wire_tap,
                        shutdown,
                    )
                    .await
                    {
                        warn!(error = %e, "Connection error");
                    }
                }
                .instrument(info_span!(
                    "xmpp.connection.lifecycle",
                    client_ip = %peer_addr,
                    transport = "tcp+starttls",
                    conn_id = tracing::field::Empty,
                    jid = tracing::field::Empty,
                )),
            );
        }

        info!("Shutdown requested, closing listener");
        drop(listener);

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Connection task panicked");
            }
        }

        // Last handle: the routing actor drains and stops.
        drop(router);
        router_task
            .await
            .map_err(|e| XmppError::internal(format!("Routing actor task failed: {}", e)))?;

        info!("XMPP server stopped");
        Ok(())
    }
}
