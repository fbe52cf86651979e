//! Connection handler for individual XMPP client connections.
//!
//! One task per accepted transport. It negotiates, registers the bound
//! identifier with the routing actor, then multiplexes two sources until
//! the stream ends: frames read from the client, and stanzas the router
//! queued for this client.

use std::net::SocketAddr;
use std::sync::Arc;

use jid::FullJid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::generate_stream_error;
use crate::metrics;
use crate::negotiation::Negotiator;
use crate::parser::{Frame, TopLevel};
use crate::registry::{ConnectionId, Outbound};
use crate::router::Router;
use crate::server::XmppServerConfig;
use crate::stanza::{
    decode_iq, decode_message, decode_presence, is_request, service_unavailable, Stanza,
};
use crate::stream::{WireTap, XmppStream};
use crate::types::Direction;
use crate::XmppError;

/// Actor owning one client connection.
pub struct ConnectionActor<T> {
    /// Transport identity
    id: ConnectionId,
    /// Client stream
    stream: XmppStream<T>,
    /// Routing actor handle
    router: Router,
    /// Server configuration
    config: Arc<XmppServerConfig>,
    /// Whether the router accepted our registration
    registered: bool,
    /// Server-wide shutdown signal
    shutdown: CancellationToken,
}

impl<T> ConnectionActor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Handle a new incoming connection until it closes.
    ///
    /// Expects to run inside the `xmpp.connection.lifecycle` span, whose
    /// `conn_id` and `jid` fields are filled in here.
    pub async fn handle_connection(
        transport: T,
        peer_addr: SocketAddr,
        tls_acceptor: TlsAcceptor,
        router: Router,
        config: Arc<XmppServerConfig>,
        wire_tap: Option<WireTap>,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        let id = ConnectionId::new();
        tracing::Span::current().record("conn_id", tracing::field::display(id));
        info!(peer = %peer_addr, "New connection");

        let mut stream = XmppStream::new(transport, config.domain.clone())
            .with_max_stanza_size(config.max_stanza_size);
        if let Some(tap) = wire_tap {
            stream = stream.with_wire_tap(tap);
        }

        let mut actor = Self {
            id,
            stream,
            router,
            config,
            registered: false,
            shutdown,
        };

        let result = actor.run(&tls_acceptor).await;
        actor.finish(result).await
    }

    async fn run(&mut self, tls_acceptor: &TlsAcceptor) -> Result<(), XmppError> {
        let jid = self.negotiate(tls_acceptor).await?;
        tracing::Span::current().record("jid", tracing::field::display(&jid));

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        self.router.register(self.id, jid.clone(), outbound_tx).await?;
        self.registered = true;

        info!(jid = %jid, "Session established");

        self.process_stanzas(outbound_rx).await
    }

    /// Negotiate under the configured deadline, giving way to shutdown.
    async fn negotiate(&mut self, tls_acceptor: &TlsAcceptor) -> Result<FullJid, XmppError> {
        let deadline = self.config.negotiation_timeout;
        let shutdown = self.shutdown.clone();
        let mut negotiator = Negotiator::new(&mut self.stream, tls_acceptor);

        let negotiation = async {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, negotiator.negotiate())
                    .await
                    .map_err(|_| XmppError::Timeout)?,
                None => negotiator.negotiate().await,
            }
        };

        tokio::select! {
            result = negotiation => result,
            _ = shutdown.cancelled() => Err(XmppError::Shutdown),
        }
    }

    /// Main loop: client frames in, routed stanzas out.
    async fn process_stanzas(&mut self, mut outbound: mpsc::Receiver<Outbound>) -> Result<(), XmppError> {
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                frame = self.stream.read_frame() => {
                    match frame? {
                        None => {
                            debug!("Peer closed the transport");
                            return Ok(());
                        }
                        Some(Frame::StreamClose) => {
                            debug!("Client closed the stream");
                            return Ok(());
                        }
                        Some(Frame::StreamOpen(_)) => {
                            return Err(XmppError::stream("Unexpected stream restart"));
                        }
                        Some(Frame::Element(top)) => self.handle_element(top).await?,
                    }
                }
                Some(item) = outbound.recv() => {
                    for stanza in item.into_stanzas() {
                        self.stream.write_stanza(&stanza).await?;
                        metrics::record_stanza(stanza.name(), Direction::Outbound);
                    }
                }
                _ = shutdown.cancelled() => return Err(XmppError::Shutdown),
            }
        }
    }

    /// Classify one top-level element read after bind.
    #[instrument(skip_all, name = "xmpp.stanza.process", fields(stanza_type = %top.name()))]
    async fn handle_element(&mut self, top: TopLevel) -> Result<(), XmppError> {
        match top.name() {
            "presence" => {
                let presence = decode_presence(top.to_element()?)?;
                metrics::record_stanza("presence", Direction::Inbound);
                self.router.deliver(self.id, presence.into()).await
            }
            "message" => {
                let message = decode_message(top.to_element()?)?;
                metrics::record_stanza("message", Direction::Inbound);
                self.router.deliver(self.id, message.into()).await
            }
            "iq" => {
                metrics::record_stanza("iq", Direction::Inbound);
                match top.to_element().and_then(decode_iq) {
                    Ok(iq) if is_request(&iq) => {
                        debug!(id = %iq.id, "Answering IQ request with service-unavailable");
                        let reply = Stanza::Iq(service_unavailable(&iq));
                        self.stream.write_stanza(&reply).await?;
                        metrics::record_stanza("iq", Direction::Outbound);
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                    Err(e) => {
                        debug!(error = %e, "Ignoring undecodable IQ");
                        Ok(())
                    }
                }
            }
            other => {
                debug!(element = %other, "Ignoring unexpected element");
                Ok(())
            }
        }
    }

    /// Report the outcome on the wire, close, and leave the registry.
    async fn finish(mut self, result: Result<(), XmppError>) -> Result<(), XmppError> {
        if let Err(ref e) = result {
            if let Some(condition) = e.stream_condition() {
                debug!(condition, error = %e, "Sending stream error");
                if let Err(write_err) = self.send_stream_error(condition).await {
                    debug!(error = %write_err, "Could not send stream error");
                }
            }
        }

        if let Err(e) = self.stream.close().await {
            debug!(error = %e, "Error closing stream");
        }

        if self.registered {
            if let Err(e) = self.router.unregister(self.id).await {
                warn!(error = %e, "Failed to unregister connection");
            }
        }

        info!("Connection closed");

        match result {
            Err(XmppError::Shutdown) => Ok(()),
            other => other,
        }
    }

    async fn send_stream_error(&mut self, condition: &str) -> Result<(), XmppError> {
        // A stream error is only meaningful inside a stream.
        if !self.stream.header_sent() {
            self.stream.send_stream_header().await?;
        }
        self.stream.write_raw(&generate_stream_error(condition, None)).await
    }
}
