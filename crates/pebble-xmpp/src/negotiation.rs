//! Client stream negotiation: STARTTLS, SASL ANONYMOUS, resource binding.
//!
//! The negotiator walks a connection through [`NegotiationState`] one step
//! at a time. Each step reads exactly one frame and either advances or
//! fails the connection; nothing is skipped and nothing is retried.

use jid::FullJid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::identity;
use crate::metrics;
use crate::parser::{escape, ns, Frame, StreamHeader, TopLevel};
use crate::stanza::{bind_request, decode_iq};
use crate::stream::XmppStream;
use crate::types::NegotiationState;
use crate::XmppError;

/// The only SASL mechanism offered.
pub const MECHANISM_ANONYMOUS: &str = "ANONYMOUS";

/// Drives one connection from the initial stream header to a bound identifier.
pub struct Negotiator<'a, T> {
    stream: &'a mut XmppStream<T>,
    tls_acceptor: &'a TlsAcceptor,
    state: NegotiationState,
}

impl<'a, T> Negotiator<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a negotiator for a freshly accepted stream.
    pub fn new(stream: &'a mut XmppStream<T>, tls_acceptor: &'a TlsAcceptor) -> Self {
        Self {
            stream,
            tls_acceptor,
            state: NegotiationState::Opened,
        }
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Run the full negotiation and return the bound identifier.
    ///
    /// On error the state is [`NegotiationState::Failed`] and any protocol
    /// level failure reply (`<failure/>`) has already been written; stream
    /// errors are left to the caller.
    #[instrument(skip(self), name = "xmpp.stream.negotiate")]
    pub async fn negotiate(&mut self) -> Result<FullJid, XmppError> {
        match self.run().await {
            Ok(jid) => Ok(jid),
            Err(e) => {
                debug!(state = %self.state, error = %e, "Negotiation failed");
                self.state = NegotiationState::Failed;
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<FullJid, XmppError> {
        self.open().await?;
        self.starttls().await?;
        self.restart().await?;
        self.authenticate().await?;
        self.restart().await?;
        self.bind().await
    }

    fn advance(&mut self, next: NegotiationState) -> Result<(), XmppError> {
        if !self.state.can_advance_to(next) {
            return Err(XmppError::internal(format!(
                "Illegal negotiation transition {} -> {}",
                self.state, next
            )));
        }
        debug!(from = %self.state, to = %next, "Negotiation state advanced");
        self.state = next;
        Ok(())
    }

    /// Read one frame; the peer going away mid-negotiation is an error.
    async fn next_frame(&mut self) -> Result<Frame, XmppError> {
        self.stream.read_frame().await?.ok_or_else(|| {
            XmppError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Peer closed the connection during negotiation",
            ))
        })
    }

    async fn expect_header(&mut self) -> Result<StreamHeader, XmppError> {
        match self.next_frame().await? {
            Frame::StreamOpen(header) => {
                header.validate()?;
                if let Some(ref to) = header.to {
                    if to != self.stream.domain() {
                        debug!(expected = %self.stream.domain(), got = %to, "Domain mismatch in stream header");
                    }
                }
                Ok(header)
            }
            Frame::Element(top) => Err(XmppError::stream(format!(
                "Expected stream header, got <{}/>",
                top.name()
            ))),
            Frame::StreamClose => Err(XmppError::stream("Stream closed before header")),
        }
    }

    async fn expect_element(&mut self, name: &str) -> Result<TopLevel, XmppError> {
        match self.next_frame().await? {
            Frame::Element(top) if top.name() == name => Ok(top),
            Frame::Element(top) => Err(XmppError::stream(format!(
                "Expected <{}/> in state {}, got <{}/>",
                name,
                self.state,
                top.name()
            ))),
            Frame::StreamOpen(_) => Err(XmppError::stream(format!(
                "Expected <{}/> in state {}, got a stream header",
                name, self.state
            ))),
            Frame::StreamClose => Err(XmppError::stream(format!(
                "Stream closed while waiting for <{}/>",
                name
            ))),
        }
    }

    /// Opened: answer the initial header and require STARTTLS.
    async fn open(&mut self) -> Result<(), XmppError> {
        self.expect_header().await?;
        self.stream.send_stream_header().await?;
        self.stream
            .write_raw(&format!(
                "<stream:features><starttls xmlns='{}'><required/></starttls></stream:features>",
                ns::TLS
            ))
            .await?;
        self.advance(NegotiationState::SecureRequested)
    }

    /// SecureRequested: `<starttls/>`, `<proceed/>`, handshake.
    async fn starttls(&mut self) -> Result<(), XmppError> {
        let top = self.expect_element("starttls").await?;
        let element = top.to_element()?;
        if !element.is("starttls", ns::TLS) {
            self.write_tls_failure().await;
            return Err(XmppError::handshake("starttls in wrong namespace"));
        }

        self.stream
            .write_raw(&format!("<proceed xmlns='{}'/>", ns::TLS))
            .await?;

        if let Err(e) = self.stream.upgrade(self.tls_acceptor).await {
            self.write_tls_failure().await;
            return Err(e);
        }

        self.advance(NegotiationState::Secured)
    }

    async fn write_tls_failure(&mut self) {
        let failure = format!("<failure xmlns='{}'/>", ns::TLS);
        if let Err(e) = self.stream.write_raw(&failure).await {
            debug!(error = %e, "Could not send TLS failure");
        }
    }

    /// Secured / Authenticated: mandatory stream restart and the next
    /// feature advertisement.
    async fn restart(&mut self) -> Result<(), XmppError> {
        let (features, next) = match self.state {
            NegotiationState::Secured => (
                format!(
                    "<stream:features><mechanisms xmlns='{}'><mechanism>{}</mechanism></mechanisms></stream:features>",
                    ns::SASL,
                    MECHANISM_ANONYMOUS
                ),
                NegotiationState::AuthRequested,
            ),
            NegotiationState::Authenticated => (
                format!("<stream:features><bind xmlns='{}'/></stream:features>", ns::BIND),
                NegotiationState::BindRequested,
            ),
            other => {
                return Err(XmppError::internal(format!("No stream restart in state {}", other)));
            }
        };

        self.expect_header().await?;
        self.stream.send_stream_header().await?;
        self.stream.write_raw(&features).await?;
        self.advance(next)
    }

    /// AuthRequested: accept `<auth/>` naming ANONYMOUS, reject anything else.
    ///
    /// The SASL namespace is not enforced; any attribute carrying the value
    /// `ANONYMOUS` selects the mechanism.
    async fn authenticate(&mut self) -> Result<(), XmppError> {
        let top = self.expect_element("auth").await?;

        let mechanism = top.to_element().ok().and_then(|element| {
            element
                .attrs()
                .any(|(_, value)| value == MECHANISM_ANONYMOUS)
                .then_some(MECHANISM_ANONYMOUS)
        });

        if mechanism.is_none() {
            metrics::record_auth_attempt("unknown", false);
            warn!("Rejected SASL request without ANONYMOUS mechanism");
            self.stream
                .write_raw(&format!(
                    "<failure xmlns='{}'><malformed-request/></failure>",
                    ns::SASL
                ))
                .await?;
            return Err(XmppError::auth("Only ANONYMOUS is supported"));
        }

        self.stream
            .write_raw(&format!("<success xmlns='{}'/>", ns::SASL))
            .await?;
        metrics::record_auth_attempt(MECHANISM_ANONYMOUS, true);

        self.advance(NegotiationState::Authenticated)
    }

    /// BindRequested: assign a fresh identifier and echo it back.
    async fn bind(&mut self) -> Result<FullJid, XmppError> {
        let top = self.expect_element("iq").await?;
        let iq = decode_iq(top.to_element()?)?;
        bind_request(&iq)?;

        let jid = identity::generate_jid(self.stream.domain())?;

        self.stream
            .write_raw(&format!(
                "<iq type='result' id='{}'><bind xmlns='{}'><jid>{}</jid></bind></iq>",
                escape(&iq.id),
                ns::BIND,
                escape(&jid.to_string())
            ))
            .await?;

        self.advance(NegotiationState::Bound)?;
        info!(jid = %jid, "Resource bound");
        Ok(jid)
    }
}
