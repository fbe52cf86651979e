//! XML stream handling for XMPP connections.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument, warn};

use crate::identity;
use crate::parser::{ns, Frame, XmlParser, DEFAULT_MAX_STANZA_SIZE};
use crate::stanza::Stanza;
use crate::XmppError;

/// Secondary sink receiving a copy of every write on the encrypted channel.
///
/// Clones share one sink. Each record is the written bytes followed by a
/// blank line, emitted under the lock in a single write so records from
/// different connections never interleave.
#[derive(Clone)]
pub struct WireTap {
    sink: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl WireTap {
    pub fn new(sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// Tap writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    async fn record(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut record = Vec::with_capacity(buf.len() + 2);
        record.extend_from_slice(buf);
        record.extend_from_slice(b"\n\n");

        let mut sink = self.sink.lock().await;
        sink.write_all(&record).await?;
        sink.flush().await
    }
}

/// XMPP stream handler.
///
/// Owns one client's transport and the framing state bound to it. The
/// transport starts as plaintext and is replaced in place by a TLS wrapper
/// that takes ownership of it on [`XmppStream::upgrade`]; the parser is
/// rebuilt at that point since anything buffered belongs to the old layer.
///
/// Every write is flushed before returning.
pub struct XmppStream<T> {
    /// The underlying stream (either plaintext or TLS)
    inner: StreamInner<T>,
    /// Incremental XML framer
    parser: XmlParser,
    /// Server domain
    domain: String,
    /// Current stream ID
    stream_id: String,
    /// Limit for one buffered top-level element
    max_stanza_size: usize,
    /// Diagnostics copy of encrypted writes
    wire_tap: Option<WireTap>,
    /// Set once the TLS handshake completes
    secure: bool,
}

enum StreamInner<T> {
    None,
    Plain(T),
    Tls(Box<TlsStream<T>>),
}

impl<T> XmppStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a new XMPP stream over a freshly accepted transport.
    pub fn new(transport: T, domain: impl Into<String>) -> Self {
        Self {
            inner: StreamInner::Plain(transport),
            parser: XmlParser::with_max_stanza_size(DEFAULT_MAX_STANZA_SIZE),
            domain: domain.into(),
            stream_id: String::new(),
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            wire_tap: None,
            secure: false,
        }
    }

    /// Limit the size of a single top-level element.
    pub fn with_max_stanza_size(mut self, max_stanza_size: usize) -> Self {
        self.max_stanza_size = max_stanza_size;
        self.parser = XmlParser::with_max_stanza_size(max_stanza_size);
        self
    }

    /// Duplicate writes made after the TLS upgrade to `tap`.
    pub fn with_wire_tap(mut self, tap: WireTap) -> Self {
        self.wire_tap = Some(tap);
        self
    }

    /// Whether the TLS handshake has completed. Never reverts to false.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Get the current stream ID.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether a server stream header has gone out on this stream.
    pub fn header_sent(&self) -> bool {
        !self.stream_id.is_empty()
    }

    /// Server domain this stream speaks for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Read bytes from the underlying stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("Stream not initialized")),
            StreamInner::Plain(s) => Ok(s.read(buf).await?),
            StreamInner::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    /// Write and flush bytes, mirroring them to the wire tap when encrypted.
    ///
    /// A failed or short write to either sink fails the whole write.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::None => return Err(XmppError::internal("Stream not initialized")),
            StreamInner::Plain(s) => {
                s.write_all(buf).await?;
                s.flush().await?;
            }
            StreamInner::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await?;

                if let Some(tap) = self.wire_tap.as_ref() {
                    tap.record(buf).await?;
                }
            }
        }
        Ok(())
    }

    /// Read the next frame: a stream header, a complete top-level element,
    /// or the stream close tag.
    ///
    /// Returns `Ok(None)` when the peer closed the transport. Buffered data
    /// survives cancellation, so this can sit in a `select!`.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, XmppError> {
        let mut buf = [0u8; 8192];

        loop {
            if let Some(frame) = self.parser.next_frame()? {
                return Ok(Some(frame));
            }

            let n = self.read(&mut buf).await?;

            if n == 0 {
                return Ok(None);
            }

            self.parser.feed(&buf[..n]);
        }
    }

    /// Send the server's stream header with a fresh stream id.
    pub async fn send_stream_header(&mut self) -> Result<(), XmppError> {
        self.stream_id = identity::stream_id();

        let header = format!(
            "<?xml version='1.0'?>\
            <stream:stream id='{}' version='1.0' xml:lang='en' \
            xmlns:stream='{}' from='{}' xmlns='{}'>",
            self.stream_id,
            ns::STREAM,
            self.domain,
            ns::JABBER_CLIENT
        );

        self.write_all(header.as_bytes()).await?;

        debug!(stream_id = %self.stream_id, "Sent stream header");
        Ok(())
    }

    /// Upgrade the transport to TLS in place.
    ///
    /// On failure the plaintext transport is put back so the caller can
    /// still report the failure and close it.
    #[instrument(skip(self, tls_acceptor), name = "xmpp.stream.upgrade")]
    pub async fn upgrade(&mut self, tls_acceptor: &TlsAcceptor) -> Result<(), XmppError> {
        let plain = match std::mem::replace(&mut self.inner, StreamInner::None) {
            StreamInner::Plain(s) => s,
            StreamInner::Tls(s) => {
                self.inner = StreamInner::Tls(s);
                return Err(XmppError::stream("Already using TLS"));
            }
            StreamInner::None => return Err(XmppError::internal("Stream already taken")),
        };

        match tls_acceptor.accept(plain).into_fallible().await {
            Ok(tls_stream) => {
                self.inner = StreamInner::Tls(Box::new(tls_stream));
                self.secure = true;
                self.parser = XmlParser::with_max_stanza_size(self.max_stanza_size);
                debug!("TLS upgrade complete");
                Ok(())
            }
            Err((e, plain)) => {
                self.inner = StreamInner::Plain(plain);
                warn!(error = %e, "TLS handshake failed");
                Err(XmppError::handshake(e.to_string()))
            }
        }
    }

    /// Write a stanza to the stream.
    pub async fn write_stanza(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        let xml = stanza.to_xml()?;
        self.write_all(xml.as_bytes()).await
    }

    /// Write a raw protocol fragment to the stream.
    pub async fn write_raw(&mut self, xml: &str) -> Result<(), XmppError> {
        self.write_all(xml.as_bytes()).await
    }

    /// Send the stream close tag and shut the transport down.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        let result = self.write_all(b"</stream:stream>").await;

        match &mut self.inner {
            StreamInner::None => {}
            StreamInner::Plain(s) => s.shutdown().await?,
            StreamInner::Tls(s) => s.shutdown().await?,
        }
        self.inner = StreamInner::None;

        result
    }
}
