//! Test utilities for end-to-end XMPP testing.
//!
//! Provides a server bound to an ephemeral port with self-signed TLS
//! credentials, and a raw client that speaks the wire protocol directly.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use pebble_xmpp::{acceptor_from_pem, Router, XmppServer, XmppServerConfig};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait before concluding nothing more is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub const TLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: CertificateDer<'static>,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for testing.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .expect("Failed to generate test certificate");

        Self {
            cert_pem: cert.pem().into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
        }
    }

    /// Server-side acceptor.
    pub fn tls_acceptor(&self) -> TlsAcceptor {
        acceptor_from_pem(&self.cert_pem, &self.key_pem).expect("Failed to build acceptor")
    }

    /// Client-side connector trusting this certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.add(self.cert_der.clone()).expect("Failed to add cert");

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("Failed to select protocol versions")
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    }
}

/// Test server handle. Dropping it shuts the server down.
pub struct TestServer {
    pub addr: SocketAddr,
    pub domain: String,
    pub tls_credentials: TestTlsCredentials,
    router: Router,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a test server on an available port with default settings.
    pub async fn start() -> Self {
        Self::start_with_config(XmppServerConfig::default()).await
    }

    /// Start a test server with custom settings; `c2s_addr` is ignored.
    pub async fn start_with_config(config: XmppServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let domain = config.domain.clone();
        let tls_credentials = TestTlsCredentials::generate(&domain);
        let shutdown = CancellationToken::new();

        let server = XmppServer::new(config, tls_credentials.tls_acceptor(), listener, shutdown.clone());
        let router = server.router().clone();
        tokio::spawn(server.run());

        Self {
            addr,
            domain,
            tls_credentials,
            router,
            shutdown,
        }
    }

    /// Connect a raw client.
    pub async fn connect(&self) -> RawXmppClient {
        RawXmppClient::connect(self.addr)
            .await
            .expect("Failed to connect to test server")
    }

    /// Connect a client and take it through negotiation; returns the bound identifier.
    pub async fn connect_bound(&self) -> (RawXmppClient, String) {
        let mut client = self.connect().await;
        let jid = client
            .negotiate(self.tls_connector(), &self.domain)
            .await
            .expect("Negotiation failed");
        (client, jid)
    }

    /// Get a TLS connector that trusts this server.
    pub fn tls_connector(&self) -> TlsConnector {
        self.tls_credentials.tls_connector()
    }

    /// Identifiers currently registered with the router.
    pub async fn connected(&self) -> Vec<String> {
        self.router
            .connected()
            .await
            .expect("Router stopped")
            .into_iter()
            .map(|jid| jid.to_string())
            .collect()
    }

    /// Poll the router until `expected` identifiers are registered.
    pub async fn wait_for_connected(&self, expected: usize) -> Vec<String> {
        let start = std::time::Instant::now();
        loop {
            let connected = self.connected().await;
            if connected.len() == expected || start.elapsed() > DEFAULT_TIMEOUT {
                return connected;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel the shutdown token.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A client that operates directly on the socket for precise control.
pub struct RawXmppClient {
    tcp: Option<TcpStream>,
    tls: Option<tokio_rustls::client::TlsStream<TcpStream>>,
    buffer: String,
}

impl RawXmppClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp: Some(tcp),
            tls: None,
            buffer: String::new(),
        })
    }

    /// Send raw data.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if let Some(ref mut tls) = self.tls {
            tls.write_all(data.as_bytes()).await?;
            tls.flush().await?;
        } else if let Some(ref mut tcp) = self.tcp {
            tcp.write_all(data.as_bytes()).await?;
            tcp.flush().await?;
        }
        Ok(())
    }

    /// Read once with timeout, appending to the buffer. Returns the bytes read.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let mut buf = [0u8; 4096];
        let n = timeout(timeout_dur, async {
            if let Some(ref mut tls) = self.tls {
                tls.read(&mut buf).await
            } else if let Some(ref mut tcp) = self.tcp {
                tcp.read(&mut buf).await
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "Not connected"))
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout"))??;

        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "Connection closed"));
        }

        let data = String::from_utf8_lossy(&buf[..n]).to_string();
        self.buffer.push_str(&data);
        Ok(data)
    }

    /// Read until pattern found in the buffer.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !self.buffer.contains(pattern) {
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for: {}", pattern),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            self.read(remaining).await?;
        }
        Ok(self.buffer.clone())
    }

    /// Read until the buffer holds `count` occurrences of `pattern`.
    pub async fn read_until_count(
        &mut self,
        pattern: &str,
        count: usize,
        timeout_dur: Duration,
    ) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while self.buffer.matches(pattern).count() < count {
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for {} x {}: {}", count, pattern, self.buffer),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            self.read(remaining).await?;
        }
        Ok(self.buffer.clone())
    }

    /// Read until EOF or timeout; returns the whole buffer.
    pub async fn read_to_close(&mut self, timeout_dur: Duration) -> String {
        while self.read(timeout_dur).await.is_ok() {}
        self.buffer.clone()
    }

    /// Whether anything arrives within `quiet`.
    pub async fn receives_nothing(&mut self, quiet: Duration) -> bool {
        self.read(quiet).await.is_err()
    }

    /// Clear buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the buffer.
    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    /// Upgrade to TLS.
    pub async fn upgrade_tls(&mut self, connector: TlsConnector, domain: &str) -> std::io::Result<()> {
        let tcp = self.tcp.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "No TCP connection or already TLS")
        })?;

        let server_name: ServerName<'static> = domain
            .to_string()
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid server name"))?;

        let tls = connector.connect(server_name, tcp).await?;
        self.tls = Some(tls);
        self.buffer.clear();
        Ok(())
    }

    /// Check if using TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Send the client stream header.
    pub async fn send_stream_header(&mut self, domain: &str) -> std::io::Result<()> {
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams'>",
            domain
        ))
        .await
    }

    /// Open the stream and complete STARTTLS.
    pub async fn starttls(&mut self, connector: TlsConnector, domain: &str) -> std::io::Result<()> {
        self.send_stream_header(domain).await?;
        self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;
        self.clear();

        self.send(&format!("<starttls xmlns='{}'/>", TLS_NS)).await?;
        self.read_until("<proceed", DEFAULT_TIMEOUT).await?;
        self.upgrade_tls(connector, domain).await
    }

    /// Restart after TLS and authenticate with ANONYMOUS.
    pub async fn authenticate(&mut self, domain: &str) -> std::io::Result<()> {
        self.send_stream_header(domain).await?;
        self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;
        self.clear();

        self.send(&format!("<auth xmlns='{}' mechanism='ANONYMOUS'/>", SASL_NS))
            .await?;
        self.read_until("<success", DEFAULT_TIMEOUT).await?;
        self.clear();
        Ok(())
    }

    /// Run the whole negotiation and return the bound identifier.
    pub async fn negotiate(&mut self, connector: TlsConnector, domain: &str) -> std::io::Result<String> {
        self.starttls(connector, domain).await?;
        self.authenticate(domain).await?;

        self.send_stream_header(domain).await?;
        self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;
        self.clear();

        self.send(&format!("<iq type='set' id='bind_1'><bind xmlns='{}'/></iq>", BIND_NS))
            .await?;
        let response = self.read_until("</iq>", DEFAULT_TIMEOUT).await?;
        self.clear();

        extract_bound_jid(&response)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, response))
    }
}

/// Helper to validate stream header attributes.
pub fn validate_stream_header(response: &str) -> Result<(), String> {
    if !response.contains("xmlns='jabber:client'") {
        return Err("Missing xmlns='jabber:client'".to_string());
    }
    if !response.contains("xmlns:stream='http://etherx.jabber.org/streams'") {
        return Err("Missing xmlns:stream".to_string());
    }
    if !response.contains("version='1.0'") {
        return Err("Missing or incorrect version attribute".to_string());
    }
    if !response.contains("id='") {
        return Err("Missing id attribute".to_string());
    }
    if !response.contains("from='") {
        return Err("Missing from attribute".to_string());
    }
    Ok(())
}

/// Extract a JID from a bind result.
pub fn extract_bound_jid(response: &str) -> Option<String> {
    let start = response.find("<jid>")?;
    let end = response.find("</jid>")?;
    Some(response[start + 5..end].to_string())
}

/// Whether `jid` looks like `<16 hex>@<domain>/<16 hex>`.
pub fn is_generated_jid(jid: &str, domain: &str) -> bool {
    let is_hex16 = |s: &str| s.len() == 16 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));

    let Some((local, rest)) = jid.split_once('@') else {
        return false;
    };
    let Some((jid_domain, resource)) = rest.split_once('/') else {
        return false;
    };
    is_hex16(local) && jid_domain == domain && is_hex16(resource)
}

/// Whether `xml` carries `name=value` with either quote style.
pub fn has_attr(xml: &str, name: &str, value: &str) -> bool {
    count_attr(xml, name, value) > 0
}

/// Occurrences of `name=value` in `xml`, with either quote style.
pub fn count_attr(xml: &str, name: &str, value: &str) -> usize {
    xml.matches(&format!("{}='{}'", name, value)).count()
        + xml.matches(&format!("{}=\"{}\"", name, value)).count()
}
