//! Error types for the XMPP server.

use thiserror::Error;

use crate::parser::ns;

/// XMPP server errors.
///
/// Every error raised while negotiating or serving a connection is terminal
/// for that connection. [`XmppError::stream_condition`] tells the caller which
/// `<stream:error/>`, if any, to emit before closing the stream.
#[derive(Debug, Error)]
pub enum XmppError {
    /// Transport read/write/close failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// STARTTLS handshake did not complete
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Unsupported or malformed SASL request
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Missing or malformed resource binding request
    #[error("Resource binding failed: {0}")]
    Bind(String),

    /// Malformed XML or stanza
    #[error("XML decode error: {0}")]
    Decode(String),

    /// Protocol violation (unexpected element, failed restart)
    #[error("Stream error: {0}")]
    Stream(String),

    /// Stream header announced a version other than 1.0
    #[error("Unsupported XMPP version: {0}")]
    UnsupportedVersion(String),

    /// A top-level element exceeded the configured size limit
    #[error("Stanza exceeds {limit} bytes")]
    StanzaTooLarge {
        /// Configured limit in bytes
        limit: usize,
    },

    /// Identifier already registered with the router
    #[error("Resource conflict: {0}")]
    Conflict(String),

    /// Negotiation deadline elapsed
    #[error("Negotiation timed out")]
    Timeout,

    /// Server is shutting down
    #[error("Server shutting down")]
    Shutdown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a new bind error.
    pub fn bind(msg: impl Into<String>) -> Self {
        Self::Bind(msg.into())
    }

    /// Create a new XML decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The stream error condition to send before closing, if any.
    ///
    /// Handshake and authentication failures are reported through their own
    /// `<failure/>` elements, and transport errors leave nothing to talk to.
    pub fn stream_condition(&self) -> Option<&'static str> {
        match self {
            Self::Bind(_) | Self::Decode(_) | Self::Stream(_) => {
                Some(stream_errors::NOT_WELL_FORMED)
            }
            Self::UnsupportedVersion(_) => Some(stream_errors::UNSUPPORTED_VERSION),
            Self::StanzaTooLarge { .. } => Some(stream_errors::POLICY_VIOLATION),
            Self::Conflict(_) => Some(stream_errors::CONFLICT),
            Self::Timeout => Some(stream_errors::CONNECTION_TIMEOUT),
            Self::Shutdown => Some(stream_errors::SYSTEM_SHUTDOWN),
            Self::Internal(_) | Self::Config(_) => Some(stream_errors::INTERNAL_SERVER_ERROR),
            Self::Io(_) | Self::Tls(_) | Self::Handshake(_) | Self::Auth(_) => None,
        }
    }
}

/// Generate a stream error.
///
/// Stream errors are fatal; the caller closes the stream right after.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!("<stream:error><{} xmlns='{}'/>", condition, ns::STREAM_ERRORS);

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STREAM_ERRORS,
            crate::parser::escape(t)
        ));
    }

    error.push_str("</stream:error>");
    error
}

/// Stream error conditions emitted by this server.
pub mod stream_errors {
    /// Stream error: conflict (identifier already bound)
    pub const CONFLICT: &str = "conflict";
    /// Stream error: connection timeout
    pub const CONNECTION_TIMEOUT: &str = "connection-timeout";
    /// Stream error: internal server error
    pub const INTERNAL_SERVER_ERROR: &str = "internal-server-error";
    /// Stream error: not well-formed
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    /// Stream error: policy violation
    pub const POLICY_VIOLATION: &str = "policy-violation";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    /// Stream error: unsupported version
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
}
