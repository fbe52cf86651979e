//! # pebble-xmpp
//!
//! Minimal XMPP client-to-server library.
//!
//! Clients negotiate a stream (RFC 6120): mandatory STARTTLS, SASL
//! ANONYMOUS, then resource binding to a randomly generated identifier.
//! Once bound they exchange `<presence/>` and `<message/>` stanzas with
//! every other connected client. Nothing is persisted.
//!
//! ## Architecture
//!
//! - **Server**: accept loop on an already bound TCP listener (port 5222)
//! - **Connection Actors**: one task per client, running negotiation and
//!   then the read/deliver loop
//! - **Routing Actor**: a single task owning the registry of bound
//!   connections; all fan-out decisions are made there
//! - **Stream Processing**: incremental framing in [`parser`], stanza
//!   decoding through minidom

pub mod connection;
pub mod identity;
pub mod metrics;
pub mod negotiation;
pub mod parser;
pub mod registry;
pub mod router;
pub mod server;
pub mod stanza;
pub mod stream;
pub mod tls;

mod error;
mod types;

pub use error::{generate_stream_error, stream_errors, XmppError};
pub use parser::{ns, Frame, StreamHeader};
pub use registry::{ConnectionId, Outbound};
pub use router::Router;
pub use server::{XmppServer, XmppServerConfig};
pub use stanza::Stanza;
pub use tls::{acceptor_from_pem, load_tls_acceptor};
pub use types::*;

/// Start the XMPP server on `c2s_listener` and run until `shutdown_token`
/// is cancelled and every connection has closed.
pub async fn start(
    config: XmppServerConfig,
    tls_acceptor: tokio_rustls::TlsAcceptor,
    c2s_listener: tokio::net::TcpListener,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> Result<(), XmppError> {
    XmppServer::new(config, tls_acceptor, c2s_listener, shutdown_token)
        .run()
        .await
}
