//! Registry of bound connections.
//!
//! Owned exclusively by the routing actor (see [`crate::router`]); nothing
//! here is shared or locked. Entries are kept in registration order.

use std::fmt;

use jid::{FullJid, Jid};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::metrics;
use crate::stanza::{readdressed, Stanza};
use crate::XmppError;

/// Transport identity of one accepted connection.
///
/// Assigned at accept time, before any identifier is bound, and used as the
/// key for unregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One item on a connection's outbound queue.
///
/// A presence broadcast hands its sender every reciprocal copy as a single
/// batch so the copies occupy one queue slot however many peers are online.
#[derive(Debug, Clone)]
pub enum Outbound {
    Stanza(Stanza),
    Batch(Vec<Stanza>),
}

impl Outbound {
    /// The stanzas to write, in order.
    pub fn into_stanzas(self) -> Vec<Stanza> {
        match self {
            Outbound::Stanza(stanza) => vec![stanza],
            Outbound::Batch(stanzas) => stanzas,
        }
    }

    fn len(&self) -> usize {
        match self {
            Outbound::Stanza(_) => 1,
            Outbound::Batch(stanzas) => stanzas.len(),
        }
    }
}

impl From<Stanza> for Outbound {
    fn from(stanza: Stanza) -> Self {
        Outbound::Stanza(stanza)
    }
}

/// A registered connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Transport identity
    pub id: ConnectionId,
    /// Bound identifier
    pub jid: FullJid,
    /// Outbound queue drained by the connection's own task
    pub sender: mpsc::Sender<Outbound>,
}

/// Result of handing a stanza to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Queued for delivery
    Sent,
    /// The recipient is not currently connected
    NotConnected,
    /// The recipient's queue is full
    ChannelFull,
    /// The recipient's task is gone
    ChannelClosed,
}

impl SendResult {
    fn drop_reason(self) -> Option<&'static str> {
        match self {
            SendResult::Sent => None,
            SendResult::NotConnected | SendResult::ChannelClosed => Some("recipient-offline"),
            SendResult::ChannelFull => Some("queue-full"),
        }
    }
}

/// Registry of bound connections, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<ConnectionEntry>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bound identifiers, in registration order.
    pub fn jids(&self) -> Vec<FullJid> {
        self.entries.iter().map(|e| e.jid.clone()).collect()
    }

    /// Look up a connection by transport identity.
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Register a bound connection.
    ///
    /// Fails with [`XmppError::Conflict`] if either the transport identity
    /// or the identifier is already present.
    pub fn register(
        &mut self,
        id: ConnectionId,
        jid: FullJid,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<(), XmppError> {
        if self.entries.iter().any(|e| e.id == id) {
            return Err(XmppError::conflict(format!("Connection {} already registered", id)));
        }
        if self.entries.iter().any(|e| e.jid == jid) {
            return Err(XmppError::conflict(format!("{} already bound", jid)));
        }

        debug!(conn_id = %id, jid = %jid, "Registered connection");
        self.entries.push(ConnectionEntry { id, jid, sender });
        Ok(())
    }

    /// Remove the entry for `id`. Unknown ids are a no-op.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<FullJid> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(index);
        debug!(conn_id = %id, jid = %entry.jid, "Unregistered connection");
        Some(entry.jid)
    }

    /// Fan a stanza submitted by connection `from` out to its recipients.
    pub fn deliver(&self, from: ConnectionId, stanza: Stanza) {
        let Some(sender) = self.get(from) else {
            warn!(conn_id = %from, stanza_type = stanza.name(), "Stanza from unregistered connection dropped");
            return;
        };

        match stanza {
            Stanza::Message(message) => self.deliver_message(message),
            Stanza::Presence(presence) => self.broadcast_presence(sender, &presence),
            Stanza::Iq(_) => debug!(conn_id = %from, "IQ stanzas are not routed"),
        }
    }

    /// Exact match on `to`; silently dropped if nobody holds that identifier.
    fn deliver_message(&self, message: Message) {
        let Some(to) = message.to.clone() else {
            debug!("Message without recipient dropped");
            metrics::record_stanza_dropped("message", "recipient-offline");
            return;
        };

        let result = match self.entries.iter().find(|e| Jid::from(e.jid.clone()) == to) {
            Some(entry) => send(entry, Stanza::Message(message).into()),
            None => SendResult::NotConnected,
        };

        if let Some(reason) = result.drop_reason() {
            debug!(to = %to, reason, "Message dropped");
            metrics::record_stanza_dropped("message", reason);
        }
    }

    /// Mirror a presence between the sender and every other connection.
    fn broadcast_presence(&self, sender: &ConnectionEntry, presence: &Presence) {
        let sender_jid = Jid::from(sender.jid.clone());
        let mut reciprocal = Vec::new();

        for other in self.entries.iter().filter(|e| e.id != sender.id) {
            let other_jid = Jid::from(other.jid.clone());

            let outgoing = readdressed(presence, sender_jid.clone(), other_jid.clone());
            record_presence_result(send(other, Stanza::Presence(outgoing).into()), 1);

            reciprocal.push(Stanza::Presence(readdressed(presence, other_jid, sender_jid.clone())));
        }

        if !reciprocal.is_empty() {
            let count = reciprocal.len();
            record_presence_result(send(sender, Outbound::Batch(reciprocal)), count);
        }
    }
}

fn send(entry: &ConnectionEntry, item: Outbound) -> SendResult {
    match entry.sender.try_send(item) {
        Ok(()) => SendResult::Sent,
        Err(mpsc::error::TrySendError::Full(item)) => {
            warn!(jid = %entry.jid, stanzas = item.len(), "Outbound queue full, stanzas dropped");
            SendResult::ChannelFull
        }
        Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
    }
}

fn record_presence_result(result: SendResult, count: usize) {
    if let Some(reason) = result.drop_reason() {
        for _ in 0..count {
            metrics::record_stanza_dropped("presence", reason);
        }
    }
}
