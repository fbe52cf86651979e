//! Routing actor.
//!
//! A single task owns the [`Registry`] and applies register, unregister and
//! deliver requests one at a time, in inbox order. Connection tasks talk to
//! it only through the cloneable [`Router`] handle; the registry is never
//! touched from anywhere else, so no locking is involved.
//!
//! The actor never writes to a socket. Delivery means pushing onto the
//! recipient's outbound queue with `try_send`; a full queue loses the stanza
//! rather than stalling every other connection.

use jid::FullJid;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::metrics;
use crate::registry::{ConnectionId, Outbound, Registry};
use crate::stanza::Stanza;
use crate::XmppError;

/// Default inbox depth.
pub const DEFAULT_ROUTER_CAPACITY: usize = 256;

enum RouterCommand {
    Register {
        id: ConnectionId,
        jid: FullJid,
        sender: mpsc::Sender<Outbound>,
        reply: oneshot::Sender<Result<(), XmppError>>,
    },
    Unregister {
        id: ConnectionId,
    },
    Deliver {
        from: ConnectionId,
        stanza: Stanza,
    },
    Connected {
        reply: oneshot::Sender<Vec<FullJid>>,
    },
}

/// Handle to the routing actor.
///
/// Submitting suspends while the inbox is full; that is the only
/// backpressure a connection task sees from routing.
#[derive(Clone)]
pub struct Router {
    tx: mpsc::Sender<RouterCommand>,
}

impl Router {
    /// Spawn the routing actor with an inbox of `capacity` requests.
    ///
    /// The actor stops once every handle has been dropped.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let actor = RouterActor {
            rx,
            registry: Registry::new(),
        };
        let handle = tokio::spawn(actor.run());
        (Self { tx }, handle)
    }

    /// Register a bound connection together with its outbound queue.
    pub async fn register(
        &self,
        id: ConnectionId,
        jid: FullJid,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<(), XmppError> {
        let (reply, rx) = oneshot::channel();
        self.submit(RouterCommand::Register {
            id,
            jid,
            sender,
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Remove a connection. Unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), XmppError> {
        self.submit(RouterCommand::Unregister { id }).await
    }

    /// Route a stanza submitted by connection `from`.
    pub async fn deliver(&self, from: ConnectionId, stanza: Stanza) -> Result<(), XmppError> {
        self.submit(RouterCommand::Deliver { from, stanza }).await
    }

    /// Snapshot of bound identifiers, in registration order.
    pub async fn connected(&self) -> Result<Vec<FullJid>, XmppError> {
        let (reply, rx) = oneshot::channel();
        self.submit(RouterCommand::Connected { reply }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    async fn submit(&self, command: RouterCommand) -> Result<(), XmppError> {
        self.tx.send(command).await.map_err(|_| actor_gone())
    }
}

fn actor_gone() -> XmppError {
    XmppError::internal("Routing actor stopped")
}

struct RouterActor {
    rx: mpsc::Receiver<RouterCommand>,
    registry: Registry,
}

impl RouterActor {
    async fn run(mut self) {
        info!("Routing actor started");
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }
        info!(remaining = self.registry.len(), "Routing actor stopped");
    }

    fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Register {
                id,
                jid,
                sender,
                reply,
            } => {
                let result = self.register(id, jid, sender);
                // The connection may have gone away while waiting.
                let _ = reply.send(result);
            }
            RouterCommand::Unregister { id } => self.unregister(id),
            RouterCommand::Deliver { from, stanza } => self.deliver(from, stanza),
            RouterCommand::Connected { reply } => {
                let _ = reply.send(self.registry.jids());
            }
        }
    }

    #[instrument(skip_all, name = "xmpp.router.register", fields(conn_id = %id, jid = %jid))]
    fn register(
        &mut self,
        id: ConnectionId,
        jid: FullJid,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<(), XmppError> {
        self.registry.register(id, jid, sender)?;
        metrics::record_connection_count(self.registry.len());
        Ok(())
    }

    #[instrument(skip_all, name = "xmpp.router.unregister", fields(conn_id = %id))]
    fn unregister(&mut self, id: ConnectionId) {
        if self.registry.unregister(id).is_none() {
            debug!("Unregister for unknown connection ignored");
        }
        metrics::record_connection_count(self.registry.len());
    }

    #[instrument(skip_all, name = "xmpp.router.deliver", fields(conn_id = %from, stanza_type = stanza.name()))]
    fn deliver(&mut self, from: ConnectionId, stanza: Stanza) {
        self.registry.deliver(from, stanza);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use jid::Jid;
    use xmpp_parsers::message::{Body, Message};
    use xmpp_parsers::presence::{Presence, Type as PresenceType};

    use super::*;
    use crate::identity::generate_jid;

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let (router, _handle) = Router::spawn(8);
        let (tx, _rx) = mpsc::channel(4);
        let jid: FullJid = "a@localhost/1".parse().unwrap();

        router.register(ConnectionId::new(), jid.clone(), tx).await.unwrap();

        assert_eq!(router.connected().await.unwrap(), vec![jid]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let (router, _handle) = Router::spawn(8);
        let jid: FullJid = "a@localhost/1".parse().unwrap();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        router.register(ConnectionId::new(), jid.clone(), tx1).await.unwrap();
        let second = router.register(ConnectionId::new(), jid, tx2).await;

        assert!(matches!(second, Err(XmppError::Conflict(_))));
        assert_eq!(router.connected().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let (router, _handle) = Router::spawn(8);
        let id = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(4);
        router.register(id, "a@localhost/1".parse().unwrap(), tx).await.unwrap();

        router.unregister(id).await.unwrap();
        router.unregister(id).await.unwrap();

        assert!(router.connected().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_are_serialized() {
        let (router, _handle) = Router::spawn(4);
        let mut tasks = Vec::new();

        for _ in 0..64 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(4);
                let jid = generate_jid("localhost").unwrap();
                router.register(ConnectionId::new(), jid, tx).await.unwrap();
                rx
            }));
        }

        let mut receivers = Vec::new();
        for task in tasks {
            receivers.push(task.await.unwrap());
        }

        let connected: HashSet<_> = router.connected().await.unwrap().into_iter().collect();
        assert_eq!(connected.len(), 64);
    }

    #[tokio::test]
    async fn test_deliver_goes_through_outbound_queues() {
        let (router, _handle) = Router::spawn(8);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let a_jid: FullJid = "a@localhost/1".parse().unwrap();
        let b_jid: FullJid = "b@localhost/2".parse().unwrap();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        router.register(a, a_jid.clone(), tx_a).await.unwrap();
        router.register(b, b_jid.clone(), tx_b).await.unwrap();

        let mut message = Message::new(Some(Jid::from(b_jid.clone())));
        message.bodies.insert(String::new(), Body("hello".to_string()));

        router.deliver(b, Presence::new(PresenceType::None).into()).await.unwrap();
        router.deliver(a, message.into()).await.unwrap();

        let presence = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap()
            .into_stanzas();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].from(), Some(&Jid::from(b_jid.clone())));
        assert_eq!(presence[0].to(), Some(&Jid::from(a_jid.clone())));

        let first = rx_b.recv().await.unwrap().into_stanzas();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name(), "presence");
        assert_eq!(first[0].from(), Some(&Jid::from(a_jid)));

        let second = rx_b.recv().await.unwrap().into_stanzas();
        match second.as_slice() {
            [Stanza::Message(m)] => {
                assert_eq!(m.bodies.get("").map(|b| b.0.as_str()), Some("hello"))
            }
            other => panic!("unexpected stanzas {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_actor_stops_when_handles_dropped() {
        let (router, handle) = Router::spawn(8);
        drop(router);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
