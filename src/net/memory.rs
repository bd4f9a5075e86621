//! In-process transport hub for tests and the demo binary.
//!
//! Wires any number of nodes together with per-link ordered queues and
//! explicit connect/disconnect control. Stands in for the real unreliable
//! transport, which is an external collaborator of the engine.

use super::message::Envelope;
use super::router::{RouterEvent, Transport, TransportError};
use crate::types::PeerId;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct HubState {
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<RouterEvent>>,
    links: HashSet<(PeerId, PeerId)>,
}

impl HubState {
    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.contains(&order(a, b))
    }
}

fn order(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared hub connecting all in-memory nodes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, returning its transport handle and the event stream
    /// to feed into its router.
    pub fn register(&self, id: PeerId) -> (MemoryTransport, mpsc::UnboundedReceiver<RouterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inboxes.insert(id, tx);
        (
            MemoryTransport {
                hub: self.clone(),
                id,
            },
            rx,
        )
    }

    pub fn connect(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.links.insert(order(a, b));
    }

    /// Tear down the link and notify both ends.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.links.remove(&order(a, b)) {
            return;
        }
        if let Some(tx) = state.inboxes.get(&a) {
            let _ = tx.send(RouterEvent::Disconnected(b));
        }
        if let Some(tx) = state.inboxes.get(&b) {
            let _ = tx.send(RouterEvent::Disconnected(a));
        }
    }

    pub fn is_connected(&self, a: PeerId, b: PeerId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .linked(a, b)
    }

    fn deliver(&self, from: PeerId, to: PeerId, env: Envelope) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.linked(from, to) {
            return Err(TransportError::NotConnected(to));
        }
        match state.inboxes.get(&to) {
            Some(tx) => tx
                .send(RouterEvent::Message { from, env })
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::NotConnected(to)),
        }
    }
}

/// One node's handle onto the hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: PeerId,
}

impl MemoryTransport {
    /// Synchronous send used by tests to inject traffic without an extra
    /// router on the sending side.
    pub fn push(&self, to: PeerId, env: Envelope) {
        let _ = self.hub.deliver(self.id, to, env);
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.hub.is_connected(self.id, peer)
    }

    fn send(
        &self,
        to: PeerId,
        env: Envelope,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let res = self.hub.deliver(self.id, to, env);
        async move { res }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::Message;
    use crate::types::Uid;

    #[tokio::test]
    async fn test_send_requires_link() {
        let hub = MemoryHub::new();
        let (ta, _ea) = hub.register(PeerId(1));
        let (_tb, mut eb) = hub.register(PeerId(2));

        let env = Envelope::new(Uid(1), Message::Accepted);
        assert!(matches!(
            ta.send(PeerId(2), env.clone()).await,
            Err(TransportError::NotConnected(PeerId(2)))
        ));

        hub.connect(PeerId(1), PeerId(2));
        ta.send(PeerId(2), env).await.unwrap();
        match eb.recv().await.unwrap() {
            RouterEvent::Message { from, env } => {
                assert_eq!(from, PeerId(1));
                assert_eq!(env.uid, Uid(1));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_ends() {
        let hub = MemoryHub::new();
        let (_ta, mut ea) = hub.register(PeerId(1));
        let (_tb, mut eb) = hub.register(PeerId(2));
        hub.connect(PeerId(1), PeerId(2));
        hub.disconnect(PeerId(1), PeerId(2));

        assert!(matches!(
            ea.recv().await.unwrap(),
            RouterEvent::Disconnected(PeerId(2))
        ));
        assert!(matches!(
            eb.recv().await.unwrap(),
            RouterEvent::Disconnected(PeerId(1))
        ));
        assert!(!hub.is_connected(PeerId(1), PeerId(2)));
    }

    #[tokio::test]
    async fn test_per_link_ordering() {
        let hub = MemoryHub::new();
        let (ta, _ea) = hub.register(PeerId(1));
        let (_tb, mut eb) = hub.register(PeerId(2));
        hub.connect(PeerId(1), PeerId(2));

        for i in 0..10 {
            ta.push(PeerId(2), Envelope::new(Uid(i), Message::Accepted));
        }
        for i in 0..10 {
            match eb.recv().await.unwrap() {
                RouterEvent::Message { env, .. } => assert_eq!(env.uid, Uid(i)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
