//! Originator-side announcement callbacks.

use crate::types::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Progress events for a locally-originated announcement. A session is
/// either an originator (callback fires, nothing goes upstream) or a
/// forwarder (outcomes relay upstream, the callback never fires);
/// construction enforces the split.
///
/// `completed` is invoked exactly once per session; the others at most as
/// often as the matching protocol event is observed.
pub trait AnnounceCallback: Send + Sync + 'static {
    /// A reply noderef was accepted into the peer set.
    fn added_node(&self, peer: PeerId);
    /// A valid reply noderef was offered and refused.
    fn node_not_added(&self);
    /// A hop reported the announced node as not wanted.
    fn node_not_wanted(&self);
    /// The hop we were waiting on is considered lost.
    fn node_failed(&self, peer: PeerId, reason: &str);
    /// A reply failed validation; the session continues.
    fn bogus_noderef(&self, reason: &str);
    /// Routing ran out of candidate peers.
    fn no_more_nodes(&self);
    /// The session is finished, whatever the outcome.
    fn completed(&self);
}

/// Shared callback handle.
pub type CallbackHandle = Arc<dyn AnnounceCallback>;

/// Everything a callback can observe, as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    AddedNode(PeerId),
    NodeNotAdded,
    NodeNotWanted,
    NodeFailed(PeerId, String),
    BogusNoderef(String),
    NoMoreNodes,
    Completed,
}

/// Callback that forwards every event onto a channel. Used by the demo
/// binary and the scenario tests.
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<CallbackEvent>,
}

impl ChannelCallback {
    pub fn new() -> (CallbackHandle, mpsc::UnboundedReceiver<CallbackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl AnnounceCallback for ChannelCallback {
    fn added_node(&self, peer: PeerId) {
        let _ = self.tx.send(CallbackEvent::AddedNode(peer));
    }

    fn node_not_added(&self) {
        let _ = self.tx.send(CallbackEvent::NodeNotAdded);
    }

    fn node_not_wanted(&self) {
        let _ = self.tx.send(CallbackEvent::NodeNotWanted);
    }

    fn node_failed(&self, peer: PeerId, reason: &str) {
        let _ = self
            .tx
            .send(CallbackEvent::NodeFailed(peer, reason.to_string()));
    }

    fn bogus_noderef(&self, reason: &str) {
        let _ = self.tx.send(CallbackEvent::BogusNoderef(reason.to_string()));
    }

    fn no_more_nodes(&self) {
        let _ = self.tx.send(CallbackEvent::NoMoreNodes);
    }

    fn completed(&self) {
        let _ = self.tx.send(CallbackEvent::Completed);
    }
}
