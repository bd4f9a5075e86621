//! Announcement engine: session registry and inbound admission.

pub mod callback;
pub mod session;

pub use callback::{AnnounceCallback, CallbackEvent, CallbackHandle, ChannelCallback};
pub use session::AnnounceSession;

use crate::net::{Envelope, InboundRequest, Message, MessageRouter, Transport};
use crate::net::ByteCounter;
use crate::peers::{HtlPolicy, PeerTable};
use crate::pool::TempBucketPool;
use crate::refs::NodeRef;
use crate::ring::Location;
use crate::types::{AnnounceConfig, PeerId, Uid};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything a session needs from its node. Cheap to clone; one per
/// node, shared by every session that node runs.
pub struct NodeContext<T: Transport> {
    pub router: MessageRouter<T>,
    pub peers: PeerTable,
    pub pool: TempBucketPool,
    pub cfg: AnnounceConfig,
    pub htl: HtlPolicy,
    pub my_ref: NodeRef,
    pub opennet_enabled: bool,
}

impl<T: Transport> Clone for NodeContext<T> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
            peers: self.peers.clone(),
            pool: self.pool.clone(),
            cfg: self.cfg.clone(),
            htl: self.htl.clone(),
            my_ref: self.my_ref.clone(),
            opennet_enabled: self.opennet_enabled,
        }
    }
}

/// Running-session snapshot in the usual stats shape.
#[derive(Debug, Clone)]
pub struct AnnouncerStats {
    pub active_sessions: usize,
}

/// Uid registry and session spawner. Inbound dispatch looks sessions up
/// by uid here, which is also what breaks the session/transport/peer
/// reference cycle: no back-pointers live on peer objects.
pub struct Announcer<T: Transport> {
    ctx: NodeContext<T>,
    active: Arc<Mutex<HashSet<Uid>>>,
}

impl<T: Transport> Clone for Announcer<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            active: self.active.clone(),
        }
    }
}

impl<T: Transport> Announcer<T> {
    /// Build the announcer and start serving unclaimed inbound requests.
    pub fn start(ctx: NodeContext<T>, requests: mpsc::UnboundedReceiver<InboundRequest>) -> Self {
        let announcer = Self {
            ctx,
            active: Arc::new(Mutex::new(HashSet::new())),
        };
        let serve = announcer.clone();
        tokio::spawn(async move {
            serve.serve(requests).await;
        });
        announcer
    }

    /// Announce our own noderef toward `target`. With `only_peer` the
    /// first hop is pinned and routing is bypassed.
    pub fn spawn_local(
        &self,
        target: Location,
        callback: CallbackHandle,
        only_peer: Option<PeerId>,
    ) -> Uid {
        let session = AnnounceSession::for_local(self.ctx.clone(), target, callback, only_peer);
        let uid = session.uid();
        info!("[{}] announcing toward {}", uid, target);
        self.spawn(uid, session);
        uid
    }

    pub fn stats(&self) -> AnnouncerStats {
        AnnouncerStats {
            active_sessions: self
                .active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
        }
    }

    fn spawn(&self, uid: Uid, session: AnnounceSession<T>) {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(uid);
        }
        let active = self.active.clone();
        tokio::spawn(async move {
            // Run on an inner task so even a panicking session releases
            // its uid and leaves a trace.
            if let Err(e) = tokio::spawn(session.run()).await {
                warn!("[{}] announcement session aborted: {}", uid, e);
            }
            let mut active = active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(&uid);
        });
    }

    async fn serve(&self, mut requests: mpsc::UnboundedReceiver<InboundRequest>) {
        while let Some(req) = requests.recv().await {
            self.handle_request(req).await;
        }
        debug!("announcer request stream closed");
    }

    async fn handle_request(&self, req: InboundRequest) {
        let InboundRequest { from, env } = req;
        let Envelope { uid, msg } = env;
        let Message::AnnouncementRequest {
            htl,
            nearest_location,
            target_location,
            transfer_uid,
            noderef_length,
            padded_length,
        } = msg
        else {
            debug!("[{}] ignoring non-request inbound from {}", uid, from);
            return;
        };

        let counter = ByteCounter::new();
        if !self.ctx.opennet_enabled {
            let _ = self
                .ctx
                .router
                .send(from, Envelope::new(uid, Message::OpennetDisabled), &counter)
                .await;
            return;
        }

        let already_active = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.contains(&uid)
        };
        if already_active {
            debug!("[{}] loop detected from {}", uid, from);
            let _ = self
                .ctx
                .router
                .send(from, Envelope::new(uid, Message::RejectedLoop), &counter)
                .await;
            return;
        }

        let (Some(nearest), Some(target)) = (
            Location::new(nearest_location),
            Location::new(target_location),
        ) else {
            warn!("[{}] bad locations in request from {}", uid, from);
            return;
        };
        if !Message::transfer_lengths_valid(noderef_length, padded_length) {
            warn!("[{}] bad transfer lengths in request from {}", uid, from);
            return;
        }

        debug!("[{}] admitting announcement from {} (htl {})", uid, from, htl);
        let session = AnnounceSession::for_relay(
            self.ctx.clone(),
            uid,
            from,
            htl,
            nearest,
            target,
            transfer_uid,
            noderef_length,
            padded_length,
        );
        self.spawn(uid, session);
    }
}
