//! Per-announcement session state machine.
//!
//! A session runs to completion on its own task. It routes the announced
//! noderef hop by hop toward the target location: pick the connected peer
//! closest to the target, negotiate admission, upload the noderef body,
//! then sit in the body stage relaying every reply noderef that comes
//! back. Rejections and timeouts backtrack to the routing step with the
//! failed peer excluded; `AnnounceCompleted` moves the session into a
//! bounded drain of late replies.

use super::callback::CallbackHandle;
use super::NodeContext;
use crate::net::{
    receive_ref, Envelope, Message, MessageFilter, MessageKind, MessagePattern, RefSender,
    RejectCode, Transport, WaitOutcome,
};
use crate::net::ByteCounter;
use crate::refs;
use crate::ring::Location;
use crate::types::{Htl, PeerId, Uid};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Which side of the protocol this session serves. An originator feeds a
/// local callback; a forwarder relays everything to its upstream source.
enum Origin {
    Local {
        callback: CallbackHandle,
    },
    Relay {
        source: PeerId,
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    },
}

/// Upstream vanished; nothing further can be reported. The session
/// terminates silently after cleanup.
struct UpstreamGone;

enum AdmitOutcome {
    Accepted,
    Retry,
}

enum BodyOutcome {
    Completed,
    Retry,
    FatalTimeout,
}

pub struct AnnounceSession<T: Transport> {
    ctx: NodeContext<T>,
    uid: Uid,
    target: Location,
    origin: Origin,
    only_peer: Option<PeerId>,
    counter: ByteCounter,

    /// The blob being announced: our own ref (originator) or the one
    /// received from upstream (forwarder).
    announce_ref: Vec<u8>,
    htl: Htl,
    nearest: Location,
    routed_to: HashSet<PeerId>,
    already_forwarded: bool,
    terminal_sent: bool,
}

impl<T: Transport> AnnounceSession<T> {
    /// Originator-mode session announcing this node's own ref.
    pub fn for_local(
        ctx: NodeContext<T>,
        target: Location,
        callback: CallbackHandle,
        only_peer: Option<PeerId>,
    ) -> Self {
        let announce_ref = ctx.my_ref.encode();
        let nearest = ctx.my_ref.location;
        let htl = ctx.htl.max_htl();
        Self {
            ctx,
            uid: Uid::random(),
            target,
            origin: Origin::Local { callback },
            only_peer,
            counter: ByteCounter::new(),
            announce_ref,
            htl,
            nearest,
            routed_to: HashSet::new(),
            already_forwarded: false,
            terminal_sent: false,
        }
    }

    /// Forwarder-mode session for an admitted inbound request. The htl is
    /// clamped to the local ceiling before anything else happens.
    #[allow(clippy::too_many_arguments)]
    pub fn for_relay(
        ctx: NodeContext<T>,
        uid: Uid,
        source: PeerId,
        htl: Htl,
        nearest: Location,
        target: Location,
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    ) -> Self {
        let htl = htl.min(ctx.htl.max_htl());
        Self {
            ctx,
            uid,
            target,
            origin: Origin::Relay {
                source,
                transfer_uid,
                noderef_length,
                padded_length,
            },
            only_peer: None,
            counter: ByteCounter::new(),
            announce_ref: Vec::new(),
            htl,
            nearest,
            routed_to: HashSet::new(),
            already_forwarded: false,
            terminal_sent: false,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn counter(&self) -> ByteCounter {
        self.counter.clone()
    }

    /// Run the session to completion. Every exit path funnels through the
    /// same cleanup: the local callback (if any) sees `completed` exactly
    /// once, and the registry owner drops the uid afterwards.
    pub async fn run(mut self) {
        debug!(
            "[{}] announcement session starting (htl {}, target {})",
            self.uid, self.htl, self.target
        );
        match self.run_inner().await {
            Ok(()) => debug!("[{}] session finished", self.uid),
            Err(UpstreamGone) => {
                debug!("[{}] upstream gone, terminating silently", self.uid);
            }
        }
        if let Origin::Local { callback } = &self.origin {
            callback.completed();
        }
        let (sent, received) = self.counter.totals();
        debug!("[{}] session done: {} bytes out, {} in", self.uid, sent, received);
    }

    async fn run_inner(&mut self) -> Result<(), UpstreamGone> {
        if let Origin::Relay { .. } = self.origin {
            if !self.admit_inbound().await? {
                return Ok(());
            }
        }
        self.apply_htl_entry_rules();
        self.route_loop().await
    }

    // -------------------------------------------------------------------
    // Admission of the inbound request (forwarder mode)
    // -------------------------------------------------------------------

    /// Accept the upstream request and pull its noderef. Returns false if
    /// the session must terminate.
    async fn admit_inbound(&mut self) -> Result<bool, UpstreamGone> {
        let Origin::Relay {
            source,
            transfer_uid,
            noderef_length,
            padded_length,
        } = &self.origin
        else {
            return Ok(true);
        };
        let (source, transfer_uid, noderef_length, padded_length) =
            (*source, *transfer_uid, *noderef_length, *padded_length);

        self.send_upstream(Message::Accepted).await?;

        let Some(bytes) = self
            .receive_into_bucket(source, transfer_uid, noderef_length, padded_length)
            .await
        else {
            warn!("[{}] inbound noderef transfer from {} failed", self.uid, source);
            self.send_upstream(Message::NoderefRejected {
                code: RejectCode::TimeoutTransfer,
            })
            .await?;
            self.send_terminal(Message::AnnounceCompleted).await;
            return Ok(false);
        };

        match refs::validate(&bytes) {
            None => {
                warn!("[{}] inbound noderef from {} is malformed", self.uid, source);
                self.send_upstream(Message::NoderefRejected {
                    code: RejectCode::Invalid,
                })
                .await?;
                self.send_terminal(Message::AnnounceCompleted).await;
                Ok(false)
            }
            Some(parsed) => {
                if self.ctx.peers.add_new_opennet_node(&parsed).is_some() {
                    // The announced node is now our peer; our own ref goes
                    // back as the first reply the source sees.
                    let my_ref = self.ctx.my_ref.encode();
                    self.send_reply_upstream(&my_ref).await?;
                } else {
                    self.send_upstream(Message::NodeNotWanted).await?;
                }
                self.announce_ref = bytes;
                Ok(true)
            }
        }
    }

    // -------------------------------------------------------------------
    // HTL rules on entry
    // -------------------------------------------------------------------

    /// Closer-than-ever reset, otherwise the per-hop decrement.
    fn apply_htl_entry_rules(&mut self) {
        let my_loc = self.ctx.my_ref.location;
        if my_loc.distance(self.target) < self.nearest.distance(self.target) {
            debug!(
                "[{}] {} beats nearest {}, resetting htl to {}",
                self.uid,
                my_loc,
                self.nearest,
                self.ctx.htl.max_htl()
            );
            self.nearest = my_loc;
            self.htl = self.ctx.htl.max_htl();
        } else if matches!(self.origin, Origin::Relay { .. }) {
            self.htl = self.ctx.htl.decrement(self.htl);
        }
    }

    // -------------------------------------------------------------------
    // Routing loop
    // -------------------------------------------------------------------

    fn pick_next(&self) -> Option<PeerId> {
        if let Some(pinned) = self.only_peer {
            if self.routed_to.contains(&pinned) {
                return None;
            }
            return Some(pinned);
        }
        let source = match self.origin {
            Origin::Relay { source, .. } => Some(source),
            Origin::Local { .. } => None,
        };
        self.ctx
            .peers
            .pick_closer(source, &self.routed_to, self.target, false)
    }

    async fn route_loop(&mut self) -> Result<(), UpstreamGone> {
        // Set when the previous attempt died on the wire before reaching
        // the peer; that retry must not pay a second decrement.
        let mut skip_decrement = false;

        loop {
            if self.htl == 0 {
                debug!("[{}] htl exhausted", self.uid);
                self.send_terminal(Message::AnnounceCompleted).await;
                return Ok(());
            }

            let Some(next) = self.pick_next() else {
                debug!("[{}] no routable peer left (htl {})", self.uid, self.htl);
                if let Origin::Local { callback } = &self.origin {
                    callback.no_more_nodes();
                } else {
                    let htl = self.htl;
                    self.send_terminal(Message::RouteNotFound { htl }).await;
                }
                return Ok(());
            };

            if self.already_forwarded && !skip_decrement {
                self.htl = self.ctx.htl.decrement(self.htl);
            }
            skip_decrement = false;

            let transfer_uid: u64 = rand::random();
            let mut sender = RefSender::new(
                self.ctx.router.clone(),
                next,
                self.uid,
                transfer_uid,
                &self.announce_ref,
                self.counter.clone(),
            );
            let header = Message::AnnouncementRequest {
                htl: self.htl,
                nearest_location: self.nearest.value(),
                target_location: self.target.value(),
                transfer_uid,
                noderef_length: sender.noderef_length(),
                padded_length: sender.padded_length(),
            };

            debug!("[{}] routing to {} at htl {}", self.uid, next, self.htl);
            let sent = self
                .ctx
                .router
                .send(next, Envelope::new(self.uid, header), &self.counter)
                .await
                .is_ok()
                && sender.start().await.is_ok();
            if !sent {
                debug!("[{}] {} unreachable, trying another peer", self.uid, next);
                self.routed_to.insert(next);
                skip_decrement = true;
                continue;
            }

            self.already_forwarded = true;
            self.routed_to.insert(next);

            match self.await_admit(next).await {
                AdmitOutcome::Retry => continue,
                AdmitOutcome::Accepted => {}
            }

            if sender.finish().await.is_err() {
                debug!("[{}] {} dropped mid-upload", self.uid, next);
                continue;
            }

            match self.await_body(next).await? {
                BodyOutcome::Retry => continue,
                BodyOutcome::Completed => {
                    self.send_terminal(Message::AnnounceCompleted).await;
                    self.drain_replies(next).await?;
                    return Ok(());
                }
                BodyOutcome::FatalTimeout => {
                    // The remote accepted and then went dark for the whole
                    // body window; assume it lost and give up entirely.
                    warn!("[{}] {} timed out after accepting", self.uid, next);
                    self.send_terminal(Message::RejectedOverload { is_local: true })
                        .await;
                    if let Origin::Local { callback } = &self.origin {
                        callback.node_failed(next, "timed out");
                    }
                    return Ok(());
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Hop state machines
    // -------------------------------------------------------------------

    async fn await_admit(&mut self, next: PeerId) -> AdmitOutcome {
        let timeout = self.ctx.cfg.accept_timeout;
        let filter = MessageFilter::new(vec![
            MessagePattern::new(MessageKind::Accepted, next, self.uid, timeout),
            MessagePattern::new(MessageKind::RejectedLoop, next, self.uid, timeout),
            MessagePattern::new(MessageKind::RejectedOverload, next, self.uid, timeout),
            MessagePattern::new(MessageKind::OpennetDisabled, next, self.uid, timeout),
        ]);
        match self.ctx.router.wait_for(filter, &self.counter).await {
            WaitOutcome::Matched { env, .. } => match env.msg {
                Message::Accepted => AdmitOutcome::Accepted,
                other => {
                    debug!(
                        "[{}] {} refused admission: {}",
                        self.uid,
                        next,
                        other.command()
                    );
                    AdmitOutcome::Retry
                }
            },
            WaitOutcome::TimedOut => {
                debug!("[{}] {} admission timed out", self.uid, next);
                AdmitOutcome::Retry
            }
            WaitOutcome::Disconnected(_) => AdmitOutcome::Retry,
        }
    }

    fn body_filter(&self, next: PeerId) -> MessageFilter {
        let timeout = self.ctx.cfg.body_timeout;
        MessageFilter::new(vec![
            MessagePattern::new(MessageKind::AnnounceCompleted, next, self.uid, timeout),
            MessagePattern::new(MessageKind::RouteNotFound, next, self.uid, timeout),
            MessagePattern::new(MessageKind::RejectedOverload, next, self.uid, timeout),
            MessagePattern::new(MessageKind::AnnounceReply, next, self.uid, timeout),
            MessagePattern::new(MessageKind::OpennetDisabled, next, self.uid, timeout),
            MessagePattern::new(MessageKind::NodeNotWanted, next, self.uid, timeout),
            MessagePattern::new(
                MessageKind::NoderefRejected,
                next,
                self.uid,
                self.ctx.cfg.reject_timeout,
            ),
        ])
    }

    async fn await_body(&mut self, next: PeerId) -> Result<BodyOutcome, UpstreamGone> {
        loop {
            let outcome = self
                .ctx
                .router
                .wait_for(self.body_filter(next), &self.counter)
                .await;
            match outcome {
                WaitOutcome::Matched { env, .. } => match env.msg {
                    Message::NoderefRejected { code } => {
                        warn!("[{}] {} rejected our noderef: {}", self.uid, next, code);
                        return Ok(BodyOutcome::Retry);
                    }
                    Message::RouteNotFound { htl } => {
                        // The subtree died at that depth; no point keeping
                        // more hops than it had.
                        self.htl = self.htl.min(htl);
                        return Ok(BodyOutcome::Retry);
                    }
                    Message::RejectedOverload { .. } => return Ok(BodyOutcome::Retry),
                    Message::OpennetDisabled => return Ok(BodyOutcome::Retry),
                    Message::AnnounceReply {
                        transfer_uid,
                        noderef_length,
                        padded_length,
                    } => {
                        self.handle_reply(next, transfer_uid, noderef_length, padded_length)
                            .await?;
                    }
                    Message::NodeNotWanted => {
                        self.handle_not_wanted().await?;
                    }
                    Message::AnnounceCompleted => return Ok(BodyOutcome::Completed),
                    other => {
                        debug!(
                            "[{}] ignoring unexpected {} in body stage",
                            self.uid,
                            other.command()
                        );
                    }
                },
                WaitOutcome::TimedOut => return Ok(BodyOutcome::FatalTimeout),
                WaitOutcome::Disconnected(_) => return Ok(BodyOutcome::Retry),
            }
        }
    }

    /// Late-reply drain, capped at an absolute deadline anchored when the
    /// filter is first armed.
    async fn drain_replies(&mut self, next: PeerId) -> Result<(), UpstreamGone> {
        let timeout = self.ctx.cfg.drain_timeout;
        let filter = MessageFilter::new(vec![
            MessagePattern::new(MessageKind::AnnounceReply, next, self.uid, timeout)
                .from_creation(),
            MessagePattern::new(MessageKind::NodeNotWanted, next, self.uid, timeout)
                .from_creation(),
        ]);
        loop {
            match self
                .ctx
                .router
                .wait_for(filter.clone(), &self.counter)
                .await
            {
                WaitOutcome::Matched { env, .. } => match env.msg {
                    Message::AnnounceReply {
                        transfer_uid,
                        noderef_length,
                        padded_length,
                    } => {
                        self.handle_reply(next, transfer_uid, noderef_length, padded_length)
                            .await?;
                    }
                    Message::NodeNotWanted => {
                        self.handle_not_wanted().await?;
                    }
                    other => {
                        debug!(
                            "[{}] ignoring {} during drain",
                            self.uid,
                            other.command()
                        );
                    }
                },
                WaitOutcome::TimedOut => {
                    debug!("[{}] reply drain finished", self.uid);
                    return Ok(());
                }
                WaitOutcome::Disconnected(_) => {
                    debug!("[{}] {} gone during drain", self.uid, next);
                    return Ok(());
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Reply handling
    // -------------------------------------------------------------------

    async fn handle_reply(
        &mut self,
        from: PeerId,
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    ) -> Result<(), UpstreamGone> {
        let Some(bytes) = self
            .receive_into_bucket(from, transfer_uid, noderef_length, padded_length)
            .await
        else {
            debug!("[{}] reply transfer {:016x} failed", self.uid, transfer_uid);
            return Ok(());
        };

        let Some(parsed) = refs::validate(&bytes) else {
            debug!("[{}] reply noderef failed validation", self.uid);
            if let Origin::Local { callback } = &self.origin {
                callback.bogus_noderef("validation failed");
            }
            return Ok(());
        };

        match &self.origin {
            Origin::Relay { .. } => {
                debug!(
                    "[{}] relaying reply {} upstream",
                    self.uid,
                    parsed.fingerprint()
                );
                self.send_reply_upstream(&bytes).await
            }
            Origin::Local { callback } => {
                match self.ctx.peers.add_new_opennet_node(&parsed) {
                    Some(peer) => {
                        info!("[{}] announcement gained peer {}", self.uid, peer);
                        callback.added_node(peer);
                    }
                    None => callback.node_not_added(),
                }
                Ok(())
            }
        }
    }

    async fn handle_not_wanted(&mut self) -> Result<(), UpstreamGone> {
        match &self.origin {
            Origin::Local { callback } => {
                callback.node_not_wanted();
                Ok(())
            }
            // Relayed once per observation; a chatty downstream means a
            // chatty relay.
            Origin::Relay { .. } => self.send_upstream(Message::NodeNotWanted).await,
        }
    }

    // -------------------------------------------------------------------
    // Upstream plumbing
    // -------------------------------------------------------------------

    async fn send_upstream(&self, msg: Message) -> Result<(), UpstreamGone> {
        let Origin::Relay { source, .. } = &self.origin else {
            return Ok(());
        };
        self.ctx
            .router
            .send(*source, Envelope::new(self.uid, msg), &self.counter)
            .await
            .map_err(|_| UpstreamGone)
    }

    /// Exactly one terminal goes upstream per session; later calls are
    /// dropped. Failures are swallowed; the session is ending either way.
    async fn send_terminal(&mut self, msg: Message) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        if let Origin::Relay { source, .. } = &self.origin {
            if self
                .ctx
                .router
                .send(*source, Envelope::new(self.uid, msg), &self.counter)
                .await
                .is_err()
            {
                debug!("[{}] upstream gone before terminal", self.uid);
            }
        }
    }

    /// Forward a noderef blob upstream as an AnnounceReply + transfer.
    async fn send_reply_upstream(&self, blob: &[u8]) -> Result<(), UpstreamGone> {
        let Origin::Relay { source, .. } = &self.origin else {
            return Ok(());
        };
        let source = *source;
        let transfer_uid: u64 = rand::random();
        let mut sender = RefSender::new(
            self.ctx.router.clone(),
            source,
            self.uid,
            transfer_uid,
            blob,
            self.counter.clone(),
        );
        let header = Message::AnnounceReply {
            transfer_uid,
            noderef_length: sender.noderef_length(),
            padded_length: sender.padded_length(),
        };
        self.ctx
            .router
            .send(source, Envelope::new(self.uid, header), &self.counter)
            .await
            .map_err(|_| UpstreamGone)?;
        sender.start().await.map_err(|_| UpstreamGone)?;
        sender.finish().await.map_err(|_| UpstreamGone)
    }

    /// Pull a transfer through the bucket pool, returning the blob. Every
    /// noderef buffer the session holds is pool-allocated so the pool's
    /// budget and migration rules apply to announcement traffic too.
    async fn receive_into_bucket(
        &self,
        from: PeerId,
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    ) -> Option<Vec<u8>> {
        let bytes = receive_ref(
            &self.ctx.router,
            from,
            self.uid,
            transfer_uid,
            noderef_length,
            padded_length,
            self.ctx.cfg.transfer_timeout,
            &self.counter,
        )
        .await?;

        let bucket = match self.ctx.pool.make(bytes.len() as u64) {
            Ok(b) => b,
            Err(e) => {
                warn!("[{}] bucket allocation failed: {}", self.uid, e);
                return None;
            }
        };
        let stored = (|| -> std::io::Result<Vec<u8>> {
            use std::io::Write;
            let mut w = bucket.open_write().map_err(std::io::Error::other)?;
            w.write_all(&bytes)?;
            drop(w);
            bucket.read_to_vec()
        })();
        bucket.free();
        match stored {
            Ok(blob) => Some(blob),
            Err(e) => {
                warn!("[{}] bucket transfer staging failed: {}", self.uid, e);
                None
            }
        }
    }
}
