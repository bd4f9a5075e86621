//! Bulk transfer of padded noderef blobs.
//!
//! A transfer is a sequence of fixed-size [`Message::RefChunk`] frames
//! correlated by a transfer uid carried in the announcing header. The blob
//! is padded to the next `REF_CHUNK_SIZE` boundary with random fill so its
//! exact length is not visible on the wire; the receiver discards the
//! padding. Chunks carry explicit indices, so out-of-order or duplicate
//! delivery is tolerated.

use super::counter::ByteCounter;
use super::message::{ChunkData, Envelope, Message};
use super::router::{ChunkEvent, MessageRouter, Transport, TransportError};
use crate::types::{PeerId, Uid, MAX_REF_CHUNKS, REF_CHUNK_SIZE};
use rand::RngCore;
use std::time::Duration;
use tracing::debug;

/// Padded length for a blob of `len` bytes: the next multiple of
/// `REF_CHUNK_SIZE`, never zero.
pub fn padded_length(len: usize) -> usize {
    let blocks = len.div_ceil(REF_CHUNK_SIZE).max(1);
    blocks * REF_CHUNK_SIZE
}

/// Outbound transfer. `start` pushes the first chunk so the receiving hop
/// can begin admission checks on a prefix; `finish` drains the rest once
/// the hop has accepted.
pub struct RefSender<T: Transport> {
    router: MessageRouter<T>,
    peer: PeerId,
    uid: Uid,
    transfer_uid: u64,
    padded: Vec<u8>,
    noderef_length: u32,
    next_chunk: usize,
    counter: ByteCounter,
}

impl<T: Transport> RefSender<T> {
    pub fn new(
        router: MessageRouter<T>,
        peer: PeerId,
        uid: Uid,
        transfer_uid: u64,
        blob: &[u8],
        counter: ByteCounter,
    ) -> Self {
        let mut padded = blob.to_vec();
        let target = padded_length(blob.len());
        let mut pad = vec![0u8; target - padded.len()];
        rand::thread_rng().fill_bytes(&mut pad);
        padded.extend_from_slice(&pad);

        Self {
            router,
            peer,
            uid,
            transfer_uid,
            padded,
            noderef_length: blob.len() as u32,
            next_chunk: 0,
            counter,
        }
    }

    pub fn noderef_length(&self) -> u32 {
        self.noderef_length
    }

    pub fn padded_length(&self) -> u32 {
        self.padded.len() as u32
    }

    pub fn transfer_uid(&self) -> u64 {
        self.transfer_uid
    }

    fn chunk_count(&self) -> usize {
        self.padded.len() / REF_CHUNK_SIZE
    }

    async fn send_chunk(&mut self) -> Result<(), TransportError> {
        let i = self.next_chunk;
        let data = self.padded[i * REF_CHUNK_SIZE..(i + 1) * REF_CHUNK_SIZE].to_vec();
        let env = Envelope::new(
            self.uid,
            Message::RefChunk {
                transfer_uid: self.transfer_uid,
                index: i as u32,
                data: ChunkData::new_unchecked(data),
            },
        );
        self.router.send(self.peer, env, &self.counter).await?;
        self.next_chunk += 1;
        Ok(())
    }

    /// Send the first chunk. Call immediately after the header message.
    pub async fn start(&mut self) -> Result<(), TransportError> {
        if self.next_chunk == 0 {
            self.send_chunk().await?;
        }
        Ok(())
    }

    /// Send every remaining chunk, blocking on transport backpressure.
    pub async fn finish(&mut self) -> Result<(), TransportError> {
        while self.next_chunk < self.chunk_count() {
            self.send_chunk().await?;
        }
        Ok(())
    }
}

/// Receive a transfer announced as `{noderef_length, padded_length}` from
/// `peer`. Returns the unpadded bytes, or None on disconnect, timeout or a
/// hostile length declaration.
pub async fn receive_ref<T: Transport>(
    router: &MessageRouter<T>,
    peer: PeerId,
    uid: Uid,
    transfer_uid: u64,
    noderef_length: u32,
    padded_length: u32,
    timeout: Duration,
    counter: &ByteCounter,
) -> Option<Vec<u8>> {
    if !Message::transfer_lengths_valid(noderef_length, padded_length) {
        debug!(
            "[{}] rejecting transfer {:016x}: bad lengths {}/{}",
            uid, transfer_uid, noderef_length, padded_length
        );
        return None;
    }
    let chunk_count = padded_length as usize / REF_CHUNK_SIZE;
    if chunk_count > MAX_REF_CHUNKS {
        return None;
    }

    let mut rx = router.register_transfer(transfer_uid, peer, counter);
    let result = receive_chunks(&mut rx, uid, transfer_uid, chunk_count, timeout).await;
    router.unregister_transfer(transfer_uid);

    result.map(|mut padded| {
        padded.truncate(noderef_length as usize);
        padded
    })
}

async fn receive_chunks(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<ChunkEvent>,
    uid: Uid,
    transfer_uid: u64,
    chunk_count: usize,
    timeout: Duration,
) -> Option<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = vec![0u8; chunk_count * REF_CHUNK_SIZE];
    let mut have = vec![false; chunk_count];
    let mut remaining = chunk_count;

    while remaining > 0 {
        let event = tokio::select! {
            ev = rx.recv() => ev?,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("[{}] transfer {:016x} timed out", uid, transfer_uid);
                return None;
            }
        };
        match event {
            ChunkEvent::Chunk { index, data } => {
                let i = index as usize;
                if i >= chunk_count || data.len() != REF_CHUNK_SIZE {
                    debug!(
                        "[{}] transfer {:016x}: ignoring malformed chunk {} ({} bytes)",
                        uid,
                        transfer_uid,
                        index,
                        data.len()
                    );
                    continue;
                }
                if !have[i] {
                    have[i] = true;
                    remaining -= 1;
                    buf[i * REF_CHUNK_SIZE..(i + 1) * REF_CHUNK_SIZE].copy_from_slice(&data);
                }
            }
            ChunkEvent::Disconnected => {
                debug!("[{}] transfer {:016x}: peer disconnected", uid, transfer_uid);
                return None;
            }
        }
    }
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::MemoryHub;
    use std::sync::Arc;

    fn two_nodes() -> (
        MessageRouter<crate::net::memory::MemoryTransport>,
        MessageRouter<crate::net::memory::MemoryTransport>,
    ) {
        let hub = MemoryHub::new();
        let (ta, ea) = hub.register(PeerId(1));
        let (tb, eb) = hub.register(PeerId(2));
        hub.connect(PeerId(1), PeerId(2));
        let (ra, _) = MessageRouter::start(Arc::new(ta), ea);
        let (rb, _) = MessageRouter::start(Arc::new(tb), eb);
        (ra, rb)
    }

    #[test]
    fn test_padded_length() {
        assert_eq!(padded_length(0), REF_CHUNK_SIZE);
        assert_eq!(padded_length(1), REF_CHUNK_SIZE);
        assert_eq!(padded_length(REF_CHUNK_SIZE), REF_CHUNK_SIZE);
        assert_eq!(padded_length(REF_CHUNK_SIZE + 1), 2 * REF_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_transfer_roundtrip() {
        let (ra, rb) = two_nodes();
        let blob: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let uid = Uid(42);
        let counter = ByteCounter::new();

        let mut sender = RefSender::new(
            ra.clone(),
            PeerId(2),
            uid,
            0xbeef,
            &blob,
            counter.clone(),
        );
        assert_eq!(sender.noderef_length(), 2500);
        assert_eq!(sender.padded_length(), 3 * REF_CHUNK_SIZE as u32);

        let recv_counter = ByteCounter::new();
        let receiver = {
            let rb = rb.clone();
            let recv_counter = recv_counter.clone();
            tokio::spawn(async move {
                receive_ref(
                    &rb,
                    PeerId(1),
                    uid,
                    0xbeef,
                    2500,
                    3 * REF_CHUNK_SIZE as u32,
                    Duration::from_secs(5),
                    &recv_counter,
                )
                .await
            })
        };

        tokio::task::yield_now().await;
        sender.start().await.unwrap();
        sender.finish().await.unwrap();

        let got = receiver.await.unwrap().expect("transfer completes");
        assert_eq!(got, blob);
        assert!(counter.sent() >= 3 * REF_CHUNK_SIZE as u64);
        assert!(recv_counter.received() >= 3 * REF_CHUNK_SIZE as u64);
    }

    #[tokio::test]
    async fn test_receive_rejects_bad_lengths() {
        let (_ra, rb) = two_nodes();
        let counter = ByteCounter::new();
        // padded not a multiple of the chunk size
        let got = receive_ref(
            &rb,
            PeerId(1),
            Uid(1),
            1,
            10,
            1000,
            Duration::from_secs(1),
            &counter,
        )
        .await;
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_without_chunks() {
        let (_ra, rb) = two_nodes();
        let counter = ByteCounter::new();
        let got = receive_ref(
            &rb,
            PeerId(1),
            Uid(1),
            7,
            100,
            REF_CHUNK_SIZE as u32,
            Duration::from_secs(2),
            &counter,
        )
        .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_receive_aborts_on_disconnect() {
        let hub = MemoryHub::new();
        let (_ta, _ea) = hub.register(PeerId(1));
        let (tb, eb) = hub.register(PeerId(2));
        hub.connect(PeerId(1), PeerId(2));
        let (rb, _) = MessageRouter::start(Arc::new(tb), eb);

        let receiver = {
            let rb = rb.clone();
            tokio::spawn(async move {
                receive_ref(
                    &rb,
                    PeerId(1),
                    Uid(1),
                    9,
                    100,
                    REF_CHUNK_SIZE as u32,
                    Duration::from_secs(30),
                    &ByteCounter::new(),
                )
                .await
            })
        };

        tokio::task::yield_now().await;
        hub.disconnect(PeerId(1), PeerId(2));
        assert!(receiver.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_order_chunks() {
        let hub = MemoryHub::new();
        let (ta, _ea) = hub.register(PeerId(1));
        let (tb, eb) = hub.register(PeerId(2));
        hub.connect(PeerId(1), PeerId(2));
        let (rb, _) = MessageRouter::start(Arc::new(tb), eb);

        let blob: Vec<u8> = (0..(2 * REF_CHUNK_SIZE) as u32).map(|i| i as u8).collect();
        let receiver = {
            let rb = rb.clone();
            tokio::spawn(async move {
                receive_ref(
                    &rb,
                    PeerId(1),
                    Uid(1),
                    11,
                    (2 * REF_CHUNK_SIZE) as u32,
                    (2 * REF_CHUNK_SIZE) as u32,
                    Duration::from_secs(5),
                    &ByteCounter::new(),
                )
                .await
            })
        };
        tokio::task::yield_now().await;

        let chunk = |i: usize| {
            Envelope::new(
                Uid(1),
                Message::RefChunk {
                    transfer_uid: 11,
                    index: i as u32,
                    data: ChunkData::new_unchecked(
                        blob[i * REF_CHUNK_SIZE..(i + 1) * REF_CHUNK_SIZE].to_vec(),
                    ),
                },
            )
        };
        // Second chunk first, then a duplicate, then the first.
        ta.push(PeerId(2), chunk(1));
        ta.push(PeerId(2), chunk(1));
        ta.push(PeerId(2), chunk(0));

        let got = receiver.await.unwrap().expect("reassembles");
        assert_eq!(got, blob);
    }

    // A chunk for a transfer nobody registered must not disturb a later
    // transfer that reuses the same uid.
    #[tokio::test]
    async fn test_unclaimed_chunks_dropped() {
        let hub = MemoryHub::new();
        let (ta, _ea) = hub.register(PeerId(1));
        let (tb, eb) = hub.register(PeerId(2));
        hub.connect(PeerId(1), PeerId(2));
        let (rb, _reqs) = MessageRouter::start(Arc::new(tb), eb);

        let stray = Envelope::new(
            Uid(1),
            Message::RefChunk {
                transfer_uid: 999,
                index: 5,
                data: ChunkData::new_unchecked(vec![0xffu8; REF_CHUNK_SIZE]),
            },
        );
        ta.push(PeerId(2), stray);
        tokio::task::yield_now().await;

        let blob = vec![7u8; REF_CHUNK_SIZE];
        let receiver = {
            let rb = rb.clone();
            tokio::spawn(async move {
                receive_ref(
                    &rb,
                    PeerId(1),
                    Uid(1),
                    999,
                    REF_CHUNK_SIZE as u32,
                    REF_CHUNK_SIZE as u32,
                    Duration::from_secs(5),
                    &ByteCounter::new(),
                )
                .await
            })
        };
        tokio::task::yield_now().await;
        ta.push(
            PeerId(2),
            Envelope::new(
                Uid(1),
                Message::RefChunk {
                    transfer_uid: 999,
                    index: 0,
                    data: ChunkData::new_unchecked(blob.clone()),
                },
            ),
        );
        assert_eq!(receiver.await.unwrap().unwrap(), blob);
    }
}
