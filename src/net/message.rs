//! Announcement wire messages

use super::bounded::BoundedBytes;
use crate::types::{Htl, Uid, MAX_NODEREF_SIZE, REF_CHUNK_SIZE};
use serde::{Deserialize, Serialize};

/// Outer cap on any serialized envelope. Individual message types have
/// tighter limits via `max_size_for_command`.
pub const MESSAGE_SIZE_LIMIT: usize = 2 * REF_CHUNK_SIZE;

/// Chunk payloads are bounded at deserialization.
pub type ChunkData = BoundedBytes<REF_CHUNK_SIZE>;

/// Why a downstream node refused an announced noderef.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// The blob failed validation.
    Invalid,
    /// Refused for now; the sender may announce again later.
    Shortly,
    /// The bulk transfer stalled past its window.
    TimeoutTransfer,
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectCode::Invalid => write!(f, "invalid"),
            RejectCode::Shortly => write!(f, "shortly"),
            RejectCode::TimeoutTransfer => write!(f, "timeout_transfer"),
        }
    }
}

/// Announcement protocol messages. Every envelope also carries the session
/// uid (see [`Envelope`]); these are the payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request to admit an announcement, followed by the noderef bulk
    /// transfer under `transfer_uid`.
    AnnouncementRequest {
        htl: Htl,
        nearest_location: f64,
        target_location: f64,
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    },
    /// Admission granted; body may follow.
    Accepted,
    /// The uid was already seen on this path.
    RejectedLoop,
    /// The hop (or, with `is_local`, the sender itself) is overloaded.
    RejectedOverload { is_local: bool },
    /// The hop does not participate in the open network.
    OpennetDisabled,
    /// A collected noderef follows as a bulk transfer under `transfer_uid`.
    AnnounceReply {
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    },
    /// The downstream subtree finished; only late replies may follow.
    AnnounceCompleted,
    /// No onward route at the remaining htl.
    RouteNotFound { htl: Htl },
    /// The announced node was valid but not wanted as a peer.
    NodeNotWanted,
    /// The announced noderef was refused.
    NoderefRejected { code: RejectCode },
    /// Bulk-transfer carrier. `index` is the chunk's offset in units of
    /// `REF_CHUNK_SIZE` within the padded blob.
    RefChunk {
        transfer_uid: u64,
        index: u32,
        data: ChunkData,
    },
}

/// A message together with its session uid, as it travels the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub uid: Uid,
    pub msg: Message,
}

impl Envelope {
    pub fn new(uid: Uid, msg: Message) -> Self {
        Self { uid, msg }
    }
}

/// Discriminant used by message filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AnnouncementRequest,
    Accepted,
    RejectedLoop,
    RejectedOverload,
    OpennetDisabled,
    AnnounceReply,
    AnnounceCompleted,
    RouteNotFound,
    NodeNotWanted,
    NoderefRejected,
    RefChunk,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AnnouncementRequest { .. } => MessageKind::AnnouncementRequest,
            Message::Accepted => MessageKind::Accepted,
            Message::RejectedLoop => MessageKind::RejectedLoop,
            Message::RejectedOverload { .. } => MessageKind::RejectedOverload,
            Message::OpennetDisabled => MessageKind::OpennetDisabled,
            Message::AnnounceReply { .. } => MessageKind::AnnounceReply,
            Message::AnnounceCompleted => MessageKind::AnnounceCompleted,
            Message::RouteNotFound { .. } => MessageKind::RouteNotFound,
            Message::NodeNotWanted => MessageKind::NodeNotWanted,
            Message::NoderefRejected { .. } => MessageKind::NoderefRejected,
            Message::RefChunk { .. } => MessageKind::RefChunk,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::AnnouncementRequest { .. } => "announcerequest",
            Message::Accepted => "accepted",
            Message::RejectedLoop => "rejectedloop",
            Message::RejectedOverload { .. } => "rejectedoverload",
            Message::OpennetDisabled => "opennetdisabled",
            Message::AnnounceReply { .. } => "announcereply",
            Message::AnnounceCompleted => "announcecompleted",
            Message::RouteNotFound { .. } => "routenotfound",
            Message::NodeNotWanted => "nodenotwanted",
            Message::NoderefRejected { .. } => "noderefrejected",
            Message::RefChunk { .. } => "refchunk",
        }
    }

    pub fn max_size_for_command(command: &str) -> usize {
        match command {
            "announcerequest" => 64,
            "accepted" => 16,
            "rejectedloop" => 16,
            "rejectedoverload" => 16,
            "opennetdisabled" => 16,
            "announcereply" => 48,
            "announcecompleted" => 16,
            "routenotfound" => 16,
            "nodenotwanted" => 16,
            "noderefrejected" => 16,
            "refchunk" => REF_CHUNK_SIZE + 32,
            _ => MESSAGE_SIZE_LIMIT,
        }
    }

    pub fn validate_size(&self, actual_size: usize) -> bool {
        actual_size <= Self::max_size_for_command(self.command())
    }

    /// Sanity bounds on declared transfer lengths, checked before any
    /// buffer is allocated for the transfer.
    pub fn transfer_lengths_valid(noderef_length: u32, padded_length: u32) -> bool {
        let nr = noderef_length as usize;
        let pad = padded_length as usize;
        nr > 0 && nr <= pad && pad <= MAX_NODEREF_SIZE && pad % REF_CHUNK_SIZE == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new(
            Uid(7),
            Message::AnnouncementRequest {
                htl: 10,
                nearest_location: 0.3,
                target_location: 0.5,
                transfer_uid: 99,
                noderef_length: 100,
                padded_length: 1024,
            },
        );
        let bytes = postcard::to_allocvec(&env).unwrap();
        let back: Envelope = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back.uid, Uid(7));
        assert_eq!(back.msg.kind(), MessageKind::AnnouncementRequest);
        assert!(env.msg.validate_size(bytes.len()));
    }

    #[test]
    fn test_largest_chunk_passes_size_table() {
        let env = Envelope::new(
            Uid(1),
            Message::RefChunk {
                transfer_uid: 5,
                index: 0,
                data: ChunkData::new_unchecked(vec![0xaa; REF_CHUNK_SIZE]),
            },
        );
        let mut bytes = postcard::to_allocvec(&env).unwrap();
        let back: Envelope = postcard::from_bytes(&bytes).unwrap();
        assert!(back.msg.validate_size(bytes.len()));
        // Trailing garbage is a decode error under postcard
        bytes.push(0);
        assert!(postcard::from_bytes::<Envelope>(&bytes).is_err());
    }

    #[test]
    fn test_transfer_lengths() {
        assert!(Message::transfer_lengths_valid(100, 1024));
        assert!(Message::transfer_lengths_valid(1024, 1024));
        assert!(!Message::transfer_lengths_valid(0, 1024));
        assert!(!Message::transfer_lengths_valid(2000, 1024));
        assert!(!Message::transfer_lengths_valid(100, 1000));
        assert!(!Message::transfer_lengths_valid(
            100,
            (MAX_NODEREF_SIZE + REF_CHUNK_SIZE) as u32
        ));
    }
}
