//! Announcement messaging layer

pub mod bounded;
pub mod counter;
pub mod memory;
pub mod message;
pub mod router;
pub mod transfer;

// Re-exports
pub use bounded::BoundedBytes;
pub use counter::ByteCounter;
pub use memory::{MemoryHub, MemoryTransport};
pub use message::{
    ChunkData, Envelope, Message, MessageKind, RejectCode, MESSAGE_SIZE_LIMIT,
};
pub use router::{
    ChunkEvent, InboundRequest, MessageFilter, MessagePattern, MessageRouter, RouterEvent,
    Transport, TransportError, WaitOutcome,
};
pub use transfer::{padded_length, receive_ref, RefSender};
