pub mod announce;
pub mod net;
pub mod peers;
pub mod pool;
pub mod refs;
pub mod ring;
pub mod types;

pub use announce::{
    AnnounceCallback, AnnounceSession, Announcer, AnnouncerStats, CallbackEvent, CallbackHandle,
    ChannelCallback, NodeContext,
};
pub use net::{
    ByteCounter, Envelope, MemoryHub, MemoryTransport, Message, MessageFilter, MessageKind,
    MessagePattern, MessageRouter, RejectCode, Transport, TransportError, WaitOutcome,
};
pub use peers::{HtlPolicy, Peer, PeerTable};
pub use pool::{BucketReader, BucketWriter, PoolError, TempBucket, TempBucketPool};
pub use refs::{validate, NodeRef};
pub use ring::Location;
pub use types::*;
