//! Noderef encoding, parsing and structural validation.
//!
//! A noderef is the self-describing descriptor a node announces into the
//! open network: identity, keyspace location and transport hints, followed
//! by a SHA3-256 digest over the descriptor bytes. Signature verification
//! happens in the external verifier; this module only guarantees that a
//! blob is well-formed and untampered before it is offered to the peer set
//! or relayed further.

use crate::ring::Location;
use crate::types::{PeerId, MAX_NODEREF_SIZE};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tracing::debug;

const DIGEST_LEN: usize = 32;

/// Parsed structured form of a noderef.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: PeerId,
    pub location: Location,
    /// Opaque transport hints (addresses, key fingerprints). Carried
    /// verbatim; the engine never interprets them.
    pub hints: Vec<u8>,
}

impl NodeRef {
    pub fn new(id: PeerId, location: Location, hints: Vec<u8>) -> Self {
        Self { id, location, hints }
    }

    /// Serialize to the wire blob: postcard body + SHA3-256 digest.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = postcard::to_allocvec(self).expect("noderef serializes");
        let digest = Sha3_256::digest(&body);
        body.extend_from_slice(&digest);
        body
    }

    /// Short digest fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        let body = postcard::to_allocvec(self).expect("noderef serializes");
        let digest = Sha3_256::digest(&body);
        hex::encode(&digest[..8])
    }
}

/// Validate a received blob: bounds, digest, structure.
///
/// Returns None on any defect; the caller decides whether that is a
/// protocol violation or merely a bogus reply to skip.
pub fn validate(bytes: &[u8]) -> Option<NodeRef> {
    if bytes.len() <= DIGEST_LEN || bytes.len() > MAX_NODEREF_SIZE {
        debug!("noderef rejected: bad length {}", bytes.len());
        return None;
    }
    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    let expect = Sha3_256::digest(body);
    if digest != expect.as_slice() {
        debug!("noderef rejected: digest mismatch");
        return None;
    }
    match postcard::from_bytes::<NodeRef>(body) {
        Ok(r) => Some(r),
        Err(e) => {
            debug!("noderef rejected: parse failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeRef {
        NodeRef::new(
            PeerId(42),
            Location::new(0.25).unwrap(),
            b"tcp/127.0.0.1:19333".to_vec(),
        )
    }

    #[test]
    fn test_roundtrip() {
        let r = sample();
        let blob = r.encode();
        let parsed = validate(&blob).expect("valid blob parses");
        assert_eq!(parsed, r);
    }

    #[test]
    fn test_digest_tamper_rejected() {
        let mut blob = sample().encode();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(validate(&blob).is_none());
    }

    #[test]
    fn test_body_tamper_rejected() {
        let mut blob = sample().encode();
        blob[0] ^= 0xff;
        assert!(validate(&blob).is_none());
    }

    #[test]
    fn test_short_and_oversized_rejected() {
        assert!(validate(&[0u8; 16]).is_none());
        let huge = vec![0u8; MAX_NODEREF_SIZE + 1];
        assert!(validate(&huge).is_none());
    }
}
