//! Safe deserialization with bounded byte buffers

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Byte vector that enforces a length cap at deserialization time, so a
/// hostile length prefix cannot allocate unbounded memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedBytes<const N: usize>(pub Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    pub fn new(v: Vec<u8>) -> Option<Self> {
        if v.len() <= N {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Internal use only; caller must ensure len <= N
    #[inline]
    pub fn new_unchecked(v: Vec<u8>) -> Self {
        debug_assert!(v.len() <= N);
        Self(v)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> Default for BoundedBytes<N> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<const N: usize> std::ops::Deref for BoundedBytes<N> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> Serialize for BoundedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundedBytesVisitor<const N: usize>;

        impl<'de, const N: usize> de::Visitor<'de> for BoundedBytesVisitor<N> {
            type Value = BoundedBytes<N>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a byte buffer with at most {} bytes", N)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                if v.len() > N {
                    return Err(de::Error::invalid_length(v.len(), &self));
                }
                Ok(BoundedBytes(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                if v.len() > N {
                    return Err(de::Error::invalid_length(v.len(), &self));
                }
                Ok(BoundedBytes(v))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let size_hint = seq.size_hint().unwrap_or(0);
                if size_hint > N {
                    return Err(de::Error::invalid_length(size_hint, &self));
                }
                let mut vec = Vec::with_capacity(size_hint.min(N));
                while let Some(b) = seq.next_element()? {
                    if vec.len() >= N {
                        return Err(de::Error::invalid_length(vec.len() + 1, &self));
                    }
                    vec.push(b);
                }
                Ok(BoundedBytes(vec))
            }
        }

        deserializer.deserialize_bytes(BoundedBytesVisitor)
    }
}
