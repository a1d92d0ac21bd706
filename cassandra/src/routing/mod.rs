//! This module holds entities whose goal is to enable routing requests optimally,
//! that is, choosing a target node that is a replica for the given partition key.
//!
//! This includes:
//! - token representation,
//! - partitioners, which compute a token based on a partition key,
//! - the token ring and replication strategies, which find replicas for a given token.

pub mod locator;
pub mod partitioner;

use bytes::Bytes;
use num_bigint::BigInt;
use std::cmp::Ordering;
use std::fmt;

/// Token is the position of a partition key on the ring, as computed by a partitioner.
///
/// Every partitioner produces its own kind of token. Tokens of different kinds
/// are never compared with each other in a meaningful way: a cluster uses one
/// partitioner, so a ring only ever holds tokens of a single kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    /// 64-bit hash of the Murmur3 partitioner.
    ///
    /// `i64::MIN` is reserved for the minimum token (the empty key);
    /// a hash equal to it is normalized to `i64::MAX`.
    Murmur3(i64),
    /// Non-negative magnitude of the MD5 digest used by the random partitioner.
    /// The empty key maps to `-1`.
    Random(BigInt),
    /// Raw partition key bytes, compared lexicographically.
    ByteOrdered(Bytes),
    /// Partition key decoded as a string, ordered by its UTF-16 code units
    /// the way the server orders it.
    OrderPreserving(String),
}

impl Token {
    fn kind_index(&self) -> u8 {
        match self {
            Token::Murmur3(_) => 0,
            Token::Random(_) => 1,
            Token::ByteOrdered(_) => 2,
            Token::OrderPreserving(_) => 3,
        }
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Token::Murmur3(a), Token::Murmur3(b)) => a.cmp(b),
            (Token::Random(a), Token::Random(b)) => a.cmp(b),
            (Token::ByteOrdered(a), Token::ByteOrdered(b)) => a.cmp(b),
            // Differs from byte order for characters outside the BMP.
            (Token::OrderPreserving(a), Token::OrderPreserving(b)) => {
                a.encode_utf16().cmp(b.encode_utf16())
            }
            _ => self.kind_index().cmp(&other.kind_index()),
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Token {
    /// Normalizes a Murmur3 hash value, replacing the reserved `i64::MIN` with `i64::MAX`.
    #[inline]
    pub fn murmur3(value: i64) -> Self {
        Token::Murmur3(if value == i64::MIN { i64::MAX } else { value })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Murmur3(value) => write!(f, "{}", value),
            Token::Random(value) => write!(f, "{}", value),
            Token::ByteOrdered(bytes) => {
                for byte in bytes.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Token::OrderPreserving(value) => f.write_str(value),
        }
    }
}
