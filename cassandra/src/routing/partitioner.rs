//! Partitioners are algorithms that compute the token of a partition key,
//! ultimately allowing optimised routing of requests (such that a request is routed
//! to replicas, which are nodes that really own the data the request concerns).
//!
//! Four partitioners are supported:
//! - Murmur3Partitioner
//!     - the default partitioner,
//!     - reproduces the sign extension of the tail bytes done by the server.
//! - RandomPartitioner, based on the MD5 digest of the key.
//! - ByteOrderedPartitioner, where the token is the key itself.
//! - OrderPreservingPartitioner, where the token is the key decoded as a string.

use bytes::{Buf, Bytes};
use md5::{Digest, Md5};
use num_bigint::BigInt;
use std::fmt;
use std::num::Wrapping;

use crate::errors::TokenParseError;
use crate::routing::Token;

/// Partitioner used by a cluster, as announced in `system.local`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Hash)]
#[non_exhaustive]
pub enum PartitionerName {
    #[default]
    Murmur3,
    Random,
    ByteOrdered,
    OrderPreserving,
}

impl PartitionerName {
    /// Recognizes a partitioner by its fully qualified server-side class name.
    pub fn from_class_name(name: &str) -> Option<Self> {
        if name.ends_with("Murmur3Partitioner") {
            Some(PartitionerName::Murmur3)
        } else if name.ends_with("RandomPartitioner") {
            Some(PartitionerName::Random)
        } else if name.ends_with("ByteOrderedPartitioner") {
            Some(PartitionerName::ByteOrdered)
        } else if name.ends_with("OrderPreservingPartitioner") {
            Some(PartitionerName::OrderPreserving)
        } else {
            None
        }
    }

    /// Computes the token of a serialized partition key.
    pub fn token(&self, partition_key: &[u8]) -> Token {
        match self {
            PartitionerName::Murmur3 => {
                if partition_key.is_empty() {
                    // The minimum token is kept as is; only computed hashes are normalized.
                    return Token::Murmur3(i64::MIN);
                }
                Token::murmur3(murmur3_x64_128_low(partition_key))
            }
            PartitionerName::Random => {
                if partition_key.is_empty() {
                    return Token::Random(BigInt::from(-1));
                }
                let digest = Md5::digest(partition_key);
                let signed = BigInt::from_signed_bytes_be(&digest);
                Token::Random(BigInt::from(signed.magnitude().clone()))
            }
            PartitionerName::ByteOrdered => {
                Token::ByteOrdered(Bytes::copy_from_slice(partition_key))
            }
            PartitionerName::OrderPreserving => match std::str::from_utf8(partition_key) {
                Ok(key) => Token::OrderPreserving(key.to_owned()),
                Err(_) => Token::OrderPreserving(bytes_to_hex(partition_key)),
            },
        }
    }

    /// Parses a token in the textual form stored in `system.local` and `system.peers`.
    pub fn parse_token(&self, token: &str) -> Result<Token, TokenParseError> {
        let err = || TokenParseError {
            partitioner: *self,
            token: token.to_owned(),
        };
        match self {
            PartitionerName::Murmur3 => token.parse::<i64>().map(Token::Murmur3).map_err(|_| err()),
            PartitionerName::Random => token.parse::<BigInt>().map(Token::Random).map_err(|_| err()),
            PartitionerName::ByteOrdered => hex_to_bytes(token)
                .map(|bytes| Token::ByteOrdered(bytes.into()))
                .ok_or_else(err),
            PartitionerName::OrderPreserving => Ok(Token::OrderPreserving(token.to_owned())),
        }
    }
}

impl fmt::Display for PartitionerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionerName::Murmur3 => "Murmur3Partitioner",
            PartitionerName::Random => "RandomPartitioner",
            PartitionerName::ByteOrdered => "ByteOrderedPartitioner",
            PartitionerName::OrderPreserving => "OrderPreservingPartitioner",
        };
        f.write_str(name)
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{:02x}", byte);
        out
    })
}

// Odd-length input is read as if it had a leading zero.
fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = hex
        .chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<_>>()?;
    let mut out = Vec::with_capacity(digits.len() / 2 + 1);
    let mut rest = &digits[..];
    if rest.len() % 2 == 1 {
        out.push(rest[0]);
        rest = &rest[1..];
    }
    out.extend(rest.chunks_exact(2).map(|pair| (pair[0] << 4) | pair[1]));
    Some(out)
}

const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

#[inline]
fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
    Wrapping(v.0.rotate_left(n))
}

#[inline]
fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k
}

#[inline]
fn mix_k1(k1: Wrapping<i64>) -> Wrapping<i64> {
    rotl64(k1 * C1, 31) * C2
}

#[inline]
fn mix_k2(k2: Wrapping<i64>) -> Wrapping<i64> {
    rotl64(k2 * C2, 33) * C1
}

/// MurmurHash3 x64 128-bit variant with seed 0, returning the lower 64 bits.
fn murmur3_x64_128_low(data: &[u8]) -> i64 {
    let mut h1 = Wrapping(0_i64);
    let mut h2 = Wrapping(0_i64);

    let mut blocks = data.chunks_exact(16);
    for mut block in &mut blocks {
        let k1 = Wrapping(block.get_i64_le());
        let k2 = Wrapping(block.get_i64_le());

        h1 ^= mix_k1(k1);
        h1 = rotl64(h1, 27) + h2;
        h1 = h1 * Wrapping(5) + Wrapping(0x52dc_e729);

        h2 ^= mix_k2(k2);
        h2 = rotl64(h2, 31) + h1;
        h2 = h2 * Wrapping(5) + Wrapping(0x3849_5ab5);
    }

    // Tail bytes are sign-extended before being shifted in.
    let tail = blocks.remainder();
    let mut k1 = Wrapping(0_i64);
    let mut k2 = Wrapping(0_i64);
    for (i, byte) in tail.iter().enumerate() {
        let v = Wrapping(*byte as i8 as i64);
        if i >= 8 {
            k2 ^= v << ((i - 8) * 8);
        } else {
            k1 ^= v << (i * 8);
        }
    }
    if tail.len() > 8 {
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(k1);
    }

    let len = Wrapping(data.len() as i64);
    h1 ^= len;
    h2 ^= len;

    h1 += h2;
    h2 += h1;

    h1 = fmix(h1);
    h2 = fmix(h2);

    h1 += h2;
    h1.0
}
