//! Content identifiers (CIDv1).
//!
//! The ledger addresses every block by a CID: a version varint, a codec
//! varint, and a multihash (hash code, digest length, digest). Only sha2-256
//! digests are produced here; blocks are DAG-CBOR (`0x71`) or raw (`0x55`).
//!
//! # Encodings
//!
//! - Textual form is multibase base32 (lowercase, unpadded, `b` prefix), so
//!   a DAG-CBOR CID always starts with `bafyrei`.
//! - In JSON a link is `{"$link": "<cid>"}`.
//! - In DAG-CBOR a link is a byte string with a leading `0x00`. Tag 42 around
//!   it is skipped by the decoder.
//!
//! Verification sits behind [`CidVerifier`] so pipelines can swap in a stub.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Multicodec for DAG-CBOR blocks.
pub const DAG_CBOR: u64 = 0x71;
/// Multicodec for raw bytes (blobs).
pub const RAW: u64 = 0x55;
/// Multihash code for sha2-256.
pub const SHA2_256: u64 = 0x12;

const CID_V1: u64 = 1;
const BASE32_PREFIX: char = 'b';
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A version 1 content identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cid {
    bytes: Vec<u8>,
    codec: u64,
    hash: u64,
    digest_at: usize,
}

impl Cid {
    /// Build a CID from a codec and a sha2-256 digest.
    pub fn new(codec: u64, digest: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(digest.len() + 4);
        write_uvarint(CID_V1, &mut bytes);
        write_uvarint(codec, &mut bytes);
        write_uvarint(SHA2_256, &mut bytes);
        write_uvarint(digest.len() as u64, &mut bytes);
        let digest_at = bytes.len();
        bytes.extend_from_slice(digest);
        Self {
            bytes,
            codec,
            hash: SHA2_256,
            digest_at,
        }
    }

    /// Hash `data` with sha2-256 and address it under `codec`.
    pub fn compute(codec: u64, data: &[u8]) -> Self {
        Self::new(codec, &Sha256::digest(data))
    }

    /// CID of a DAG-CBOR block.
    pub fn dag_cbor(data: &[u8]) -> Self {
        Self::compute(DAG_CBOR, data)
    }

    /// CID of a raw blob.
    pub fn raw(data: &[u8]) -> Self {
        Self::compute(RAW, data)
    }

    /// Parse a CID from the front of `bytes`, returning it and the number of
    /// bytes consumed.
    pub fn read_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let (version, mut pos) = read_uvarint(bytes)?;
        if version != CID_V1 {
            return Err(Error::InvalidCid(format!("unsupported CID version {version}")));
        }
        let (codec, n) = read_uvarint(&bytes[pos..])?;
        pos += n;
        let (hash, n) = read_uvarint(&bytes[pos..])?;
        pos += n;
        let (len, n) = read_uvarint(&bytes[pos..])?;
        pos += n;

        let digest_at = pos;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| digest_at.checked_add(len))
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::InvalidCid(format!("digest length {len} exceeds input")))?;

        Ok((
            Self {
                bytes: bytes[..end].to_vec(),
                codec,
                hash,
                digest_at,
            },
            end,
        ))
    }

    /// Parse a CID that must span all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (cid, used) = Self::read_prefix(bytes)?;
        if used != bytes.len() {
            return Err(Error::InvalidCid(format!(
                "{} trailing bytes after CID",
                bytes.len() - used
            )));
        }
        Ok(cid)
    }

    /// Parse a DAG-CBOR link payload (`0x00` multibase-identity prefix).
    pub fn from_link_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((0, rest)) => Self::from_bytes(rest),
            _ => Self::from_bytes(bytes),
        }
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// Multihash function code.
    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    pub fn digest(&self) -> &[u8] {
        &self.bytes[self.digest_at..]
    }

    /// Binary form, without the link prefix.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BASE32_PREFIX}{}", base32_encode(&self.bytes))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some(body) = s.strip_prefix(BASE32_PREFIX) else {
            return Err(Error::InvalidCid(format!("unsupported multibase in '{s}'")));
        };
        let bytes = base32_decode(body)
            .ok_or_else(|| Error::InvalidCid(format!("invalid base32 in '{s}'")))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            let mut map = serializer.serialize_map(Some(1))?;
            map.serialize_entry("$link", &self.to_string())?;
            map.end()
        } else {
            let mut link = Vec::with_capacity(self.bytes.len() + 1);
            link.push(0);
            link.extend_from_slice(&self.bytes);
            serializer.serialize_bytes(&link)
        }
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(CidVisitor)
    }
}

struct CidVisitor;

impl<'de> Visitor<'de> for CidVisitor {
    type Value = Cid;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a CID as link bytes, a string, or {\"$link\": string}")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Cid, E> {
        Cid::from_link_bytes(v).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Cid, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Cid, A::Error> {
        let mut link: Option<String> = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == "$link" {
                link = Some(map.next_value()?);
            } else {
                map.next_value::<de::IgnoredAny>()?;
            }
        }
        let link = link.ok_or_else(|| de::Error::missing_field("$link"))?;
        link.parse().map_err(de::Error::custom)
    }
}

/// Checks that a block hashes to the CID it was declared under.
pub trait CidVerifier: Send + Sync {
    fn verify(&self, block: &[u8], declared: &Cid) -> bool;
}

/// Recomputes sha2-256 over the block under the declared codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Verifier;

impl CidVerifier for Sha256Verifier {
    fn verify(&self, block: &[u8], declared: &Cid) -> bool {
        declared.hash_code() == SHA2_256 && Cid::compute(declared.codec(), block) == *declared
    }
}

/// Decode an unsigned LEB128 varint, returning the value and bytes consumed.
pub fn read_uvarint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, b) in bytes.iter().take(10).enumerate() {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::InvalidCid("truncated varint".to_string()))
}

/// Append an unsigned LEB128 varint.
pub fn write_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer = 0u32;
    let mut bits = 0;
    for &b in bytes {
        buffer = (buffer << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 31) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer = 0u32;
    let mut bits = 0;
    for c in s.bytes() {
        let v = match c {
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u32::from(v);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    // Leftover bits are padding: fewer than one symbol and all zero.
    if bits >= 5 || buffer & ((1 << bits) - 1) != 0 {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Textual form
    // =========================================================================

    #[test]
    fn test_dag_cbor_prefix() {
        let cid = Cid::dag_cbor(b"hello");
        assert!(cid.to_string().starts_with("bafyrei"), "{cid}");
        assert_eq!(cid.codec(), DAG_CBOR);
        assert_eq!(cid.digest().len(), 32);
    }

    #[test]
    fn test_raw_prefix() {
        assert!(Cid::raw(b"blob").to_string().starts_with("bafkrei"));
    }

    #[test]
    fn test_parse_known_cid() {
        // Empty-input sha256 under the raw codec.
        let s = "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku";
        let cid: Cid = s.parse().unwrap();
        assert_eq!(cid, Cid::raw(b""));
        assert_eq!(cid.to_string(), s);
    }

    #[test]
    fn test_parse_rejects_nonzero_padding_bits() {
        // Same bytes as the known CID, with a padding bit set in the last symbol.
        let s = "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvykv";
        assert!(s.parse::<Cid>().is_err());
    }

    #[test]
    fn test_parse_rejects_dangling_symbol() {
        let s = "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvykua";
        assert!(s.parse::<Cid>().is_err());
    }

    #[test]
    fn test_parse_rejects_other_multibase() {
        assert!("zdj7WhuEjrB52m1BisYCtmjH1hSKa7yZ3jEZ9JcXaFRD51wVz".parse::<Cid>().is_err());
        assert!("b!!!".parse::<Cid>().is_err());
    }

    // =========================================================================
    // Binary form
    // =========================================================================

    #[test]
    fn test_read_prefix_reports_length() {
        let cid = Cid::dag_cbor(b"block");
        let mut buf = cid.as_bytes().to_vec();
        buf.extend_from_slice(b"trailing");
        let (parsed, used) = Cid::read_prefix(&buf).unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(used, cid.as_bytes().len());
        assert!(Cid::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_truncated_digest() {
        let cid = Cid::dag_cbor(b"block");
        let bytes = &cid.as_bytes()[..10];
        assert!(matches!(Cid::read_prefix(bytes), Err(Error::InvalidCid(_))));
    }

    #[test]
    fn test_link_bytes_prefix() {
        let cid = Cid::dag_cbor(b"x");
        let mut link = vec![0u8];
        link.extend_from_slice(cid.as_bytes());
        assert_eq!(Cid::from_link_bytes(&link).unwrap(), cid);
        assert_eq!(Cid::from_link_bytes(cid.as_bytes()).unwrap(), cid);
    }

    #[test]
    fn test_varint() {
        for v in [0u64, 1, 127, 128, 300, 16_384, u64::from(u32::MAX)] {
            let mut buf = Vec::new();
            write_uvarint(v, &mut buf);
            assert_eq!(read_uvarint(&buf).unwrap(), (v, buf.len()));
        }
        assert!(read_uvarint(&[0x80, 0x80]).is_err());
    }

    // =========================================================================
    // Serde
    // =========================================================================

    #[test]
    fn test_json_link() {
        let cid = Cid::dag_cbor(b"x");
        let json = serde_json::to_value(&cid).unwrap();
        assert_eq!(json["$link"], cid.to_string());
        let back: Cid = serde_json::from_value(json).unwrap();
        assert_eq!(back, cid);

        let from_str: Cid = serde_json::from_value(serde_json::json!(cid.to_string())).unwrap();
        assert_eq!(from_str, cid);
    }

    #[test]
    fn test_cbor_link() {
        let cid = Cid::dag_cbor(b"x");
        let bytes = serde_cbor::to_vec(&cid).unwrap();
        let back: Cid = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, cid);
    }

    #[test]
    fn test_cbor_tagged_link() {
        // tag 42 + byte string, as produced by real DAG-CBOR encoders
        let cid = Cid::dag_cbor(b"x");
        let mut bytes = vec![0xd8, 0x2a, 0x58, (cid.as_bytes().len() + 1) as u8, 0x00];
        bytes.extend_from_slice(cid.as_bytes());
        let back: Cid = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, cid);
    }

    // =========================================================================
    // Verification
    // =========================================================================

    #[test]
    fn test_sha256_verifier() {
        let block = b"alert record";
        let cid = Cid::dag_cbor(block);
        assert!(Sha256Verifier.verify(block, &cid));
        assert!(!Sha256Verifier.verify(b"tampered", &cid));
    }

    #[test]
    fn test_sha256_verifier_rejects_other_hashes() {
        let block = b"alert record";
        // sha2-512 code with a sha2-256 digest
        let mut bytes = vec![0x01, 0x71, 0x13, 0x20];
        bytes.extend_from_slice(Cid::dag_cbor(block).digest());
        let cid = Cid::from_bytes(&bytes).unwrap();
        assert!(!Sha256Verifier.verify(block, &cid));
    }
}
