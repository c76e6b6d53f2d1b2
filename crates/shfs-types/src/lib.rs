#![forbid(unsafe_code)]
//! Core types for SHFS volumes.
//!
//! Newtypes for chunk arithmetic, the on-disk layout constants shared by the
//! parser and the tools, little-endian field helpers, the fixed-width content
//! hash, and the polled cancellation flag.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Opaque boot area preceding the common header in chunk 0.
pub const BOOT_AREA_LENGTH: usize = 1024;
/// Chunk 0 is always read and written as this fixed size, regardless of the
/// volume chunk size (the label must be locatable before chunk size is known).
pub const CHUNK0_SIZE: usize = 4096;

pub const SHFS_MAGIC: [u8; 4] = *b"SHFS";
pub const SHFS_VERSION: u16 = 1;

/// Maximum member devices a volume label can declare.
pub const MAX_MEMBERS: usize = 16;

/// On-disk size of one hash-table entry record.
pub const HENTRY_SIZE: usize = 256;
pub const HENTRY_MIME_LEN: usize = 24;
pub const HENTRY_NAME_LEN: usize = 64;
pub const HENTRY_ENCODING_LEN: usize = 8;

/// Widest supported content hash.
pub const HASH_MAX_LEN: usize = 64;

/// Hash entry flag bits.
pub const HENTRY_FLAG_DEFAULT: u8 = 0x01;
pub const HENTRY_FLAG_HIDDEN: u8 = 0x02;

/// Logical chunk number within a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkNo(pub u64);

impl ChunkNo {
    /// Add a chunk count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for ChunkNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte offset on a member device (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How chunks are laid out across the member devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripeMode {
    /// RAID-0-like: every chunk spans all members, one stripe each.
    Combined,
    /// Every chunk lives entirely on one member, round-robin.
    Independent,
}

impl StripeMode {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Combined),
            1 => Some(Self::Independent),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Combined => 0,
            Self::Independent => 1,
        }
    }
}

impl fmt::Display for StripeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Combined => write!(f, "combined"),
            Self::Independent => write!(f, "independent"),
        }
    }
}

/// Validated content-hash width (1..=64 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashLen(u8);

impl HashLen {
    /// Create a `HashLen` if `value` is in [1, 64].
    pub fn new(value: u8) -> Result<Self, ParseError> {
        if value == 0 || usize::from(value) > HASH_MAX_LEN {
            return Err(ParseError::InvalidField {
                field: "hlen",
                reason: "must be in 1..=64",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> usize {
        usize::from(self.0)
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Length of the printable lowercase-hex form.
    #[must_use]
    pub fn hex_len(self) -> usize {
        self.get() * 2
    }
}

impl fmt::Display for HashLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-width content hash. Equality is bytewise over the significant width;
/// the all-zero value marks a vacant hash-table slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHash {
    len: HashLen,
    bytes: [u8; HASH_MAX_LEN],
}

impl ObjectHash {
    #[must_use]
    pub fn zeroed(len: HashLen) -> Self {
        Self {
            len,
            bytes: [0_u8; HASH_MAX_LEN],
        }
    }

    /// Build from raw on-disk bytes; `raw` must hold at least `len` bytes.
    pub fn from_raw(raw: &[u8], len: HashLen) -> Result<Self, ParseError> {
        let significant = ensure_slice(raw, 0, len.get())?;
        let mut bytes = [0_u8; HASH_MAX_LEN];
        bytes[..len.get()].copy_from_slice(significant);
        Ok(Self { len, bytes })
    }

    /// Build from a digest output, truncating to `len` or zero-extending
    /// when the digest is narrower than the configured hash width.
    #[must_use]
    pub fn from_digest(digest: &[u8], len: HashLen) -> Self {
        let mut bytes = [0_u8; HASH_MAX_LEN];
        let take = digest.len().min(len.get());
        bytes[..take].copy_from_slice(&digest[..take]);
        Self { len, bytes }
    }

    /// Parse the printable form; requires exactly `2 * len` hex digits.
    pub fn parse_hex(text: &str, len: HashLen) -> Result<Self, ParseError> {
        if text.len() != len.hex_len() {
            return Err(ParseError::InvalidField {
                field: "hash",
                reason: "hex string length does not match hash width",
            });
        }
        let decoded = hex::decode(text).map_err(|_| ParseError::InvalidField {
            field: "hash",
            reason: "not a hex string",
        })?;
        Self::from_raw(&decoded, len)
    }

    #[must_use]
    pub fn len(&self) -> HashLen {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    /// Significant bytes only.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len.get()]
    }

    /// Whether this is the vacant-slot marker.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// First four hash bytes as an unsigned little-endian integer; the bucket
    /// table reduces this modulo its bucket count. Hashes narrower than four
    /// bytes are zero-extended.
    #[must_use]
    pub fn bucket_seed(&self) -> u32 {
        let mut word = [0_u8; 4];
        let take = self.len.get().min(4);
        word[..take].copy_from_slice(&self.bytes[..take]);
        u32::from_le_bytes(word)
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({self})")
    }
}

/// Cooperative cancellation flag.
///
/// The signal handler owns the only setter; everything else polls. Clones
/// share the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Shared handle for registration with a signal backend.
    #[must_use]
    pub fn shared(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic")]
    InvalidMagic,
    #[error("unsupported version {actual} (expected {expected})")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Copy `text` into a NUL-padded fixed field, truncating to `N` bytes.
#[inline]
pub fn write_padded<const N: usize>(data: &mut [u8], offset: usize, text: &str) {
    let mut field = [0_u8; N];
    let take = text.len().min(N);
    field[..take].copy_from_slice(&text.as_bytes()[..take]);
    data[offset..offset + N].copy_from_slice(&field);
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Number of chunks spanned by `bytes` at the given chunk size.
///
/// `chunksize` must be non-zero.
#[must_use]
pub fn chunks_spanned(bytes: u64, chunksize: u32) -> u64 {
    bytes.div_ceil(u64::from(chunksize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hlen(n: u8) -> HashLen {
        HashLen::new(n).expect("valid hash length")
    }

    #[test]
    fn read_write_helpers_round_trip() {
        let mut buf = vec![0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234);
        write_le_u32(&mut buf, 2, 0x90AB_CDEF);
        write_le_u64(&mut buf, 6, 0x0102_0304_0506_0708);
        assert_eq!(read_le_u16(&buf, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&buf, 6).expect("u64"), 0x0102_0304_0506_0708);
    }

    #[test]
    fn read_helpers_reject_short_input() {
        let buf = [0_u8; 3];
        assert!(read_le_u32(&buf, 0).is_err());
        assert!(matches!(
            read_le_u16(&buf, 2),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn hash_len_validation() {
        assert!(HashLen::new(1).is_ok());
        assert!(HashLen::new(32).is_ok());
        assert!(HashLen::new(64).is_ok());
        assert!(HashLen::new(0).is_err());
        assert!(HashLen::new(65).is_err());
        assert_eq!(hlen(32).hex_len(), 64);
    }

    #[test]
    fn object_hash_hex_round_trip() {
        let raw: Vec<u8> = (0_u8..32).collect();
        let h = ObjectHash::from_raw(&raw, hlen(32)).expect("from_raw");
        let text = h.to_string();
        assert_eq!(text.len(), 64);
        let parsed = ObjectHash::parse_hex(&text, hlen(32)).expect("parse");
        assert_eq!(parsed, h);
    }

    #[test]
    fn object_hash_rejects_bad_hex() {
        assert!(ObjectHash::parse_hex("zz", hlen(1)).is_err());
        // Wrong length for the configured width.
        assert!(ObjectHash::parse_hex("ab", hlen(2)).is_err());
        assert!(ObjectHash::parse_hex("abcd", hlen(2)).is_ok());
    }

    #[test]
    fn object_hash_vacancy() {
        let zero = ObjectHash::zeroed(hlen(32));
        assert!(zero.is_zero());
        let h = ObjectHash::from_raw(&[0, 0, 0, 1], hlen(4)).expect("from_raw");
        assert!(!h.is_zero());
    }

    #[test]
    fn bucket_seed_is_le_of_first_four_bytes() {
        let h = ObjectHash::from_raw(&[0x78, 0x56, 0x34, 0x12, 0xFF], hlen(5)).expect("from_raw");
        assert_eq!(h.bucket_seed(), 0x1234_5678);
        // Narrow hashes zero-extend.
        let narrow = ObjectHash::from_raw(&[0x01, 0x02], hlen(2)).expect("from_raw");
        assert_eq!(narrow.bucket_seed(), 0x0201);
    }

    #[test]
    fn digest_truncate_and_extend() {
        let digest: Vec<u8> = (0_u8..32).collect();
        let short = ObjectHash::from_digest(&digest, hlen(16));
        assert_eq!(short.as_bytes(), &digest[..16]);
        let wide = ObjectHash::from_digest(&digest, hlen(48));
        assert_eq!(&wide.as_bytes()[..32], &digest[..]);
        assert!(wide.as_bytes()[32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn stripe_mode_raw_round_trip() {
        assert_eq!(StripeMode::from_raw(0), Some(StripeMode::Combined));
        assert_eq!(StripeMode::from_raw(1), Some(StripeMode::Independent));
        assert_eq!(StripeMode::from_raw(2), None);
        assert_eq!(StripeMode::Independent.to_raw(), 1);
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_set());
        flag.set();
        assert!(clone.is_set());
    }

    #[test]
    fn chunks_spanned_rounds_up() {
        assert_eq!(chunks_spanned(0, 4096), 0);
        assert_eq!(chunks_spanned(1, 4096), 1);
        assert_eq!(chunks_spanned(4096, 4096), 1);
        assert_eq!(chunks_spanned(4097, 4096), 2);
        assert_eq!(chunks_spanned(5000, 4096), 2);
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        assert_eq!(trim_nul_padded(b"vol01\0\0\0"), "vol01");
        assert_eq!(trim_nul_padded(b"full"), "full");
    }
}
