#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use shfs_types::{
    HASH_MAX_LEN, HENTRY_ENCODING_LEN, HENTRY_FLAG_DEFAULT, HENTRY_FLAG_HIDDEN, HENTRY_MIME_LEN,
    HENTRY_NAME_LEN, HENTRY_SIZE, HashLen, ObjectHash, ParseError, ensure_slice, read_fixed,
    read_le_u64, trim_nul_padded, write_le_u64, write_padded,
};

// Entry record field offsets.
const ENT_HASH: usize = 0x00;
const ENT_CHUNK: usize = 0x40;
const ENT_OFFSET: usize = 0x48;
const ENT_LEN: usize = 0x50;
const ENT_TS_CREATION: usize = 0x58;
const ENT_FLAGS: usize = 0x60;
const ENT_MIME: usize = 0x68;
const ENT_NAME: usize = 0x80;
const ENT_ENCODING: usize = 0xC0;

/// One hash-table entry record.
///
/// A vacant slot is identified solely by an all-zero hash; every other field
/// of a vacant record is undefined and must not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub hash: ObjectHash,
    /// First data chunk of the stored object.
    pub chunk: u64,
    /// Byte offset of the content within the first chunk.
    pub offset: u64,
    /// Content length in bytes.
    pub len: u64,
    /// Creation time, UNIX seconds.
    pub ts_creation: u64,
    pub flags: u8,
    pub mime: String,
    pub name: String,
    pub encoding: String,
}

impl HashEntry {
    /// Parse a 256-byte record. The hash width comes from the volume
    /// configuration, not the record itself.
    pub fn parse(record: &[u8], hlen: HashLen) -> Result<Self, ParseError> {
        let record = ensure_slice(record, 0, HENTRY_SIZE)?;
        let hash = ObjectHash::from_raw(&record[ENT_HASH..ENT_HASH + HASH_MAX_LEN], hlen)?;
        Ok(Self {
            hash,
            chunk: read_le_u64(record, ENT_CHUNK)?,
            offset: read_le_u64(record, ENT_OFFSET)?,
            len: read_le_u64(record, ENT_LEN)?,
            ts_creation: read_le_u64(record, ENT_TS_CREATION)?,
            flags: record[ENT_FLAGS],
            mime: trim_nul_padded(&read_fixed::<HENTRY_MIME_LEN>(record, ENT_MIME)?),
            name: trim_nul_padded(&read_fixed::<HENTRY_NAME_LEN>(record, ENT_NAME)?),
            encoding: trim_nul_padded(&read_fixed::<HENTRY_ENCODING_LEN>(record, ENT_ENCODING)?),
        })
    }

    /// Read only the hash of a record; the mount-time table scan needs
    /// nothing else for vacant slots.
    pub fn parse_hash(record: &[u8], hlen: HashLen) -> Result<ObjectHash, ParseError> {
        let raw = ensure_slice(record, ENT_HASH, HASH_MAX_LEN)?;
        ObjectHash::from_raw(raw, hlen)
    }

    /// Encode the full record over a 256-byte region.
    pub fn encode_into(&self, record: &mut [u8]) -> Result<(), ParseError> {
        if record.len() < HENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HENTRY_SIZE,
                offset: 0,
                actual: record.len(),
            });
        }
        let record = &mut record[..HENTRY_SIZE];
        record.fill(0);
        record[ENT_HASH..ENT_HASH + self.hash.len().get()].copy_from_slice(self.hash.as_bytes());
        write_le_u64(record, ENT_CHUNK, self.chunk);
        write_le_u64(record, ENT_OFFSET, self.offset);
        write_le_u64(record, ENT_LEN, self.len);
        write_le_u64(record, ENT_TS_CREATION, self.ts_creation);
        record[ENT_FLAGS] = self.flags;
        write_padded::<HENTRY_MIME_LEN>(record, ENT_MIME, &self.mime);
        write_padded::<HENTRY_NAME_LEN>(record, ENT_NAME, &self.name);
        write_padded::<HENTRY_ENCODING_LEN>(record, ENT_ENCODING, &self.encoding);
        Ok(())
    }

    /// Zero the hash field in place, turning the record into a vacant slot.
    /// The remaining fields stay as on-disk garbage.
    pub fn clear_hash_in(record: &mut [u8]) -> Result<(), ParseError> {
        if record.len() < HENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HENTRY_SIZE,
                offset: 0,
                actual: record.len(),
            });
        }
        record[ENT_HASH..ENT_HASH + HASH_MAX_LEN].fill(0);
        Ok(())
    }

    /// Rewrite only the flags byte of a record.
    pub fn set_flags_in(record: &mut [u8], flags: u8) -> Result<(), ParseError> {
        if record.len() < HENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HENTRY_SIZE,
                offset: 0,
                actual: record.len(),
            });
        }
        record[ENT_FLAGS] = flags;
        Ok(())
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.flags & HENTRY_FLAG_DEFAULT != 0
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.flags & HENTRY_FLAG_HIDDEN != 0
    }

    /// Chunks covered by the stored content, counting the leading offset.
    #[must_use]
    pub fn chunk_span(&self, chunksize: u32) -> u64 {
        (self.offset + self.len).div_ceil(u64::from(chunksize))
    }
}

/// Serializable summary row of an entry, used by listing and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySummary {
    pub hash: String,
    pub chunk: u64,
    pub chunk_span: u64,
    pub flags: u8,
    pub mime: String,
    pub ts_creation: u64,
    pub name: String,
}

impl EntrySummary {
    #[must_use]
    pub fn of(entry: &HashEntry, chunksize: u32) -> Self {
        Self {
            hash: entry.hash.to_string(),
            chunk: entry.chunk,
            chunk_span: entry.chunk_span(chunksize),
            flags: entry.flags,
            mime: entry.mime.clone(),
            ts_creation: entry.ts_creation,
            name: entry.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hlen32() -> HashLen {
        HashLen::new(32).expect("valid hash length")
    }

    fn sample_entry() -> HashEntry {
        let raw: Vec<u8> = (0_u8..32).map(|b| b.wrapping_mul(7).wrapping_add(1)).collect();
        HashEntry {
            hash: ObjectHash::from_raw(&raw, hlen32()).expect("hash"),
            chunk: 40,
            offset: 0,
            len: 5000,
            ts_creation: 1_700_000_123,
            flags: HENTRY_FLAG_DEFAULT,
            mime: "audio/mpeg3".to_string(),
            name: "song".to_string(),
            encoding: String::new(),
        }
    }

    #[test]
    fn entry_round_trip() {
        let entry = sample_entry();
        let mut record = vec![0_u8; HENTRY_SIZE];
        entry.encode_into(&mut record).expect("encode");
        let parsed = HashEntry::parse(&record, hlen32()).expect("parse");
        assert_eq!(parsed, entry);
        assert!(parsed.is_default());
        assert!(!parsed.is_hidden());
    }

    #[test]
    fn parse_hash_matches_full_parse() {
        let entry = sample_entry();
        let mut record = vec![0_u8; HENTRY_SIZE];
        entry.encode_into(&mut record).expect("encode");
        let hash = HashEntry::parse_hash(&record, hlen32()).expect("hash");
        assert_eq!(hash, entry.hash);
    }

    #[test]
    fn clear_hash_leaves_other_fields() {
        let entry = sample_entry();
        let mut record = vec![0_u8; HENTRY_SIZE];
        entry.encode_into(&mut record).expect("encode");
        HashEntry::clear_hash_in(&mut record).expect("clear");
        let parsed = HashEntry::parse(&record, hlen32()).expect("parse");
        assert!(parsed.hash.is_zero());
        // Stale fields remain readable but carry no meaning for vacant slots.
        assert_eq!(parsed.chunk, entry.chunk);
        assert_eq!(parsed.name, entry.name);
    }

    #[test]
    fn oversized_names_truncate_on_encode() {
        let mut entry = sample_entry();
        entry.name = "n".repeat(100);
        entry.mime = "m".repeat(40);
        let mut record = vec![0_u8; HENTRY_SIZE];
        entry.encode_into(&mut record).expect("encode");
        let parsed = HashEntry::parse(&record, hlen32()).expect("parse");
        assert_eq!(parsed.name.len(), HENTRY_NAME_LEN);
        assert_eq!(parsed.mime.len(), HENTRY_MIME_LEN);
    }

    #[test]
    fn chunk_span_counts_leading_offset() {
        let mut entry = sample_entry();
        entry.offset = 0;
        entry.len = 5000;
        assert_eq!(entry.chunk_span(4096), 2);
        entry.offset = 4000;
        assert_eq!(entry.chunk_span(4096), 3);
        entry.len = 0;
        entry.offset = 0;
        assert_eq!(entry.chunk_span(4096), 0);
    }

    #[test]
    fn set_flags_in_rewrites_only_flags() {
        let entry = sample_entry();
        let mut record = vec![0_u8; HENTRY_SIZE];
        entry.encode_into(&mut record).expect("encode");
        HashEntry::set_flags_in(&mut record, HENTRY_FLAG_HIDDEN).expect("flags");
        let parsed = HashEntry::parse(&record, hlen32()).expect("parse");
        assert!(parsed.is_hidden());
        assert!(!parsed.is_default());
        assert_eq!(parsed.len, entry.len);
    }
}
