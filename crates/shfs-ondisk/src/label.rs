#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use shfs_types::{
    BOOT_AREA_LENGTH, CHUNK0_SIZE, HENTRY_SIZE, MAX_MEMBERS, ParseError, SHFS_MAGIC, SHFS_VERSION,
    StripeMode, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded,
    write_le_u16, write_le_u32, write_le_u64, write_padded,
};

// Common header field offsets, relative to BOOT_AREA_LENGTH within chunk 0.
const HDR_MAGIC: usize = 0x00;
const HDR_VERSION: usize = 0x04;
const HDR_VOL_UUID: usize = 0x08;
const HDR_VOL_NAME: usize = 0x18;
const HDR_VOL_TS_CREATION: usize = 0x28;
const HDR_VOL_SIZE: usize = 0x30;
const HDR_STRIPESIZE: usize = 0x38;
const HDR_STRIPEMODE: usize = 0x3C;
const HDR_MEMBER_COUNT: usize = 0x3D;
const HDR_MEMBER_UUID: usize = 0x40;
const HDR_MEMBER_TABLE: usize = 0x50;

/// Total bytes occupied by the common header.
pub const COMMON_HEADER_SIZE: usize = HDR_MEMBER_TABLE + MAX_MEMBERS * 16;

// Config header field offsets, relative to the start of chunk 1.
const CFG_HTABLE_REF: usize = 0x00;
const CFG_HTABLE_BAK_REF: usize = 0x08;
const CFG_BUCKET_COUNT: usize = 0x10;
const CFG_ENTRIES_PER_BUCKET: usize = 0x14;
const CFG_HLEN: usize = 0x18;
const CFG_HFUNC: usize = 0x19;
const CFG_ALLOCATOR: usize = 0x1A;

/// Total bytes occupied by the configuration header.
pub const CONFIG_HEADER_SIZE: usize = 0x20;

/// Hash digest function identifier (only SHA-256 is defined).
pub const HFUNC_SHA256: u8 = 1;

/// Free-space allocator kind stored in the config header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatorKind {
    FirstFit,
}

impl AllocatorKind {
    /// Unknown kinds are rejected; an unrecognized allocator makes the
    /// volume unmountable rather than silently misallocated.
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::FirstFit),
            _ => Err(ParseError::InvalidField {
                field: "allocator",
                reason: "unknown allocator kind",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::FirstFit => 1,
        }
    }
}

/// Validate the SHFS label magic and version in a raw chunk 0.
///
/// This is the cheap probe the loader runs against every candidate device
/// before committing to a full header parse.
pub fn detect_hdr0(chk0: &[u8]) -> Result<(), ParseError> {
    let magic = read_fixed::<4>(chk0, BOOT_AREA_LENGTH + HDR_MAGIC)?;
    if magic != SHFS_MAGIC {
        return Err(ParseError::InvalidMagic);
    }
    let version = read_le_u16(chk0, BOOT_AREA_LENGTH + HDR_VERSION)?;
    if version != SHFS_VERSION {
        return Err(ParseError::UnsupportedVersion {
            expected: SHFS_VERSION,
            actual: version,
        });
    }
    Ok(())
}

/// Common volume header, one copy per member at the start of chunk 0.
///
/// All copies agree except `member_uuid`, which names the member the copy
/// was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonHeader {
    pub vol_uuid: [u8; 16],
    pub vol_name: String,
    pub vol_ts_creation: u64,
    /// Volume size in chunks; the addressable chunk space is `vol_size + 1`.
    pub vol_size: u64,
    pub stripesize: u32,
    pub stripemode: StripeMode,
    /// UUID of the member this header copy sits on.
    pub member_uuid: [u8; 16],
    /// Declared member UUIDs in stripe order.
    pub members: Vec<[u8; 16]>,
}

impl CommonHeader {
    /// Parse the common header out of a raw 4096-byte chunk 0.
    pub fn parse_chunk0(chk0: &[u8]) -> Result<Self, ParseError> {
        detect_hdr0(chk0)?;
        let hdr = ensure_slice(chk0, BOOT_AREA_LENGTH, COMMON_HEADER_SIZE)?;

        let stripemode_raw = ensure_slice(hdr, HDR_STRIPEMODE, 1)?[0];
        let stripemode =
            StripeMode::from_raw(stripemode_raw).ok_or(ParseError::InvalidField {
                field: "member_stripemode",
                reason: "unsupported stripe mode",
            })?;

        let member_count = usize::from(ensure_slice(hdr, HDR_MEMBER_COUNT, 1)?[0]);
        if member_count == 0 || member_count > MAX_MEMBERS {
            return Err(ParseError::InvalidField {
                field: "member_count",
                reason: "must be in 1..=16",
            });
        }

        let mut members = Vec::with_capacity(member_count);
        for i in 0..member_count {
            members.push(read_fixed::<16>(hdr, HDR_MEMBER_TABLE + i * 16)?);
        }

        Ok(Self {
            vol_uuid: read_fixed::<16>(hdr, HDR_VOL_UUID)?,
            vol_name: trim_nul_padded(&read_fixed::<16>(hdr, HDR_VOL_NAME)?),
            vol_ts_creation: read_le_u64(hdr, HDR_VOL_TS_CREATION)?,
            vol_size: read_le_u64(hdr, HDR_VOL_SIZE)?,
            stripesize: read_le_u32(hdr, HDR_STRIPESIZE)?,
            stripemode,
            member_uuid: read_fixed::<16>(hdr, HDR_MEMBER_UUID)?,
            members,
        })
    }

    /// Encode this header into a 4096-byte chunk 0 buffer, leaving the boot
    /// area untouched.
    pub fn encode_chunk0(&self, chk0: &mut [u8]) -> Result<(), ParseError> {
        if chk0.len() < CHUNK0_SIZE {
            return Err(ParseError::InsufficientData {
                needed: CHUNK0_SIZE,
                offset: 0,
                actual: chk0.len(),
            });
        }
        if self.members.is_empty() || self.members.len() > MAX_MEMBERS {
            return Err(ParseError::InvalidField {
                field: "member_count",
                reason: "must be in 1..=16",
            });
        }

        let hdr = &mut chk0[BOOT_AREA_LENGTH..BOOT_AREA_LENGTH + COMMON_HEADER_SIZE];
        hdr.fill(0);
        hdr[HDR_MAGIC..HDR_MAGIC + 4].copy_from_slice(&SHFS_MAGIC);
        write_le_u16(hdr, HDR_VERSION, SHFS_VERSION);
        hdr[HDR_VOL_UUID..HDR_VOL_UUID + 16].copy_from_slice(&self.vol_uuid);
        write_padded::<16>(hdr, HDR_VOL_NAME, &self.vol_name);
        write_le_u64(hdr, HDR_VOL_TS_CREATION, self.vol_ts_creation);
        write_le_u64(hdr, HDR_VOL_SIZE, self.vol_size);
        write_le_u32(hdr, HDR_STRIPESIZE, self.stripesize);
        hdr[HDR_STRIPEMODE] = self.stripemode.to_raw();
        hdr[HDR_MEMBER_COUNT] = self.members.len() as u8;
        hdr[HDR_MEMBER_UUID..HDR_MEMBER_UUID + 16].copy_from_slice(&self.member_uuid);
        for (i, uuid) in self.members.iter().enumerate() {
            let at = HDR_MEMBER_TABLE + i * 16;
            hdr[at..at + 16].copy_from_slice(uuid);
        }
        Ok(())
    }

    /// Logical chunk size implied by the stripe parameters.
    #[must_use]
    pub fn chunksize(&self) -> u32 {
        match self.stripemode {
            StripeMode::Combined => self.stripesize * self.members.len() as u32,
            StripeMode::Independent => self.stripesize,
        }
    }
}

/// Volume configuration header stored in chunk 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigHeader {
    /// First chunk of the hash table.
    pub htable_ref: u64,
    /// First chunk of the backup hash table; 0 means no backup.
    pub htable_bak_ref: u64,
    pub htable_bucket_count: u32,
    pub htable_entries_per_bucket: u32,
    /// Content hash width in bytes.
    pub hlen: u8,
    pub hfunc: u8,
    pub allocator: AllocatorKind,
}

impl ConfigHeader {
    pub fn parse(chk1: &[u8]) -> Result<Self, ParseError> {
        let cfg = ensure_slice(chk1, 0, CONFIG_HEADER_SIZE)?;
        let hdr = Self {
            htable_ref: read_le_u64(cfg, CFG_HTABLE_REF)?,
            htable_bak_ref: read_le_u64(cfg, CFG_HTABLE_BAK_REF)?,
            htable_bucket_count: read_le_u32(cfg, CFG_BUCKET_COUNT)?,
            htable_entries_per_bucket: read_le_u32(cfg, CFG_ENTRIES_PER_BUCKET)?,
            hlen: cfg[CFG_HLEN],
            hfunc: cfg[CFG_HFUNC],
            allocator: AllocatorKind::from_raw(cfg[CFG_ALLOCATOR])?,
        };
        if hdr.htable_bucket_count == 0 || hdr.htable_entries_per_bucket == 0 {
            return Err(ParseError::InvalidField {
                field: "htable_bucket_count",
                reason: "hash table must have at least one bucket slot",
            });
        }
        Ok(hdr)
    }

    pub fn encode(&self, chk1: &mut [u8]) -> Result<(), ParseError> {
        if chk1.len() < CONFIG_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: CONFIG_HEADER_SIZE,
                offset: 0,
                actual: chk1.len(),
            });
        }
        chk1[..CONFIG_HEADER_SIZE].fill(0);
        write_le_u64(chk1, CFG_HTABLE_REF, self.htable_ref);
        write_le_u64(chk1, CFG_HTABLE_BAK_REF, self.htable_bak_ref);
        write_le_u32(chk1, CFG_BUCKET_COUNT, self.htable_bucket_count);
        write_le_u32(chk1, CFG_ENTRIES_PER_BUCKET, self.htable_entries_per_bucket);
        chk1[CFG_HLEN] = self.hlen;
        chk1[CFG_HFUNC] = self.hfunc;
        chk1[CFG_ALLOCATOR] = self.allocator.to_raw();
        Ok(())
    }

    /// Total entry slots in the hash table.
    #[must_use]
    pub fn nb_entries(&self) -> u64 {
        u64::from(self.htable_bucket_count) * u64::from(self.htable_entries_per_bucket)
    }

    /// Entry records packed into one chunk.
    #[must_use]
    pub fn entries_per_chunk(&self, chunksize: u32) -> u64 {
        u64::from(chunksize) / HENTRY_SIZE as u64
    }

    /// Hash table length in chunks.
    #[must_use]
    pub fn htable_len(&self, chunksize: u32) -> u64 {
        let per_chunk = self.entries_per_chunk(chunksize);
        if per_chunk == 0 {
            return 0;
        }
        self.nb_entries().div_ceil(per_chunk)
    }
}
