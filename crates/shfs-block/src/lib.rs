#![forbid(unsafe_code)]
//! Member-device I/O and striped chunk addressing.
//!
//! Provides `Disk` (an opened member device with positioned I/O), the
//! `MemberDevice` trait it implements, `AlignedBuf` for chunk-sized aligned
//! buffers, and `StripedVolume`, which translates chunk numbers into
//! per-member byte offsets under the two stripe modes and issues synchronous
//! chunk-aligned reads and writes.

use shfs_error::{Result, ShfsError};
use shfs_types::{ByteOffset, CHUNK0_SIZE, CancelFlag, ChunkNo, MAX_MEMBERS, StripeMode};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

#[inline]
fn checkpoint(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_set() {
        return Err(ShfsError::Cancelled);
    }
    Ok(())
}

const DEFAULT_CHUNK_ALIGNMENT: usize = 4096;

#[inline]
fn normalized_alignment(requested: usize) -> usize {
    if requested <= 1 {
        1
    } else if requested.is_power_of_two() {
        requested
    } else {
        requested.next_power_of_two()
    }
}

/// Owned byte buffer whose exposed slice starts at a requested alignment.
///
/// Stays fully safe by over-allocating and exposing an aligned subslice of
/// the backing storage.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    #[must_use]
    pub fn new(size: usize, alignment: usize) -> Self {
        let alignment = normalized_alignment(alignment);
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }

        let storage = vec![0_u8; size + alignment - 1];
        let misalignment = storage.as_ptr() as usize & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
        }
    }

    /// Chunk-aligned buffer of `size` bytes.
    #[must_use]
    pub fn for_chunk(size: usize) -> Self {
        Self::new(size, DEFAULT_CHUNK_ALIGNMENT)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for AlignedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedBuf {}

/// One opened member device of a volume (pread/pwrite semantics).
pub trait MemberDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Native block size reported by the device.
    fn block_size(&self) -> u32;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cancel: &CancelFlag, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cancel: &CancelFlag, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cancel: &CancelFlag) -> Result<()>;
}

/// File-backed member device using positioned `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` retries short transfers internally, so a
/// successful return means the full buffer moved.
#[derive(Debug, Clone)]
pub struct Disk {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
    block_size: u32,
}

impl Disk {
    /// Open a member device read/write.
    ///
    /// The byte length comes from metadata; block special files report zero
    /// there, so a seek-to-end fallback covers them. The native block size is
    /// the filesystem-reported I/O size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let meta = file.metadata()?;
        let mut len = meta.len();
        if len == 0 {
            len = (&file).seek(SeekFrom::End(0))?;
        }
        let block_size = u32::try_from(meta.blksize()).unwrap_or(u32::MAX);
        debug!(
            target: "shfs::block",
            path = %path.display(),
            len_bytes = len,
            block_size,
            "opened member device"
        );
        Ok(Self {
            file: Arc::new(file),
            path,
            len,
            block_size,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: ByteOffset, len: usize, what: &str) -> Result<()> {
        let len = u64::try_from(len)
            .map_err(|_| ShfsError::Format(format!("{what} length overflows u64")))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| ShfsError::Format(format!("{what} range overflows u64")))?;
        if end.0 > self.len {
            return Err(ShfsError::Format(format!(
                "{what} out of bounds on {}: offset={offset} len={len} device_len={}",
                self.path.display(),
                self.len
            )));
        }
        Ok(())
    }
}

impl MemberDevice for Disk {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_exact_at(&self, cancel: &CancelFlag, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        checkpoint(cancel)?;
        self.check_range(offset, buf.len(), "read")?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, cancel: &CancelFlag, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        checkpoint(cancel)?;
        self.check_range(offset, buf.len(), "write")?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self, cancel: &CancelFlag) -> Result<()> {
        checkpoint(cancel)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read the fixed 4096-byte chunk 0 of a single member.
///
/// Chunk 0 addressing never goes through stripe math: the label must be
/// locatable before the stripe parameters are known.
pub fn read_chunk0(cancel: &CancelFlag, member: &dyn MemberDevice) -> Result<AlignedBuf> {
    let mut buf = AlignedBuf::for_chunk(CHUNK0_SIZE);
    member.read_exact_at(cancel, ByteOffset::ZERO, buf.as_mut_slice())?;
    Ok(buf)
}

/// An ordered set of member devices plus stripe parameters.
///
/// Translates chunk numbers to `(member, byte offset)` pairs and issues
/// synchronous chunk-aligned I/O. The addressable chunk space is
/// `[0, volsize]`.
pub struct StripedVolume<D: MemberDevice = Disk> {
    members: Vec<D>,
    stripesize: u32,
    stripemode: StripeMode,
    chunksize: u32,
    volsize: u64,
}

impl<D: MemberDevice> StripedVolume<D> {
    pub fn new(
        members: Vec<D>,
        stripesize: u32,
        stripemode: StripeMode,
        volsize: u64,
    ) -> Result<Self> {
        if members.is_empty() || members.len() > MAX_MEMBERS {
            return Err(ShfsError::Format(format!(
                "volume must have 1..={MAX_MEMBERS} members, got {}",
                members.len()
            )));
        }
        if stripesize < 4096 || !stripesize.is_power_of_two() {
            return Err(ShfsError::Format(format!(
                "stripe size {stripesize} is not a power of two >= 4096"
            )));
        }
        let chunksize = match stripemode {
            StripeMode::Combined => stripesize * members.len() as u32,
            StripeMode::Independent => stripesize,
        };
        Ok(Self {
            members,
            stripesize,
            stripemode,
            chunksize,
            volsize,
        })
    }

    #[must_use]
    pub fn chunksize(&self) -> u32 {
        self.chunksize
    }

    #[must_use]
    pub fn stripesize(&self) -> u32 {
        self.stripesize
    }

    #[must_use]
    pub fn stripemode(&self) -> StripeMode {
        self.stripemode
    }

    #[must_use]
    pub fn volsize(&self) -> u64 {
        self.volsize
    }

    #[must_use]
    pub fn nb_members(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn member(&self, index: usize) -> &D {
        &self.members[index]
    }

    fn check_span(&self, start: ChunkNo, count: u64, buf_len: usize) -> Result<()> {
        if count == 0 {
            return Err(ShfsError::Format("chunk I/O needs count >= 1".to_string()));
        }
        let end = start
            .checked_add(count)
            .ok_or_else(|| ShfsError::Format("chunk range overflows u64".to_string()))?;
        if end.0 > self.volsize.saturating_add(1) {
            return Err(ShfsError::Format(format!(
                "chunk range [{start}, {end}) exceeds volume of {} chunks",
                self.volsize.saturating_add(1)
            )));
        }
        let expected = count
            .checked_mul(u64::from(self.chunksize))
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| ShfsError::Format("chunk buffer size overflows".to_string()))?;
        if buf_len != expected {
            return Err(ShfsError::Format(format!(
                "chunk buffer is {buf_len} bytes, expected {expected}"
            )));
        }
        Ok(())
    }

    /// Apply `op` to every (member, member offset, buffer range) segment of
    /// one chunk. Segment order within a chunk is member order.
    fn map_chunk(&self, chunk: ChunkNo) -> Vec<(usize, ByteOffset, usize, usize)> {
        let stripesize = usize::try_from(self.stripesize).unwrap_or(usize::MAX);
        match self.stripemode {
            StripeMode::Combined => (0..self.members.len())
                .map(|m| {
                    (
                        m,
                        ByteOffset(chunk.0 * u64::from(self.stripesize)),
                        m * stripesize,
                        stripesize,
                    )
                })
                .collect(),
            StripeMode::Independent => {
                let nb = self.members.len() as u64;
                let member = usize::try_from(chunk.0 % nb).unwrap_or(0);
                let offset = ByteOffset((chunk.0 / nb) * u64::from(self.stripesize));
                vec![(member, offset, 0, stripesize)]
            }
        }
    }

    /// Read `count` chunks starting at `start_chk` into `buf`.
    ///
    /// `buf` must be exactly `count * chunksize` bytes. On failure the buffer
    /// contents are unspecified.
    pub fn read_chunks(
        &self,
        cancel: &CancelFlag,
        start_chk: ChunkNo,
        count: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        self.check_span(start_chk, count, buf.len())?;
        let chunksize = usize::try_from(self.chunksize).unwrap_or(usize::MAX);
        for c in 0..count {
            checkpoint(cancel)?;
            let chunk = ChunkNo(start_chk.0 + c);
            let base = usize::try_from(c).unwrap_or(usize::MAX) * chunksize;
            for (member, offset, seg_off, seg_len) in self.map_chunk(chunk) {
                let segment = &mut buf[base + seg_off..base + seg_off + seg_len];
                self.members[member].read_exact_at(cancel, offset, segment)?;
            }
        }
        trace!(
            target: "shfs::block",
            start = start_chk.0,
            count,
            "read chunks"
        );
        Ok(())
    }

    /// Write `count` chunks starting at `start_chk` from `buf`.
    ///
    /// `buf` must be exactly `count * chunksize` bytes.
    pub fn write_chunks(
        &self,
        cancel: &CancelFlag,
        start_chk: ChunkNo,
        count: u64,
        buf: &[u8],
    ) -> Result<()> {
        self.check_span(start_chk, count, buf.len())?;
        let chunksize = usize::try_from(self.chunksize).unwrap_or(usize::MAX);
        for c in 0..count {
            checkpoint(cancel)?;
            let chunk = ChunkNo(start_chk.0 + c);
            let base = usize::try_from(c).unwrap_or(usize::MAX) * chunksize;
            for (member, offset, seg_off, seg_len) in self.map_chunk(chunk) {
                let segment = &buf[base + seg_off..base + seg_off + seg_len];
                self.members[member].write_all_at(cancel, offset, segment)?;
            }
        }
        trace!(
            target: "shfs::block",
            start = start_chk.0,
            count,
            "wrote chunks"
        );
        Ok(())
    }

    /// Flush every member.
    pub fn sync(&self, cancel: &CancelFlag) -> Result<()> {
        for member in &self.members {
            member.sync(cancel)?;
        }
        Ok(())
    }
}

impl<D: MemberDevice> std::fmt::Debug for StripedVolume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedVolume")
            .field("nb_members", &self.members.len())
            .field("stripesize", &self.stripesize)
            .field("stripemode", &self.stripemode)
            .field("chunksize", &self.chunksize)
            .field("volsize", &self.volsize)
            .finish_non_exhaustive()
    }
}
