#![forbid(unsafe_code)]
//! Write-back cache over the hash-table chunks.
//!
//! One slot per hash-table chunk, loaded on first access. Mutations only mark
//! slots dirty; the volume is reconciled once, at unmount, when `flush`
//! rewrites every dirty chunk to the primary region and then to the backup
//! region if the volume carries one.

use crate::btable::BucketEntry;
use shfs_block::{AlignedBuf, MemberDevice, StripedVolume};
use shfs_error::{Result, ShfsError};
use shfs_types::{CancelFlag, ChunkNo, HENTRY_SIZE};
use tracing::{debug, warn};

#[derive(Debug)]
struct CacheSlot {
    buf: Option<AlignedBuf>,
    dirty: bool,
}

/// Per-chunk buffers of the hash-table region plus dirty flags.
#[derive(Debug)]
pub struct HtableChunkCache {
    htable_ref: u64,
    /// 0 means the volume has no backup hash table.
    htable_bak_ref: u64,
    chunksize: usize,
    entries_per_chunk: u64,
    slots: Vec<CacheSlot>,
}

impl HtableChunkCache {
    #[must_use]
    pub fn new(
        htable_ref: u64,
        htable_bak_ref: u64,
        htable_len: u64,
        chunksize: u32,
        entries_per_chunk: u64,
    ) -> Self {
        let len = usize::try_from(htable_len).unwrap_or(0);
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, || CacheSlot {
            buf: None,
            dirty: false,
        });
        Self {
            htable_ref,
            htable_bak_ref,
            chunksize: usize::try_from(chunksize).unwrap_or(0),
            entries_per_chunk,
            slots,
        }
    }

    /// Coordinates of hash-table entry `index`.
    #[must_use]
    pub fn location_of(&self, index: u64) -> BucketEntry {
        BucketEntry {
            htchunk: index / self.entries_per_chunk,
            htoffset: usize::try_from(index % self.entries_per_chunk).unwrap_or(0) * HENTRY_SIZE,
        }
    }

    #[must_use]
    pub fn htable_len(&self) -> u64 {
        self.slots.len() as u64
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|s| s.dirty).count()
    }

    fn slot_index(&self, htchunk: u64) -> Result<usize> {
        let index = usize::try_from(htchunk).unwrap_or(usize::MAX);
        if index >= self.slots.len() {
            return Err(ShfsError::Corruption {
                chunk: self.htable_ref.saturating_add(htchunk),
                detail: "hash table chunk index out of range".to_string(),
            });
        }
        Ok(index)
    }

    /// Buffer of hash-table chunk `htchunk`, loading it on first access.
    fn load<D: MemberDevice>(
        &mut self,
        cancel: &CancelFlag,
        striped: &StripedVolume<D>,
        htchunk: u64,
    ) -> Result<&mut AlignedBuf> {
        let index = self.slot_index(htchunk)?;
        if self.slots[index].buf.is_none() {
            let mut buf = AlignedBuf::for_chunk(self.chunksize);
            striped.read_chunks(
                cancel,
                ChunkNo(self.htable_ref + htchunk),
                1,
                buf.as_mut_slice(),
            )?;
            debug!(target: "shfs::cache", htchunk, "loaded hash table chunk");
            self.slots[index].buf = Some(buf);
        }
        Ok(self.slots[index].buf.as_mut().expect("buffer just loaded"))
    }

    /// The 256-byte record at `loc`.
    pub fn entry_bytes<D: MemberDevice>(
        &mut self,
        cancel: &CancelFlag,
        striped: &StripedVolume<D>,
        loc: BucketEntry,
    ) -> Result<&[u8]> {
        let offset = loc.htoffset;
        let buf = self.load(cancel, striped, loc.htchunk)?;
        Ok(&buf.as_slice()[offset..offset + HENTRY_SIZE])
    }

    /// Mutable access to the record at `loc`. The caller decides when the
    /// owning chunk becomes dirty.
    pub fn entry_bytes_mut<D: MemberDevice>(
        &mut self,
        cancel: &CancelFlag,
        striped: &StripedVolume<D>,
        loc: BucketEntry,
    ) -> Result<&mut [u8]> {
        let offset = loc.htoffset;
        let buf = self.load(cancel, striped, loc.htchunk)?;
        Ok(&mut buf.as_mut_slice()[offset..offset + HENTRY_SIZE])
    }

    pub fn mark_dirty(&mut self, htchunk: u64) -> Result<()> {
        let index = self.slot_index(htchunk)?;
        self.slots[index].dirty = true;
        Ok(())
    }

    #[must_use]
    pub fn is_dirty(&self, htchunk: u64) -> bool {
        usize::try_from(htchunk)
            .ok()
            .and_then(|i| self.slots.get(i))
            .is_some_and(|s| s.dirty)
    }

    /// Write every dirty chunk back, primary region first, then the backup
    /// replica if present.
    ///
    /// Write failures are reported as potential corruption and do not stop
    /// the sweep; the first error surfaces after every remaining chunk has
    /// been attempted.
    pub fn flush<D: MemberDevice>(
        &mut self,
        cancel: &CancelFlag,
        striped: &StripedVolume<D>,
    ) -> Result<()> {
        let mut first_error = None;
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if !slot.dirty {
                continue;
            }
            let Some(buf) = slot.buf.as_ref() else {
                continue;
            };
            let htchunk = index as u64;

            let mut targets = vec![self.htable_ref + htchunk];
            if self.htable_bak_ref != 0 {
                targets.push(self.htable_bak_ref + htchunk);
            }
            let mut ok = true;
            for target in targets {
                if let Err(error) =
                    striped.write_chunks(cancel, ChunkNo(target), 1, buf.as_slice())
                {
                    warn!(
                        target: "shfs::cache",
                        htchunk,
                        chunk = target,
                        %error,
                        "failed to write back a hash table chunk; the volume may be corrupted"
                    );
                    ok = false;
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
            if ok {
                self.slots[index].dirty = false;
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shfs_block::Disk;
    use shfs_types::StripeMode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CHUNKS: usize = 16;

    fn scratch_volume() -> (NamedTempFile, StripedVolume<Disk>) {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(&vec![0_u8; CHUNKS * 4096]).expect("fill");
        file.flush().expect("flush");
        let disk = Disk::open(file.path()).expect("open");
        let vol = StripedVolume::new(
            vec![disk],
            4096,
            StripeMode::Independent,
            (CHUNKS - 1) as u64,
        )
        .expect("volume");
        (file, vol)
    }

    fn cache() -> HtableChunkCache {
        // htable at chunks 2..6, no backup, 16 entries per chunk.
        HtableChunkCache::new(2, 0, 4, 4096, 16)
    }

    #[test]
    fn location_math() {
        let c = cache();
        assert_eq!(
            c.location_of(0),
            BucketEntry {
                htchunk: 0,
                htoffset: 0
            }
        );
        assert_eq!(
            c.location_of(17),
            BucketEntry {
                htchunk: 1,
                htoffset: 256
            }
        );
        assert_eq!(c.location_of(15).htchunk, 0);
        assert_eq!(c.location_of(15).htoffset, 15 * 256);
    }

    #[test]
    fn lazy_load_and_write_back() {
        let cancel = CancelFlag::new();
        let (_file, vol) = scratch_volume();

        // Seed the on-disk record behind entry 3 with a marker.
        let mut chunk = vec![0_u8; 4096];
        chunk[3 * 256] = 0xEE;
        vol.write_chunks(&cancel, ChunkNo(2), 1, &chunk).expect("seed");

        let mut c = cache();
        let loc = c.location_of(3);
        let record = c.entry_bytes(&cancel, &vol, loc).expect("entry");
        assert_eq!(record[0], 0xEE);

        // Mutate, mark dirty, flush, and confirm the bytes landed.
        c.entry_bytes_mut(&cancel, &vol, loc).expect("entry mut")[1] = 0x77;
        c.mark_dirty(loc.htchunk).expect("dirty");
        assert_eq!(c.dirty_count(), 1);
        c.flush(&cancel, &vol).expect("flush");
        assert_eq!(c.dirty_count(), 0);

        let mut readback = vec![0_u8; 4096];
        vol.read_chunks(&cancel, ChunkNo(2), 1, &mut readback)
            .expect("read");
        assert_eq!(readback[3 * 256], 0xEE);
        assert_eq!(readback[3 * 256 + 1], 0x77);
    }

    #[test]
    fn flush_writes_backup_replica() {
        let cancel = CancelFlag::new();
        let (_file, vol) = scratch_volume();

        // htable at 2..4, backup at 6..8.
        let mut c = HtableChunkCache::new(2, 6, 2, 4096, 16);
        let loc = c.location_of(20); // chunk 1, offset 4*256
        assert_eq!(loc.htchunk, 1);
        c.entry_bytes_mut(&cancel, &vol, loc).expect("entry")[0] = 0x42;
        c.mark_dirty(loc.htchunk).expect("dirty");
        c.flush(&cancel, &vol).expect("flush");

        let mut primary = vec![0_u8; 4096];
        vol.read_chunks(&cancel, ChunkNo(3), 1, &mut primary)
            .expect("primary");
        let mut backup = vec![0_u8; 4096];
        vol.read_chunks(&cancel, ChunkNo(7), 1, &mut backup)
            .expect("backup");
        assert_eq!(primary[4 * 256], 0x42);
        assert_eq!(backup, primary);
    }

    #[test]
    fn clean_cache_flush_writes_nothing() {
        let cancel = CancelFlag::new();
        let (_file, vol) = scratch_volume();
        let mut c = cache();
        let loc = c.location_of(0);
        c.entry_bytes(&cancel, &vol, loc).expect("load");
        c.flush(&cancel, &vol).expect("flush");
        assert_eq!(c.dirty_count(), 0);
    }

    #[test]
    fn out_of_range_chunk_is_corruption() {
        let mut c = cache();
        assert!(matches!(
            c.mark_dirty(9),
            Err(ShfsError::Corruption { .. })
        ));
    }
}
