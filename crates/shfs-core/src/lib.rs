#![forbid(unsafe_code)]
//! Mounted-volume state and the operations that mutate it.
//!
//! `Volume::mount` probes a device list, validates the SHFS labels, assembles
//! the striped member set, loads the hash table into the chunk cache and the
//! bucket index, and seeds the free-space allocator. All index mutations stay
//! in memory until `Volume::unmount`, the sole writeback point.

pub mod actions;
pub mod btable;
pub mod cache;

pub use actions::{Action, RunSummary, run_actions};
pub use btable::{BucketEntry, BucketTable};
pub use cache::HtableChunkCache;

use shfs_alloc::{AllocKind, ChunkAllocator, allocator_for};
use shfs_block::{Disk, MemberDevice, StripedVolume, read_chunk0};
use shfs_error::{Result, ShfsError};
use shfs_ondisk::label::HFUNC_SHA256;
use shfs_ondisk::{AllocatorKind, CommonHeader, ConfigHeader, HashEntry, detect_hdr0};
use shfs_types::{CancelFlag, ChunkNo, HashLen, MAX_MEMBERS, ObjectHash, StripeMode};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[inline]
fn checkpoint(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_set() {
        return Err(ShfsError::Cancelled);
    }
    Ok(())
}

/// Read-mostly volume metadata assembled at mount.
#[derive(Debug, Clone)]
pub struct VolumeMeta {
    pub vol_uuid: [u8; 16],
    pub volname: String,
    pub vol_ts_creation: u64,
    /// Volume size in chunks; the chunk space is `[0, volsize]`.
    pub volsize: u64,
    pub chunksize: u32,
    pub stripesize: u32,
    pub stripemode: StripeMode,
    pub member_uuids: Vec<[u8; 16]>,
    pub htable_ref: u64,
    pub htable_bak_ref: u64,
    pub htable_nb_buckets: u32,
    pub htable_nb_entries_per_bucket: u32,
    pub htable_nb_entries: u64,
    pub htable_nb_entries_per_chunk: u64,
    pub htable_len: u64,
    pub hlen: HashLen,
    pub allocator: AllocatorKind,
}

impl VolumeMeta {
    #[must_use]
    pub fn nb_members(&self) -> usize {
        self.member_uuids.len()
    }

    /// Chunks occupied by volume metadata: label + config plus the hash
    /// table region(s).
    #[must_use]
    pub fn metadata_chunks(&self) -> u64 {
        let replicas = if self.htable_bak_ref != 0 { 2 } else { 1 };
        2 + self.htable_len * replicas
    }
}

/// A mounted SHFS volume.
pub struct Volume {
    pub(crate) meta: VolumeMeta,
    pub(crate) striped: StripedVolume<Disk>,
    pub(crate) cache: HtableChunkCache,
    pub(crate) btable: BucketTable,
    pub(crate) alloc: Box<dyn ChunkAllocator>,
    /// Slot index of the entry carrying the DEFAULT flag, if any.
    pub(crate) def_slot: Option<u64>,
}

struct DetectedMember {
    disk: Disk,
    uuid: [u8; 16],
}

/// Open every candidate device, validate its block size and SHFS label, and
/// collect the per-member UUIDs. The first parsed header becomes the
/// authoritative volume description.
fn probe_members(
    cancel: &CancelFlag,
    paths: &[PathBuf],
) -> Result<(Vec<DetectedMember>, CommonHeader)> {
    if paths.is_empty() {
        return Err(ShfsError::Format("no member devices given".to_string()));
    }
    if paths.len() > MAX_MEMBERS {
        return Err(ShfsError::Format(format!(
            "more devices passed than supported by a single volume (max {MAX_MEMBERS})"
        )));
    }

    let mut detected = Vec::with_capacity(paths.len());
    let mut first_header: Option<CommonHeader> = None;
    for path in paths {
        let disk = Disk::open(path)?;
        let blksize = disk.block_size();
        if blksize < 512 || !blksize.is_power_of_two() {
            return Err(ShfsError::Format(format!(
                "{} has an incompatible block size ({blksize})",
                path.display()
            )));
        }

        let chk0 = read_chunk0(cancel, &disk)?;
        detect_hdr0(chk0.as_slice()).map_err(|source| ShfsError::Label {
            device: path.display().to_string(),
            source,
        })?;
        let header =
            CommonHeader::parse_chunk0(chk0.as_slice()).map_err(|source| ShfsError::Label {
                device: path.display().to_string(),
                source,
            })?;
        debug!(
            target: "shfs::vol",
            device = %path.display(),
            member_uuid = %Uuid::from_bytes(header.member_uuid),
            "SHFSv1 label detected"
        );
        detected.push(DetectedMember {
            disk,
            uuid: header.member_uuid,
        });
        if first_header.is_none() {
            first_header = Some(header);
        }
    }

    let header = first_header.expect("at least one device probed");
    Ok((detected, header))
}

/// Order the detected members by the label's declared member list.
fn order_members(header: &CommonHeader, mut detected: Vec<DetectedMember>) -> Result<Vec<Disk>> {
    let mut placed_uuids: Vec<[u8; 16]> = Vec::with_capacity(header.members.len());
    let mut ordered = Vec::with_capacity(header.members.len());

    for declared in &header.members {
        if placed_uuids.contains(declared) {
            return Err(ShfsError::Format(format!(
                "member {} is declared multiple times for volume '{}'",
                Uuid::from_bytes(*declared),
                header.vol_name
            )));
        }
        let Some(pos) = detected.iter().position(|m| m.uuid == *declared) else {
            return Err(ShfsError::Format(format!(
                "could not establish member mapping for volume '{}': member {} not among the given devices",
                header.vol_name,
                Uuid::from_bytes(*declared)
            )));
        };
        let member = detected.swap_remove(pos);
        placed_uuids.push(member.uuid);
        ordered.push(member.disk);
    }

    if !detected.is_empty() {
        return Err(ShfsError::Format(format!(
            "more devices specified than required for volume '{}'",
            header.vol_name
        )));
    }
    Ok(ordered)
}

/// Low-level volume assembly: label cross-referencing, stripe validation and
/// the minimum member size check.
fn load_vol_cconf(cancel: &CancelFlag, paths: &[PathBuf]) -> Result<(StripedVolume<Disk>, CommonHeader)> {
    let (detected, header) = probe_members(cancel, paths)?;
    let ordered = order_members(&header, detected)?;
    let nb_members = ordered.len() as u64;

    if header.stripesize < 4096 || !header.stripesize.is_power_of_two() {
        return Err(ShfsError::Format(format!(
            "stripe size invalid on volume '{}'",
            header.vol_name
        )));
    }

    let min_member_size = match header.stripemode {
        StripeMode::Combined => (header.vol_size + 1) * u64::from(header.stripesize),
        StripeMode::Independent => {
            ((header.vol_size + 1) / nb_members) * u64::from(header.stripesize)
        }
    };
    for (i, disk) in ordered.iter().enumerate() {
        if disk.len_bytes() < min_member_size {
            return Err(ShfsError::Format(format!(
                "member {i} of volume '{}' is too small ({} < {min_member_size} bytes)",
                header.vol_name,
                disk.len_bytes()
            )));
        }
    }

    let striped = StripedVolume::new(
        ordered,
        header.stripesize,
        header.stripemode,
        header.vol_size,
    )?;
    Ok((striped, header))
}

/// Load the hash and allocator configuration from chunk 1.
fn load_vol_hconf(cancel: &CancelFlag, striped: &StripedVolume<Disk>) -> Result<ConfigHeader> {
    let mut chk1 = shfs_block::AlignedBuf::for_chunk(striped.chunksize() as usize);
    striped.read_chunks(cancel, ChunkNo(1), 1, chk1.as_mut_slice())?;
    let config = ConfigHeader::parse(chk1.as_slice())?;

    if config.htable_len(striped.chunksize()) == 0 {
        return Err(ShfsError::Format("malformed SHFS configuration".to_string()));
    }
    if config.hfunc != HFUNC_SHA256 {
        return Err(ShfsError::Format(format!(
            "unsupported hash function {:#x}",
            config.hfunc
        )));
    }
    HashLen::new(config.hlen)?;
    Ok(config)
}

impl Volume {
    /// Mount the volume found on `paths`.
    ///
    /// Every step is fatal on failure; opened devices of prior steps are
    /// released by drop.
    pub fn mount(cancel: &CancelFlag, paths: &[PathBuf]) -> Result<Self> {
        checkpoint(cancel)?;
        let (striped, header) = load_vol_cconf(cancel, paths)?;
        let config = load_vol_hconf(cancel, &striped)?;

        let hlen = HashLen::new(config.hlen)?;
        let chunksize = striped.chunksize();
        let meta = VolumeMeta {
            vol_uuid: header.vol_uuid,
            volname: header.vol_name.clone(),
            vol_ts_creation: header.vol_ts_creation,
            volsize: header.vol_size,
            chunksize,
            stripesize: header.stripesize,
            stripemode: header.stripemode,
            member_uuids: header.members.clone(),
            htable_ref: config.htable_ref,
            htable_bak_ref: config.htable_bak_ref,
            htable_nb_buckets: config.htable_bucket_count,
            htable_nb_entries_per_bucket: config.htable_entries_per_bucket,
            htable_nb_entries: config.nb_entries(),
            htable_nb_entries_per_chunk: config.entries_per_chunk(chunksize),
            htable_len: config.htable_len(chunksize),
            hlen,
            allocator: config.allocator,
        };

        let (mut cache, btable, def_slot) = load_vol_htable(cancel, &striped, &meta)?;
        let alloc = load_vol_alist(cancel, &striped, &meta, &btable, &mut cache)?;

        info!(
            target: "shfs::vol",
            volume = %meta.volname,
            uuid = %Uuid::from_bytes(meta.vol_uuid),
            volsize = meta.volsize,
            chunksize = meta.chunksize,
            members = meta.nb_members(),
            entries = btable.occupied_count(),
            "volume mounted"
        );
        // The mount scan touched every hash table chunk; nothing stays dirty.
        debug_assert_eq!(cache.dirty_count(), 0);

        Ok(Self {
            meta,
            striped,
            cache,
            btable,
            alloc,
            def_slot,
        })
    }

    /// Flush dirty hash-table chunks (primary then backup), release every
    /// buffer and close the member devices.
    ///
    /// Cleanup always runs to completion; a writeback failure is reported
    /// after the remaining chunks were attempted.
    pub fn unmount(mut self) -> Result<()> {
        // Writeback must proceed even when the run was cancelled.
        let no_cancel = CancelFlag::new();
        let dirty = self.cache.dirty_count();
        let flush_result = self.cache.flush(&no_cancel, &self.striped);
        let sync_result = self.striped.sync(&no_cancel);
        info!(
            target: "shfs::vol",
            volume = %self.meta.volname,
            dirty_chunks = dirty,
            "volume unmounted"
        );
        drop(self.striped);
        flush_result?;
        sync_result
    }

    #[must_use]
    pub fn meta(&self) -> &VolumeMeta {
        &self.meta
    }

    /// Free ranges of the allocator, for diagnostics and tests.
    #[must_use]
    pub fn free_ranges(&self) -> Vec<(u64, u64)> {
        self.alloc.free_ranges()
    }

    #[must_use]
    pub fn occupied_count(&self) -> u64 {
        self.btable.occupied_count()
    }

    /// Look up an entry by hash.
    #[must_use]
    pub fn lookup(&self, hash: &ObjectHash) -> Option<(u64, BucketEntry)> {
        self.btable.lookup(hash)
    }

    /// Parse and read the on-disk record at `loc`.
    pub fn read_entry(&mut self, cancel: &CancelFlag, loc: BucketEntry) -> Result<HashEntry> {
        let record = self.cache.entry_bytes(cancel, &self.striped, loc)?;
        Ok(HashEntry::parse(record, self.meta.hlen)?)
    }

    /// Encode `entry` into the record at `loc` and mark the chunk dirty.
    pub fn write_entry(
        &mut self,
        cancel: &CancelFlag,
        loc: BucketEntry,
        entry: &HashEntry,
    ) -> Result<()> {
        let record = self.cache.entry_bytes_mut(cancel, &self.striped, loc)?;
        entry.encode_into(record)?;
        self.cache.mark_dirty(loc.htchunk)
    }

    /// All occupied entries in stable order, parsed.
    pub fn entries(&mut self, cancel: &CancelFlag) -> Result<Vec<HashEntry>> {
        let coords: Vec<BucketEntry> =
            self.btable.iter_occupied().map(|(_, _, e)| e).collect();
        coords
            .into_iter()
            .map(|loc| self.read_entry(cancel, loc))
            .collect()
    }

    /// The entry currently carrying the DEFAULT flag, if any.
    pub fn default_entry(&mut self, cancel: &CancelFlag) -> Result<Option<HashEntry>> {
        let Some(slot) = self.def_slot else {
            return Ok(None);
        };
        let loc = self.cache.location_of(slot);
        self.read_entry(cancel, loc).map(Some)
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("volname", &self.meta.volname)
            .field("volsize", &self.meta.volsize)
            .field("entries", &self.btable.occupied_count())
            .finish_non_exhaustive()
    }
}

/// Load the hash table chunk-wise, seating every slot of the bucket table.
fn load_vol_htable(
    cancel: &CancelFlag,
    striped: &StripedVolume<Disk>,
    meta: &VolumeMeta,
) -> Result<(HtableChunkCache, BucketTable, Option<u64>)> {
    debug!(target: "shfs::vol", len = meta.htable_len, "reading hash table");
    let mut cache = HtableChunkCache::new(
        meta.htable_ref,
        meta.htable_bak_ref,
        meta.htable_len,
        meta.chunksize,
        meta.htable_nb_entries_per_chunk,
    );
    let mut btable = BucketTable::new(
        meta.htable_nb_buckets,
        meta.htable_nb_entries_per_bucket,
        meta.hlen,
    );
    let mut def_slot = None;

    for index in 0..meta.htable_nb_entries {
        let loc = cache.location_of(index);
        let record = cache.entry_bytes(cancel, striped, loc)?;
        let hash = HashEntry::parse_hash(record, meta.hlen)?;
        let occupied = !hash.is_zero();
        if occupied {
            let entry = HashEntry::parse(record, meta.hlen)?;
            if entry.is_default() {
                def_slot = Some(index);
            }
        }
        btable.feed(index, hash, loc)?;
    }
    Ok((cache, btable, def_slot))
}

/// Seed the allocator: label + config chunks, hash table region(s), and one
/// range per occupied entry.
fn load_vol_alist(
    cancel: &CancelFlag,
    striped: &StripedVolume<Disk>,
    meta: &VolumeMeta,
    btable: &BucketTable,
    cache: &mut HtableChunkCache,
) -> Result<Box<dyn ChunkAllocator>> {
    debug!(target: "shfs::vol", "initializing volume allocator");
    let kind = match meta.allocator {
        AllocatorKind::FirstFit => AllocKind::FirstFit,
    };
    let mut alloc = allocator_for(kind, meta.volsize);

    alloc.register(0, 2)?;
    alloc.register(meta.htable_ref, meta.htable_len)?;
    if meta.htable_bak_ref != 0 {
        alloc.register(meta.htable_bak_ref, meta.htable_len)?;
    }

    for (_, hash, loc) in btable.iter_occupied() {
        let record = cache.entry_bytes(cancel, striped, loc)?;
        let entry = HashEntry::parse(record, meta.hlen)?;
        let span = entry.chunk_span(meta.chunksize);
        if let Err(error) = alloc.register(entry.chunk, span) {
            // A malformed table can declare overlapping containers; keep the
            // volume mountable and leave the region as-is.
            warn!(
                target: "shfs::vol",
                hash = %hash,
                chunk = entry.chunk,
                span,
                %error,
                "could not reserve container range"
            );
        }
    }
    Ok(alloc)
}
