#![forbid(unsafe_code)]
//! The action engine: interprets the user's token list over a mounted volume.
//!
//! Tokens execute strictly in input order; in-memory state is authoritative
//! and the disk is only reconciled at unmount. Failed tokens are counted and
//! the sequence continues; a cancellation aborts it. Object content I/O goes
//! straight to the volume, index mutations go through the bucket table, the
//! allocator and the dirty chunk cache.

use crate::{BucketEntry, Volume, checkpoint};
use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use shfs_block::{AlignedBuf, read_chunk0};
use shfs_error::{Result, ShfsError};
use shfs_ondisk::hentry::EntrySummary;
use shfs_ondisk::{CommonHeader, ConfigHeader, HashEntry};
use shfs_types::{
    CancelFlag, ChunkNo, HENTRY_FLAG_DEFAULT, HENTRY_FLAG_HIDDEN, ObjectHash, chunks_spanned,
};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};
use uuid::Uuid;

/// One user action token, in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    AddObj {
        path: PathBuf,
        mime: Option<String>,
        name: Option<String>,
    },
    RmObj { hash: String },
    CatObj { hash: String },
    SetDefault { hash: String },
    ClearDefault,
    Ls,
    Info,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddObj { path, .. } => write!(f, "add-obj {}", path.display()),
            Self::RmObj { hash } => write!(f, "rm-obj {hash}"),
            Self::CatObj { hash } => write!(f, "cat-obj {hash}"),
            Self::SetDefault { hash } => write!(f, "set-default {hash}"),
            Self::ClearDefault => write!(f, "clear-default"),
            Self::Ls => write!(f, "ls"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Outcome of an action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Tokens that started executing.
    pub executed: u32,
    /// Tokens that failed.
    pub failed: u32,
    /// The sequence was aborted by the cancel flag.
    pub cancelled: bool,
}

/// Execute `actions` in order against the mounted volume.
///
/// The cancel flag is polled between tokens and inside the per-chunk loops of
/// add/cat. Listing and object output go to `out`; diagnostics go to the log.
pub fn run_actions(
    cancel: &CancelFlag,
    volume: &mut Volume,
    actions: &[Action],
    out: &mut dyn Write,
) -> RunSummary {
    let mut summary = RunSummary::default();
    for (token, action) in actions.iter().enumerate() {
        if cancel.is_set() {
            summary.cancelled = true;
            break;
        }
        debug!(target: "shfs::action", token, %action, "executing");
        summary.executed += 1;

        let result = match action {
            Action::AddObj { path, mime, name } => {
                add_obj(cancel, volume, path, mime.as_deref(), name.as_deref())
            }
            Action::RmObj { hash } => rm_obj(cancel, volume, hash),
            Action::CatObj { hash } => cat_obj(cancel, volume, hash, out),
            Action::SetDefault { hash } => set_default(cancel, volume, hash),
            Action::ClearDefault => clear_default(cancel, volume),
            Action::Ls => ls(cancel, volume, out),
            Action::Info => info(cancel, volume, out),
        };

        match result {
            Ok(()) => {}
            Err(ShfsError::Cancelled) => {
                summary.cancelled = true;
                break;
            }
            Err(err) => {
                error!(target: "shfs::action", token, %action, "{err}");
                summary.failed += 1;
            }
        }
    }
    summary
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse_hash_arg(volume: &Volume, text: &str) -> Result<ObjectHash> {
    ObjectHash::parse_hex(text, volume.meta.hlen)
        .map_err(|_| ShfsError::BadHash(text.to_string()))
}

/// Digest the file contents chunk-wise, polling the cancel flag per chunk.
fn digest_file(
    cancel: &CancelFlag,
    file: &mut File,
    fsize: u64,
    chunksize: usize,
) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; chunksize];
    let mut left = fsize;
    while left > 0 {
        checkpoint(cancel)?;
        let rlen = usize::try_from(left.min(chunksize as u64)).expect("chunk fits usize");
        file.read_exact(&mut buf[..rlen])?;
        hasher.update(&buf[..rlen]);
        left -= rlen as u64;
    }
    Ok(hasher.finalize().to_vec())
}

fn add_obj(
    cancel: &CancelFlag,
    volume: &mut Volume,
    path: &Path,
    mime: Option<&str>,
    name: Option<&str>,
) -> Result<()> {
    let chunksize = volume.meta.chunksize;
    let mut file = File::open(path)?;
    let file_meta = file.metadata()?;
    if !file_meta.is_file() {
        return Err(ShfsError::NotRegularFile(path.display().to_string()));
    }
    let fsize = file_meta.len();

    // Find and reserve a container. A zero-length object reserves nothing
    // and only records where it would have lived.
    let csize = chunks_spanned(fsize, chunksize);
    debug!(target: "shfs::action", csize, "searching for a free container");
    let cchk = match volume.alloc.find_free(csize) {
        Some(chunk) if chunk != 0 && chunk < volume.meta.volsize => chunk,
        _ => return Err(ShfsError::NoSpace),
    };
    volume.alloc.register(cchk, csize)?;
    debug!(target: "shfs::action", cchk, "container reserved");

    // First pass: digest the contents. The reservation is rolled back on
    // every failure past this point until the entry is fully seated.
    let rollback = |volume: &mut Volume| {
        if let Err(error) = volume.alloc.unregister(cchk, csize) {
            error!(target: "shfs::action", %error, "could not discard container reservation");
        }
    };

    let digest = match digest_file(cancel, &mut file, fsize, chunksize as usize) {
        Ok(digest) => digest,
        Err(err) => {
            rollback(volume);
            return Err(err);
        }
    };
    let fhash = ObjectHash::from_digest(&digest, volume.meta.hlen);
    debug!(target: "shfs::action", "hash of {} is {fhash}", path.display());

    if volume.btable.lookup(&fhash).is_some() {
        rollback(volume);
        return Err(ShfsError::Duplicate(fhash.to_string()));
    }

    // Second pass: stream the contents into the container, zero-padding the
    // final chunk.
    if let Err(err) = copy_into_container(cancel, volume, &mut file, fsize, cchk) {
        rollback(volume);
        return Err(err);
    }

    // Seat the entry. The record coordinates were fixed at mount time.
    let (_slot, loc) = match volume.btable.add(fhash) {
        Ok(placed) => placed,
        Err(err) => {
            rollback(volume);
            return Err(err);
        }
    };

    let entry = HashEntry {
        hash: fhash,
        chunk: cchk,
        offset: 0,
        len: fsize,
        ts_creation: now_seconds(),
        flags: 0,
        mime: mime.unwrap_or_default().to_string(),
        name: name.map_or_else(|| basename(path), str::to_string),
        encoding: String::new(),
    };
    // The metadata commit is pure in-memory work; it must not be interrupted
    // between the bucket insert and the record write.
    let no_cancel = CancelFlag::new();
    volume.write_entry(&no_cancel, loc, &entry)?;
    Ok(())
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn copy_into_container(
    cancel: &CancelFlag,
    volume: &mut Volume,
    file: &mut File,
    fsize: u64,
    cchk: u64,
) -> Result<()> {
    let chunksize = volume.meta.chunksize as usize;
    file.seek(SeekFrom::Start(0))?;
    let mut buf = AlignedBuf::for_chunk(chunksize);
    let mut left = fsize;
    let mut c = 0_u64;
    while left > 0 {
        checkpoint(cancel)?;
        let rlen = usize::try_from(left.min(chunksize as u64)).expect("chunk fits usize");
        if rlen < chunksize {
            buf.as_mut_slice().fill(0);
        }
        file.read_exact(&mut buf.as_mut_slice()[..rlen])?;
        volume
            .striped
            .write_chunks(cancel, ChunkNo(cchk + c), 1, buf.as_slice())?;
        left -= rlen as u64;
        c += 1;
    }
    Ok(())
}

fn rm_obj(cancel: &CancelFlag, volume: &mut Volume, hash_hex: &str) -> Result<()> {
    let hash = parse_hash_arg(volume, hash_hex)?;
    let (slot, loc) = volume
        .btable
        .lookup(&hash)
        .ok_or_else(|| ShfsError::NotFound(hash_hex.to_string()))?;
    let entry = volume.read_entry(cancel, loc)?;

    debug!(target: "shfs::action", chunk = entry.chunk, "releasing container");
    volume
        .alloc
        .unregister(entry.chunk, entry.chunk_span(volume.meta.chunksize))?;

    // Vacate the slot: only the hash field is cleared; the rest of the
    // record stays as stale bytes.
    let record = volume
        .cache
        .entry_bytes_mut(cancel, &volume.striped, loc)?;
    HashEntry::clear_hash_in(record)?;
    volume.cache.mark_dirty(loc.htchunk)?;
    volume.btable.remove(&hash)?;
    if volume.def_slot == Some(slot) {
        volume.def_slot = None;
    }
    Ok(())
}

fn cat_obj(
    cancel: &CancelFlag,
    volume: &mut Volume,
    hash_hex: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let chunksize = volume.meta.chunksize;
    let hash = parse_hash_arg(volume, hash_hex)?;
    let (_, loc) = volume
        .btable
        .lookup(&hash)
        .ok_or_else(|| ShfsError::NotFound(hash_hex.to_string()))?;
    let entry = volume.read_entry(cancel, loc)?;
    if entry.offset >= u64::from(chunksize) {
        return Err(ShfsError::Corruption {
            chunk: entry.chunk,
            detail: "entry offset exceeds the chunk size".to_string(),
        });
    }

    let mut buf = AlignedBuf::for_chunk(chunksize as usize);
    let mut c = entry.chunk;
    let mut off = usize::try_from(entry.offset).expect("offset fits usize");
    let mut left = entry.len;
    while left > 0 {
        volume
            .striped
            .read_chunks(cancel, ChunkNo(c), 1, buf.as_mut_slice())?;
        let rlen = usize::try_from((u64::from(chunksize) - off as u64).min(left))
            .expect("chunk fits usize");
        out.write_all(&buf.as_slice()[off..off + rlen])?;
        left -= rlen as u64;
        c += 1;
        off = 0;
    }
    out.flush()?;
    Ok(())
}

fn set_entry_flags(
    cancel: &CancelFlag,
    volume: &mut Volume,
    loc: BucketEntry,
    flags: u8,
) -> Result<()> {
    let record = volume
        .cache
        .entry_bytes_mut(cancel, &volume.striped, loc)?;
    HashEntry::set_flags_in(record, flags)?;
    volume.cache.mark_dirty(loc.htchunk)
}

fn clear_default(cancel: &CancelFlag, volume: &mut Volume) -> Result<()> {
    let Some(slot) = volume.def_slot else {
        return Ok(());
    };
    let loc = volume.cache.location_of(slot);
    let entry = volume.read_entry(cancel, loc)?;
    set_entry_flags(cancel, volume, loc, entry.flags & !HENTRY_FLAG_DEFAULT)?;
    volume.def_slot = None;
    Ok(())
}

fn set_default(cancel: &CancelFlag, volume: &mut Volume, hash_hex: &str) -> Result<()> {
    let hash = parse_hash_arg(volume, hash_hex)?;
    let (slot, loc) = volume
        .btable
        .lookup(&hash)
        .ok_or_else(|| ShfsError::NotFound(hash_hex.to_string()))?;

    clear_default(cancel, volume)?;
    let entry = volume.read_entry(cancel, loc)?;
    set_entry_flags(cancel, volume, loc, entry.flags | HENTRY_FLAG_DEFAULT)?;
    volume.def_slot = Some(slot);
    Ok(())
}

fn format_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%b %e, %g %H:%M")
                .to_string()
        })
        .unwrap_or_default()
}

fn flag_glyphs(flags: u8) -> String {
    format!(
        "{}--{}",
        if flags & HENTRY_FLAG_DEFAULT != 0 { 'D' } else { '-' },
        if flags & HENTRY_FLAG_HIDDEN != 0 { 'H' } else { '-' },
    )
}

fn ls(cancel: &CancelFlag, volume: &mut Volume, out: &mut dyn Write) -> Result<()> {
    let chunksize = volume.meta.chunksize;
    let hash_width = if volume.meta.hlen.get() <= 32 { 64 } else { 128 };

    writeln!(
        out,
        "{:<hash_width$} {:>12} {:>12} {:>5} {:<24} {:<16} {}",
        "Hash", "At (chk)", "Size (chk)", "Flags", "MIME", "Added", "Name",
    )?;
    let rows: Vec<EntrySummary> = volume
        .entries(cancel)?
        .iter()
        .map(|entry| EntrySummary::of(entry, chunksize))
        .collect();
    for row in rows {
        writeln!(
            out,
            "{:<hash_width$} {:>12} {:>12}  {} {:<24} {:<16} {}",
            row.hash,
            row.chunk,
            row.chunk_span,
            flag_glyphs(row.flags),
            row.mime,
            format_timestamp(row.ts_creation),
            row.name,
        )?;
    }
    Ok(())
}

/// Re-read chunks 0 and 1 and print the volume summary.
fn info(cancel: &CancelFlag, volume: &mut Volume, out: &mut dyn Write) -> Result<()> {
    let chk0 = read_chunk0(cancel, volume.striped.member(0))?;
    let common = CommonHeader::parse_chunk0(chk0.as_slice())?;

    let mut chk1 = AlignedBuf::for_chunk(volume.meta.chunksize as usize);
    volume
        .striped
        .read_chunks(cancel, ChunkNo(1), 1, chk1.as_mut_slice())?;
    let config = ConfigHeader::parse(chk1.as_slice())?;

    print_hdr_summary(out, &common, &config)?;
    Ok(())
}

fn print_hdr_summary(
    out: &mut dyn Write,
    common: &CommonHeader,
    config: &ConfigHeader,
) -> Result<()> {
    let chunksize = common.chunksize();
    let htable_len = config.htable_len(chunksize);
    let replicas = if config.htable_bak_ref != 0 { 2 } else { 1 };
    let metadata_chunks = 2 + htable_len * replicas;
    let avail_chunks = (common.vol_size + 1).saturating_sub(metadata_chunks);

    writeln!(out, "SHFSv1 volume '{}'", common.vol_name)?;
    writeln!(out, "  UUID:             {}", Uuid::from_bytes(common.vol_uuid))?;
    writeln!(
        out,
        "  Created:          {}",
        format_timestamp(common.vol_ts_creation)
    )?;
    writeln!(
        out,
        "  Volume size:      {} chunks ({} bytes)",
        common.vol_size + 1,
        (common.vol_size + 1) * u64::from(chunksize)
    )?;
    writeln!(out, "  Chunk size:       {chunksize} bytes")?;
    writeln!(
        out,
        "  Striping:         {} ({} bytes per stripe)",
        common.stripemode, common.stripesize
    )?;
    writeln!(out, "  Members:          {}", common.members.len())?;
    for (i, member) in common.members.iter().enumerate() {
        writeln!(out, "    member {i}:       {}", Uuid::from_bytes(*member))?;
    }
    writeln!(
        out,
        "  Hash table:       {} buckets x {} entries, {} chunks at {}",
        config.htable_bucket_count,
        config.htable_entries_per_bucket,
        htable_len,
        config.htable_ref
    )?;
    if config.htable_bak_ref != 0 {
        writeln!(out, "  Backup table:     {} chunks at {}", htable_len, config.htable_bak_ref)?;
    }
    writeln!(out, "  Hash length:      {} bytes", config.hlen)?;
    writeln!(out, "  Allocator:        first-fit")?;
    writeln!(out, "  Metadata size:    {metadata_chunks} chunks")?;
    writeln!(out, "  Available space:  {avail_chunks} chunks")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_glyph_layout() {
        assert_eq!(flag_glyphs(0), "----");
        assert_eq!(flag_glyphs(HENTRY_FLAG_DEFAULT), "D---");
        assert_eq!(flag_glyphs(HENTRY_FLAG_HIDDEN), "---H");
        assert_eq!(flag_glyphs(HENTRY_FLAG_DEFAULT | HENTRY_FLAG_HIDDEN), "D--H");
    }

    #[test]
    fn timestamp_formatting_is_stable_shape() {
        // Exact text depends on the local zone; the shape does not.
        let text = format_timestamp(1_700_000_000);
        assert!(!text.is_empty());
        assert!(text.contains(','));
        assert!(text.contains(':'));
    }

    #[test]
    fn action_display_names() {
        let add = Action::AddObj {
            path: PathBuf::from("a.bin"),
            mime: None,
            name: None,
        };
        assert_eq!(add.to_string(), "add-obj a.bin");
        assert_eq!(Action::ClearDefault.to_string(), "clear-default");
        assert_eq!(
            Action::RmObj {
                hash: "ab".to_string()
            }
            .to_string(),
            "rm-obj ab"
        );
    }
}
