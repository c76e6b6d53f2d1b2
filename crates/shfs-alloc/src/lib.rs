#![forbid(unsafe_code)]
//! Free-chunk accounting for the data region of a volume.
//!
//! The allocator tracks which chunk ranges of the logical chunk space
//! `[0, volsize]` are reserved. The config header selects the kind; first-fit
//! over an ordered free-interval list is the only kind defined. Callers
//! register ranges at mount (label, hash table, every stored object) and as
//! objects are added; removal unregisters and coalesces.

use shfs_error::{Result, ShfsError};
use std::fmt;

/// Allocation strategy selected by the volume configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    FirstFit,
}

/// Chunk-range reservation tracking.
pub trait ChunkAllocator: fmt::Debug {
    /// Reserve `[start, start + count)`.
    ///
    /// Fails with `AllocOverlap` if any part is already reserved, or
    /// `AllocOutOfRange` if the range leaves the chunk space.
    fn register(&mut self, start: u64, count: u64) -> Result<()>;

    /// Return `[start, start + count)` to the free set, coalescing with
    /// adjacent free ranges. Fails with `AllocNotReserved` if any part of the
    /// range is not currently reserved.
    fn unregister(&mut self, start: u64, count: u64) -> Result<()>;

    /// Lowest `start` such that `[start, start + count)` is entirely free,
    /// or `None` if no free range is long enough.
    fn find_free(&self, count: u64) -> Option<u64>;

    /// Total free chunks.
    fn free_chunks(&self) -> u64;

    /// Free ranges as `(start, count)` pairs in ascending order.
    fn free_ranges(&self) -> Vec<(u64, u64)>;
}

/// Build the allocator for a volume of `volsize` chunks (chunk space
/// `[0, volsize]`, i.e. `volsize + 1` addressable chunks).
#[must_use]
pub fn allocator_for(kind: AllocKind, volsize: u64) -> Box<dyn ChunkAllocator> {
    match kind {
        AllocKind::FirstFit => Box::new(FirstFitAllocator::new(volsize)),
    }
}

/// Half-open free interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    start: u64,
    end: u64,
}

impl FreeRange {
    fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// First-fit allocator over an ordered, non-overlapping, non-adjacent list
/// of free intervals.
#[derive(Debug)]
pub struct FirstFitAllocator {
    /// One past the last addressable chunk.
    limit: u64,
    free: Vec<FreeRange>,
}

impl FirstFitAllocator {
    #[must_use]
    pub fn new(volsize: u64) -> Self {
        let limit = volsize.saturating_add(1);
        Self {
            limit,
            free: vec![FreeRange {
                start: 0,
                end: limit,
            }],
        }
    }

    fn range_end(&self, start: u64, count: u64) -> Result<u64> {
        let end = start
            .checked_add(count)
            .ok_or(ShfsError::AllocOutOfRange { start, count })?;
        if end > self.limit {
            return Err(ShfsError::AllocOutOfRange { start, count });
        }
        Ok(end)
    }
}

impl ChunkAllocator for FirstFitAllocator {
    fn register(&mut self, start: u64, count: u64) -> Result<()> {
        let end = self.range_end(start, count)?;
        if count == 0 {
            return Ok(());
        }

        // The whole range must sit inside one free interval; otherwise some
        // part of it is reserved.
        let pos = self
            .free
            .iter()
            .position(|r| r.start <= start && end <= r.end)
            .ok_or(ShfsError::AllocOverlap { start, count })?;

        let range = self.free[pos];
        let left = FreeRange {
            start: range.start,
            end: start,
        };
        let right = FreeRange { start: end, end: range.end };
        match (left.len() > 0, right.len() > 0) {
            (true, true) => {
                self.free[pos] = left;
                self.free.insert(pos + 1, right);
            }
            (true, false) => self.free[pos] = left,
            (false, true) => self.free[pos] = right,
            (false, false) => {
                self.free.remove(pos);
            }
        }
        Ok(())
    }

    fn unregister(&mut self, start: u64, count: u64) -> Result<()> {
        let end = self.range_end(start, count)?;
        if count == 0 {
            return Ok(());
        }

        // The range must not intersect any free interval.
        if self
            .free
            .iter()
            .any(|r| r.start < end && start < r.end)
        {
            return Err(ShfsError::AllocNotReserved { start, count });
        }

        let pos = self.free.partition_point(|r| r.end <= start);
        self.free.insert(pos, FreeRange { start, end });

        // Coalesce with the neighbors that now touch the inserted range.
        if pos + 1 < self.free.len() && self.free[pos].end == self.free[pos + 1].start {
            self.free[pos].end = self.free[pos + 1].end;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].end == self.free[pos].start {
            self.free[pos - 1].end = self.free[pos].end;
            self.free.remove(pos);
        }
        Ok(())
    }

    fn find_free(&self, count: u64) -> Option<u64> {
        if count == 0 {
            return self.free.first().map(|r| r.start);
        }
        self.free.iter().find(|r| r.len() >= count).map(|r| r.start)
    }

    fn free_chunks(&self) -> u64 {
        self.free.iter().map(FreeRange::len).sum()
    }

    fn free_ranges(&self) -> Vec<(u64, u64)> {
        self.free.iter().map(|r| (r.start, r.len())).collect()
    }
}
