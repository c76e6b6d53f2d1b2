#![forbid(unsafe_code)]
//! In-memory bucket index over the on-disk hash table.
//!
//! The on-disk table is the bucket grid: entry `i` belongs to bucket
//! `i / entries_per_bucket`, slot `i % entries_per_bucket`. Mount seats every
//! slot sequentially (`feed`); afterwards the table resolves content hashes to
//! the coordinates of their on-disk records. The grid is sized by mkfs and
//! never resized: `add` fails rather than evicts.

use shfs_error::{Result, ShfsError};
use shfs_types::{HashLen, ObjectHash};

/// Coordinates of an entry's on-disk record inside the hash-table region.
///
/// The chunk cache owns the buffers; the bucket table holds coordinates only
/// and resolves through the cache on each access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    /// Hash-table chunk index, relative to `htable_ref`.
    pub htchunk: u64,
    /// Byte offset of the record within that chunk.
    pub htoffset: usize,
}

#[derive(Debug, Clone)]
struct Slot {
    hash: ObjectHash,
    entry: BucketEntry,
}

/// Fixed-shape open-addressing index from content hash to bucket entry.
#[derive(Debug)]
pub struct BucketTable {
    nb_buckets: u32,
    entries_per_bucket: u32,
    hlen: HashLen,
    slots: Vec<Slot>,
}

impl BucketTable {
    #[must_use]
    pub fn new(nb_buckets: u32, entries_per_bucket: u32, hlen: HashLen) -> Self {
        let nb_slots = nb_buckets as usize * entries_per_bucket as usize;
        Self {
            nb_buckets,
            entries_per_bucket,
            hlen,
            slots: vec![
                Slot {
                    hash: ObjectHash::zeroed(hlen),
                    entry: BucketEntry {
                        htchunk: 0,
                        htoffset: 0,
                    },
                };
                nb_slots
            ],
        }
    }

    #[must_use]
    pub fn nb_slots(&self) -> u64 {
        self.slots.len() as u64
    }

    #[must_use]
    pub fn occupied_count(&self) -> u64 {
        self.slots.iter().filter(|s| !s.hash.is_zero()).count() as u64
    }

    /// Bucket selection: the first four hash bytes as an unsigned
    /// little-endian integer, reduced modulo the bucket count. The canonical
    /// hash is already pseudo-random, so no further mixing is needed.
    fn bucket_of(&self, hash: &ObjectHash) -> u32 {
        hash.bucket_seed() % self.nb_buckets
    }

    fn bucket_slots(&self, bucket: u32) -> std::ops::Range<usize> {
        let start = bucket as usize * self.entries_per_bucket as usize;
        start..start + self.entries_per_bucket as usize
    }

    /// Seat slot `index` during the mount-time sequential scan. An all-zero
    /// hash leaves the slot vacant; the record coordinates are kept either
    /// way so a later `add` can reuse them.
    pub fn feed(&mut self, index: u64, hash: ObjectHash, entry: BucketEntry) -> Result<()> {
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .ok_or_else(|| ShfsError::Format(format!(
                "hash table entry index {index} out of range"
            )))?;
        slot.hash = hash;
        slot.entry = entry;
        Ok(())
    }

    /// Find the slot holding `hash`.
    ///
    /// Vacant slots do not terminate the probe: removal leaves holes, so the
    /// whole bucket is always scanned.
    #[must_use]
    pub fn lookup(&self, hash: &ObjectHash) -> Option<(u64, BucketEntry)> {
        if hash.is_zero() {
            return None;
        }
        let range = self.bucket_slots(self.bucket_of(hash));
        for i in range {
            let slot = &self.slots[i];
            if !slot.hash.is_zero() && slot.hash == *hash {
                return Some((i as u64, slot.entry));
            }
        }
        None
    }

    /// Place `hash` into the first vacant slot of its bucket.
    ///
    /// Fails with `BucketFull` if every slot is occupied; the table never
    /// evicts.
    pub fn add(&mut self, hash: ObjectHash) -> Result<(u64, BucketEntry)> {
        let range = self.bucket_slots(self.bucket_of(&hash));
        for i in range {
            if self.slots[i].hash.is_zero() {
                self.slots[i].hash = hash;
                return Ok((i as u64, self.slots[i].entry));
            }
        }
        Err(ShfsError::BucketFull)
    }

    /// Vacate the slot holding `hash`, returning its record coordinates.
    pub fn remove(&mut self, hash: &ObjectHash) -> Result<(u64, BucketEntry)> {
        let (index, entry) = self
            .lookup(hash)
            .ok_or_else(|| ShfsError::NotFound(hash.to_string()))?;
        self.slots[index as usize].hash = ObjectHash::zeroed(self.hlen);
        Ok((index, entry))
    }

    /// Every occupied slot, in slot order (stable across calls).
    pub fn iter_occupied(&self) -> impl Iterator<Item = (u64, &ObjectHash, BucketEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.hash.is_zero())
            .map(|(i, slot)| (i as u64, &slot.hash, slot.entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hlen4() -> HashLen {
        HashLen::new(4).expect("valid hash length")
    }

    /// Hash whose bucket (mod 8) is `bucket`, distinguished by `tag`.
    fn hash_in_bucket(bucket: u8, tag: u8) -> ObjectHash {
        ObjectHash::from_raw(&[bucket, 0, 0, tag.wrapping_add(1)], hlen4()).expect("hash")
    }

    fn entry(htchunk: u64, htoffset: usize) -> BucketEntry {
        BucketEntry { htchunk, htoffset }
    }

    fn table() -> BucketTable {
        // 8 buckets x 4 entries; seed every slot with its coordinates the way
        // the mount scan does.
        let mut bt = BucketTable::new(8, 4, hlen4());
        for i in 0..32_u64 {
            bt.feed(i, ObjectHash::zeroed(hlen4()), entry(i / 16, (i % 16) as usize * 256))
                .expect("feed");
        }
        bt
    }

    #[test]
    fn feed_and_lookup_occupied_slot() {
        let mut bt = table();
        let h = hash_in_bucket(2, 0);
        bt.feed(9, h, entry(0, 9 * 256)).expect("feed");
        let (index, found) = bt.lookup(&h).expect("lookup");
        assert_eq!(index, 9);
        assert_eq!(found, entry(0, 9 * 256));
        assert_eq!(bt.occupied_count(), 1);
    }

    #[test]
    fn lookup_zero_hash_finds_nothing() {
        let bt = table();
        assert!(bt.lookup(&ObjectHash::zeroed(hlen4())).is_none());
    }

    #[test]
    fn add_places_into_first_vacant_slot_of_bucket() {
        let mut bt = table();
        let h = hash_in_bucket(3, 0);
        let (index, e) = bt.add(h).expect("add");
        // Bucket 3 starts at slot 12.
        assert_eq!(index, 12);
        assert_eq!(e, entry(0, 12 * 256));
        assert_eq!(bt.lookup(&h), Some((12, e)));
    }

    #[test]
    fn add_skips_occupied_slots_and_fills_holes() {
        let mut bt = table();
        let first = hash_in_bucket(1, 0);
        let second = hash_in_bucket(1, 1);
        let third = hash_in_bucket(1, 2);
        assert_eq!(bt.add(first).expect("add").0, 4);
        assert_eq!(bt.add(second).expect("add").0, 5);
        bt.remove(&first).expect("remove");
        // The hole at slot 4 is reused before slot 6.
        assert_eq!(bt.add(third).expect("add").0, 4);
        // The survivor past the hole is still reachable.
        assert!(bt.lookup(&second).is_some());
    }

    #[test]
    fn add_full_bucket_fails_without_evicting() {
        let mut bt = table();
        for tag in 0..4 {
            bt.add(hash_in_bucket(5, tag)).expect("add");
        }
        let overflow = hash_in_bucket(5, 4);
        assert!(matches!(bt.add(overflow), Err(ShfsError::BucketFull)));
        for tag in 0..4 {
            assert!(bt.lookup(&hash_in_bucket(5, tag)).is_some());
        }
        // A different bucket still accepts entries.
        bt.add(hash_in_bucket(6, 0)).expect("add");
    }

    #[test]
    fn remove_vacates_and_reports_missing() {
        let mut bt = table();
        let h = hash_in_bucket(0, 0);
        bt.add(h).expect("add");
        let (index, _) = bt.remove(&h).expect("remove");
        assert_eq!(index, 0);
        assert!(bt.lookup(&h).is_none());
        assert!(matches!(bt.remove(&h), Err(ShfsError::NotFound(_))));
    }

    #[test]
    fn iterate_yields_occupied_in_slot_order() {
        let mut bt = table();
        let a = hash_in_bucket(7, 0);
        let b = hash_in_bucket(0, 1);
        let c = hash_in_bucket(3, 2);
        bt.add(a).expect("add");
        bt.add(b).expect("add");
        bt.add(c).expect("add");
        let order: Vec<u64> = bt.iter_occupied().map(|(i, _, _)| i).collect();
        assert_eq!(order, vec![0, 12, 28]);
        let again: Vec<u64> = bt.iter_occupied().map(|(i, _, _)| i).collect();
        assert_eq!(order, again);
    }

    #[test]
    fn feed_rejects_out_of_range_index() {
        let mut bt = table();
        assert!(bt.feed(32, hash_in_bucket(0, 0), entry(0, 0)).is_err());
    }
}
