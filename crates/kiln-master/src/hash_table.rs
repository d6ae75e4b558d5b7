//! The object index: a cache-line packed hash table from
//! `(table_id, object_id)` to 47-bit log addresses.
//!
//! Each bucket is one 64-byte cache line of eight 8-byte entries. An entry
//! packs a chain flag (bit 63), a 16-bit secondary hash (bits 62..47), and
//! a 47-bit pointer (bits 46..0). The pointer is a packed log address,
//! except in the last slot of a full line where it may instead link to an
//! overflow cache line (stored as overflow index + 1, so no valid value is
//! ever zero; log addresses are non-zero by construction because entries
//! always sit after a segment header). A zero word means the slot is free.
//!
//! The secondary hash rejects roughly 65535/65536 of false bucket
//! collisions without leaving the cache line; a candidate only costs a log
//! fetch when the 16 bits match, and the fetched key is then compared
//! exactly through the [`AddressResolver`] seam.

use std::time::Instant;

pub const ENTRIES_PER_CACHE_LINE: usize = 8;
const LAST_SLOT: usize = ENTRIES_PER_CACHE_LINE - 1;

const CHAIN_BIT: u64 = 1 << 63;
const POINTER_MASK: u64 = (1 << 47) - 1;
const SECONDARY_HASH_SHIFT: u32 = 47;

/// Resolves a packed pointer to the key of the log entry it names. The log
/// implements this; tests substitute a map.
pub trait AddressResolver {
    fn key_at(&self, address: u64) -> Option<(u32, u64)>;
}

/// One packed index entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Entry {
    value: u64,
}

/// An [`Entry`] split into its fields, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackedEntry {
    pub hash: u16,
    pub chain: bool,
    pub pointer: u64,
}

impl Entry {
    pub fn from_raw(value: u64) -> Self {
        Entry { value }
    }

    pub fn raw(self) -> u64 {
        self.value
    }

    fn pack(hash: u16, chain: bool, pointer: u64) -> Self {
        debug_assert_eq!(pointer & !POINTER_MASK, 0, "pointer exceeds 47 bits");
        let mut value = pointer & POINTER_MASK;
        value |= (hash as u64) << SECONDARY_HASH_SHIFT;
        if chain {
            value |= CHAIN_BIT;
        }
        Entry { value }
    }

    pub fn unpack(self) -> UnpackedEntry {
        UnpackedEntry {
            hash: ((self.value >> SECONDARY_HASH_SHIFT) & 0xffff) as u16,
            chain: self.value & CHAIN_BIT != 0,
            pointer: self.value & POINTER_MASK,
        }
    }

    pub fn clear(&mut self) {
        self.value = 0;
    }

    /// Free for use: the whole word is zero.
    pub fn is_available(self) -> bool {
        self.value == 0
    }

    pub fn is_chain_link(self) -> bool {
        self.value & CHAIN_BIT != 0
    }

    pub fn set_log_pointer(&mut self, hash: u16, address: u64) {
        *self = Entry::pack(hash, false, address);
    }

    /// Chain links carry no secondary hash; those bits stay zero.
    pub fn set_chain_link(&mut self, overflow_index: usize) {
        *self = Entry::pack(0, true, overflow_index as u64 + 1);
    }

    pub fn log_pointer(self) -> Option<u64> {
        if self.is_available() || self.is_chain_link() {
            None
        } else {
            Some(self.value & POINTER_MASK)
        }
    }

    pub fn overflow_index(self) -> Option<usize> {
        if self.is_chain_link() {
            Some(((self.value & POINTER_MASK) - 1) as usize)
        } else {
            None
        }
    }

    /// True iff this entry holds a log pointer whose secondary hash equals
    /// `hash`. Never true for free slots or chain links.
    pub fn hash_matches(self, hash: u16) -> bool {
        if self.is_available() || self.is_chain_link() {
            return false;
        }
        (self.value >> SECONDARY_HASH_SHIFT) as u16 == hash
    }
}

/// Eight entries; the first seven always hold records, the eighth may
/// instead chain to an overflow line.
#[derive(Debug, Clone, Copy, Default)]
#[repr(align(64))]
pub struct CacheLine {
    pub entries: [Entry; ENTRIES_PER_CACHE_LINE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRef {
    Bucket(usize),
    Overflow(usize),
}

/// Histogram of lookup times: fixed-width bins plus an overflow counter.
/// Diagnostic only.
#[derive(Debug, Clone)]
pub struct PerfDistribution {
    pub min: u64,
    pub max: u64,
    pub bin_overflows: u64,
    bins: Box<[u64]>,
}

impl PerfDistribution {
    pub const NBINS: usize = 5000;
    pub const BIN_WIDTH: u64 = 10;

    fn new() -> Self {
        PerfDistribution {
            min: u64::MAX,
            max: 0,
            bin_overflows: 0,
            bins: vec![0; Self::NBINS].into_boxed_slice(),
        }
    }

    pub fn store_sample(&mut self, sample: u64) {
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        let bin = (sample / Self::BIN_WIDTH) as usize;
        if bin < Self::NBINS {
            self.bins[bin] += 1;
        } else {
            self.bin_overflows += 1;
        }
    }

    pub fn bin(&self, index: usize) -> u64 {
        self.bins[index]
    }

    pub fn samples(&self) -> u64 {
        self.bins.iter().sum::<u64>() + self.bin_overflows
    }
}

/// The index proper. All mutation happens under the owner's state lock, so
/// methods take `&mut self` and need no internal synchronization.
pub struct HashTable {
    bucket_bits: u32,
    buckets: Box<[CacheLine]>,
    overflow: Vec<CacheLine>,
    lookup_distribution: PerfDistribution,
}

impl HashTable {
    /// `num_buckets` must be a power of two.
    pub fn new(num_buckets: u64) -> Self {
        assert!(num_buckets.is_power_of_two(), "bucket count must be a power of two");
        HashTable {
            bucket_bits: num_buckets.trailing_zeros(),
            buckets: vec![CacheLine::default(); num_buckets as usize].into_boxed_slice(),
            overflow: Vec::new(),
            lookup_distribution: PerfDistribution::new(),
        }
    }

    pub fn lookup_distribution(&self) -> &PerfDistribution {
        &self.lookup_distribution
    }

    /// The current log address for a key, if any.
    pub fn lookup(
        &mut self,
        table_id: u32,
        id: u64,
        resolver: &impl AddressResolver,
    ) -> Option<u64> {
        let started = Instant::now();
        let found = self
            .find_slot(table_id, id, resolver)
            .map(|(line, slot)| self.line(line).entries[slot].raw() & POINTER_MASK);
        self.lookup_distribution
            .store_sample(started.elapsed().as_nanos() as u64);
        found
    }

    /// Installs `address` for the key it resolves to, displacing any prior
    /// entry for that key. Returns true iff a prior entry existed.
    pub fn replace(&mut self, address: u64, resolver: &impl AddressResolver) -> bool {
        let Some((table_id, id)) = resolver.key_at(address) else {
            debug_assert!(false, "replace() with an unresolvable address");
            return false;
        };
        let (bucket, secondary) = self.index_for(table_id, id);

        if let Some((line, slot)) = self.find_slot(table_id, id, resolver) {
            self.line_mut(line).entries[slot].set_log_pointer(secondary, address);
            return true;
        }

        let mut line_ref = LineRef::Bucket(bucket);
        loop {
            let line = *self.line(line_ref);
            if let Some(slot) = line.entries.iter().position(|entry| entry.is_available()) {
                self.line_mut(line_ref).entries[slot].set_log_pointer(secondary, address);
                return false;
            }
            if let Some(next) = line.entries[LAST_SLOT].overflow_index() {
                line_ref = LineRef::Overflow(next);
                continue;
            }
            // Line is full of records: displace the last one into a fresh
            // overflow line and chain to it.
            let displaced = line.entries[LAST_SLOT];
            let new_index = self.overflow.len();
            self.overflow.push(CacheLine::default());
            self.overflow[new_index].entries[0] = displaced;
            self.line_mut(line_ref).entries[LAST_SLOT].set_chain_link(new_index);
            line_ref = LineRef::Overflow(new_index);
        }
    }

    /// Clears the key's entry. Chains are not compacted. Returns true iff
    /// an entry existed.
    pub fn remove(&mut self, table_id: u32, id: u64, resolver: &impl AddressResolver) -> bool {
        match self.find_slot(table_id, id, resolver) {
            Some((line, slot)) => {
                self.line_mut(line).entries[slot].clear();
                true
            }
            None => false,
        }
    }

    /// Visits the packed pointer of every occupied entry, in no particular
    /// order.
    pub fn for_each(&self, mut visitor: impl FnMut(u64)) {
        for line in self.buckets.iter().chain(self.overflow.iter()) {
            for entry in &line.entries {
                if let Some(pointer) = entry.log_pointer() {
                    visitor(pointer);
                }
            }
        }
    }

    fn index_for(&self, table_id: u32, id: u64) -> (usize, u16) {
        let hash = key_hash(table_id, id);
        let bucket = (hash & ((1u64 << self.bucket_bits) - 1)) as usize;
        let secondary = (hash >> self.bucket_bits) as u16;
        (bucket, secondary)
    }

    fn find_slot(
        &self,
        table_id: u32,
        id: u64,
        resolver: &impl AddressResolver,
    ) -> Option<(LineRef, usize)> {
        let (bucket, secondary) = self.index_for(table_id, id);
        let mut line_ref = LineRef::Bucket(bucket);
        'chain: loop {
            let line = self.line(line_ref);
            for slot in 0..ENTRIES_PER_CACHE_LINE {
                let entry = line.entries[slot];
                if let Some(next) = entry.overflow_index() {
                    debug_assert_eq!(slot, LAST_SLOT);
                    line_ref = LineRef::Overflow(next);
                    continue 'chain;
                }
                if entry.hash_matches(secondary) {
                    let address = entry.raw() & POINTER_MASK;
                    if resolver.key_at(address) == Some((table_id, id)) {
                        return Some((line_ref, slot));
                    }
                }
            }
            return None;
        }
    }

    fn line(&self, line_ref: LineRef) -> &CacheLine {
        match line_ref {
            LineRef::Bucket(index) => &self.buckets[index],
            LineRef::Overflow(index) => &self.overflow[index],
        }
    }

    fn line_mut(&mut self, line_ref: LineRef) -> &mut CacheLine {
        match line_ref {
            LineRef::Bucket(index) => &mut self.buckets[index],
            LineRef::Overflow(index) => &mut self.overflow[index],
        }
    }
}

/// 64-bit avalanche over the two key words (splitmix-style finalizer).
fn key_hash(table_id: u32, id: u64) -> u64 {
    let mut x = (table_id as u64)
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(id);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Resolver backed by a plain map from address to key.
    #[derive(Default)]
    struct MapResolver {
        keys: HashMap<u64, (u32, u64)>,
    }

    impl MapResolver {
        fn insert(&mut self, address: u64, table_id: u32, id: u64) {
            self.keys.insert(address, (table_id, id));
        }
    }

    impl AddressResolver for MapResolver {
        fn key_at(&self, address: u64) -> Option<(u32, u64)> {
            self.keys.get(&address).copied()
        }
    }

    #[test]
    fn entry_and_line_sizes() {
        // The whole point is to fit eight entries in one cache line.
        assert_eq!(std::mem::size_of::<Entry>(), 8);
        assert_eq!(std::mem::size_of::<CacheLine>(), 64);
        assert_eq!(std::mem::align_of::<CacheLine>(), 64);
    }

    fn packable(hash: u16, chain: bool, pointer: u64) -> bool {
        let entry = Entry::pack(hash, chain, pointer);
        let out = entry.unpack();
        out.hash == hash && out.chain == chain && out.pointer == pointer
    }

    #[test]
    fn entry_pack_unpack() {
        assert!(packable(0x0000, false, 0x0000_0000_0000));
        assert!(packable(0xffff, true, 0x7fff_ffff_ffff));
        assert!(packable(0xffff, false, 0x7fff_ffff_ffff));
        assert!(packable(0xa257, false, 0x3cde_adbe_ef98));
    }

    #[test]
    fn entry_clear_and_availability() {
        let mut entry = Entry::from_raw(0xdead_beef_dead_beef);
        entry.clear();
        assert_eq!(
            entry.unpack(),
            UnpackedEntry {
                hash: 0,
                chain: false,
                pointer: 0
            }
        );
        assert!(entry.is_available());

        entry.set_chain_link(0);
        assert!(!entry.is_available());
        entry.set_log_pointer(0, 0x1);
        assert!(!entry.is_available());
        entry.clear();
        assert!(entry.is_available());
    }

    #[test]
    fn entry_log_pointer() {
        let mut entry = Entry::from_raw(0xdead_beef_dead_beef);
        entry.set_log_pointer(0xaaaa, 0x7fff_ffff_ffff);
        let out = entry.unpack();
        assert_eq!(out.hash, 0xaaaa);
        assert!(!out.chain);
        assert_eq!(out.pointer, 0x7fff_ffff_ffff);
        assert_eq!(entry.log_pointer(), Some(0x7fff_ffff_ffff));
    }

    #[test]
    fn entry_chain_link() {
        let mut entry = Entry::from_raw(0xdead_beef_dead_beef);
        entry.set_chain_link(41);
        let out = entry.unpack();
        assert_eq!(out.hash, 0);
        assert!(out.chain);
        assert_eq!(out.pointer, 42);
        assert_eq!(entry.overflow_index(), Some(41));
        assert_eq!(entry.log_pointer(), None);
        assert!(entry.is_chain_link());
        entry.set_log_pointer(0, 0x1);
        assert!(!entry.is_chain_link());
    }

    #[test]
    fn entry_hash_matches() {
        let mut entry = Entry::default();
        assert!(!entry.hash_matches(0));
        entry.set_chain_link(0);
        assert!(!entry.hash_matches(0));
        entry.set_log_pointer(0, 0x1);
        assert!(entry.hash_matches(0));
        assert!(!entry.hash_matches(0xbeef));
        entry.set_log_pointer(0xbeef, 0x1);
        assert!(!entry.hash_matches(0));
        assert!(entry.hash_matches(0xbeef));
        assert!(!entry.hash_matches(0xfeed));
    }

    #[test]
    fn lookup_insert_remove() {
        let mut resolver = MapResolver::default();
        resolver.insert(0x100, 0, 0);
        resolver.insert(0x200, 0, 10);

        let mut table = HashTable::new(1024);
        assert_eq!(table.lookup(0, 0, &resolver), None);
        assert!(!table.replace(0x100, &resolver));
        assert_eq!(table.lookup(0, 0, &resolver), Some(0x100));
        assert_eq!(table.lookup(0, 10, &resolver), None);
        assert!(!table.replace(0x200, &resolver));
        assert_eq!(table.lookup(0, 10, &resolver), Some(0x200));
        assert_eq!(table.lookup(0, 0, &resolver), Some(0x100));

        assert!(table.remove(0, 0, &resolver));
        assert_eq!(table.lookup(0, 0, &resolver), None);
        assert!(!table.remove(0, 0, &resolver));
        assert_eq!(table.lookup(0, 10, &resolver), Some(0x200));
    }

    #[test]
    fn replace_displaces_prior_entry() {
        let mut resolver = MapResolver::default();
        resolver.insert(0x100, 7, 1);
        resolver.insert(0x900, 7, 1);

        let mut table = HashTable::new(64);
        assert!(!table.replace(0x100, &resolver));
        assert!(table.replace(0x900, &resolver));
        assert_eq!(table.lookup(7, 1, &resolver), Some(0x900));
    }

    #[test]
    fn chains_grow_and_resolve() {
        // A single bucket forces every key through the overflow chain.
        let mut resolver = MapResolver::default();
        let mut table = HashTable::new(1);
        for id in 0..40u64 {
            let address = 0x1000 + id;
            resolver.insert(address, 3, id);
            assert!(!table.replace(address, &resolver));
        }
        for id in 0..40u64 {
            assert_eq!(table.lookup(3, id, &resolver), Some(0x1000 + id));
        }

        // Deletion leaves chains in place but frees the slots.
        for id in (0..40u64).step_by(2) {
            assert!(table.remove(3, id, &resolver));
        }
        for id in 0..40u64 {
            let expected = if id % 2 == 0 { None } else { Some(0x1000 + id) };
            assert_eq!(table.lookup(3, id, &resolver), expected);
        }

        let mut visited = Vec::new();
        table.for_each(|pointer| visited.push(pointer));
        assert_eq!(visited.len(), 20);
    }

    #[test]
    fn for_each_visits_everything_once() {
        let mut resolver = MapResolver::default();
        let mut table = HashTable::new(16);
        for id in 0..100u64 {
            let address = 0x5000 + id;
            resolver.insert(address, 1, id);
            table.replace(address, &resolver);
        }
        let mut visited = Vec::new();
        table.for_each(|pointer| visited.push(pointer));
        visited.sort_unstable();
        let expected: Vec<u64> = (0..100u64).map(|id| 0x5000 + id).collect();
        assert_eq!(visited, expected);
    }

    #[test]
    fn distribution_starts_empty() {
        let distribution = PerfDistribution::new();
        assert_eq!(distribution.min, u64::MAX);
        assert_eq!(distribution.max, 0);
        assert_eq!(distribution.bin_overflows, 0);
        assert_eq!(distribution.bin(0), 0);
        assert_eq!(distribution.bin(1), 0);
    }

    #[test]
    fn distribution_bins_samples() {
        let mut distribution = PerfDistribution::new();
        distribution.store_sample(3);
        assert_eq!(distribution.min, 3);
        assert_eq!(distribution.max, 3);
        assert_eq!(distribution.bin(0), 1);

        distribution.store_sample(3);
        distribution.store_sample(PerfDistribution::NBINS as u64 * PerfDistribution::BIN_WIDTH + 40);
        distribution.store_sample(12);
        distribution.store_sample(78);

        assert_eq!(distribution.min, 3);
        assert_eq!(
            distribution.max,
            PerfDistribution::NBINS as u64 * PerfDistribution::BIN_WIDTH + 40
        );
        assert_eq!(distribution.bin_overflows, 1);
        assert_eq!(distribution.bin(0), 2);
        assert_eq!(distribution.bin(1), 1);
        assert_eq!(distribution.bin(7), 1);
    }

    #[test]
    fn lookups_are_sampled() {
        let mut resolver = MapResolver::default();
        resolver.insert(0x100, 0, 0);
        let mut table = HashTable::new(8);
        table.replace(0x100, &resolver);
        table.lookup(0, 0, &resolver);
        table.lookup(0, 1, &resolver);
        assert_eq!(table.lookup_distribution().samples(), 2);
    }
}
