//! The client's bounded, byte-range data cache: a global LRU over
//! (filename, range) blocks, with partial-range invalidation on revoke.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;

type CacheKey = (String, u64, u64);

/// Outcome of an [`DataCache::invalidate`] call, reported so the caller can
/// drive the `invalidations` execstat counter once per revocation rather
/// than once per block touched.
pub struct InvalidateResult {
    pub touched: bool,
}

#[derive(Default)]
pub struct DataCache {
    cap: usize,
    order: Option<LruCache<CacheKey, ()>>,
    blocks: HashMap<String, BTreeMap<(u64, u64), Vec<u8>>>,
    evictions: u64,
}

impl DataCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            order: NonZeroUsize::new(cap).map(LruCache::new),
            blocks: HashMap::new(),
            evictions: 0,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.blocks.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks dropped by [`Self::update`] to make room, since
    /// construction.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Walk blocks in ascending start order, copying every overlap with
    /// `[start, end]` into the output and touching each as MRU. Misses
    /// (the cursor never reaches `end + 1`) return `None`.
    pub fn read(&mut self, filename: &str, start: u64, end: u64) -> Option<Vec<u8>> {
        let ranges: Vec<(u64, u64)> = self
            .blocks
            .get(filename)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();

        let mut out = Vec::new();
        let mut cursor = start;
        for (block_start, block_end) in ranges {
            if block_start > cursor {
                break;
            }
            if block_end < cursor {
                continue;
            }
            let copy_start = cursor.max(block_start);
            let copy_end = end.min(block_end);
            if copy_start > copy_end {
                continue;
            }
            let data = &self.blocks[filename][&(block_start, block_end)];
            let lo = (copy_start - block_start) as usize;
            let hi = (copy_end - block_start) as usize;
            out.extend_from_slice(&data[lo..=hi]);
            self.touch(filename, block_start, block_end);

            cursor = copy_end + 1;
            if cursor > end {
                return Some(out);
            }
        }
        None
    }

    fn touch(&mut self, filename: &str, start: u64, end: u64) {
        if let Some(order) = &mut self.order {
            order.promote(&(filename.to_string(), start, end));
        }
    }

    /// Insert `[start, end]` as a single new block, evicting the global LRU
    /// victim first if at capacity. Existing blocks overlapping the new
    /// range are dropped or split around it first, keeping a file's blocks
    /// non-overlapping.
    pub fn update(&mut self, filename: &str, start: u64, end: u64, data: Vec<u8>) {
        if self.cap == 0 {
            return;
        }
        self.invalidate(filename, start, end);
        self.insert_block(filename, start, end, data);
    }

    fn insert_block(&mut self, filename: &str, start: u64, end: u64, data: Vec<u8>) {
        let key: CacheKey = (filename.to_string(), start, end);
        if let Some(order) = &mut self.order {
            if let Some((evicted_key, _)) = order.push(key, ()) {
                if evicted_key.0 != filename || evicted_key.1 != start || evicted_key.2 != end {
                    self.remove_block(&evicted_key.0, evicted_key.1, evicted_key.2);
                    self.evictions += 1;
                }
            }
        }
        self.blocks
            .entry(filename.to_string())
            .or_default()
            .insert((start, end), data);
    }

    fn remove_block(&mut self, filename: &str, start: u64, end: u64) {
        if let Some(map) = self.blocks.get_mut(filename) {
            map.remove(&(start, end));
            if map.is_empty() {
                self.blocks.remove(filename);
            }
        }
    }

    /// Drop every block overlapping `[revoked_start, revoked_end]`,
    /// re-inserting up to two split blocks for the disjoint remainder of
    /// each, sliced from the original data.
    pub fn invalidate(&mut self, filename: &str, revoked_start: u64, revoked_end: u64) -> InvalidateResult {
        let Some(map) = self.blocks.get(filename) else {
            return InvalidateResult { touched: false };
        };

        let overlapping: Vec<((u64, u64), Vec<u8>)> = map
            .iter()
            .filter(|((s, e), _)| *s <= revoked_end && *e >= revoked_start)
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        if overlapping.is_empty() {
            return InvalidateResult { touched: false };
        }

        for ((block_start, block_end), data) in overlapping {
            self.remove_block(filename, block_start, block_end);
            if let Some(order) = &mut self.order {
                order.pop(&(filename.to_string(), block_start, block_end));
            }

            if block_start < revoked_start {
                let new_end = revoked_start - 1;
                let slice = data[0..=(new_end - block_start) as usize].to_vec();
                self.insert_block(filename, block_start, new_end, slice);
            }
            if block_end > revoked_end {
                let new_start = revoked_end + 1;
                let lo = (new_start - block_start) as usize;
                let slice = data[lo..].to_vec();
                self.insert_block(filename, new_start, block_end, slice);
            }
        }

        InvalidateResult { touched: true }
    }

    /// Drop every block across every file.
    pub fn clear(&mut self) {
        self.blocks.clear();
        if let Some(order) = &mut self.order {
            order.clear();
        }
    }

    /// Drop every block for `filename`, returning how many were dropped
    /// (for the `close_evictions` execstat counter).
    pub fn close(&mut self, filename: &str) -> u64 {
        let Some(map) = self.blocks.remove(filename) else {
            return 0;
        };
        if let Some(order) = &mut self.order {
            for (start, end) in map.keys() {
                order.pop(&(filename.to_string(), *start, *end));
            }
        }
        map.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_hit_returns_bytes() {
        let mut cache = DataCache::new(4);
        cache.update("f", 0, 9, (0..10).collect());
        assert_eq!(cache.read("f", 0, 9), Some((0..10).collect()));
    }

    #[test]
    fn partial_coverage_is_a_miss() {
        let mut cache = DataCache::new(4);
        cache.update("f", 0, 4, vec![0; 5]);
        assert_eq!(cache.read("f", 0, 9), None);
    }

    #[test]
    fn invalidate_splits_around_revoked_range() {
        let mut cache = DataCache::new(4);
        cache.update("f", 0, 1023, (0u32..1024).map(|i| (i % 256) as u8).collect());
        cache.invalidate("f", 512, 767);

        assert_eq!(cache.read("f", 512, 767), None);
        let left = cache.read("f", 0, 511).unwrap();
        assert_eq!(left, (0u32..512).map(|i| (i % 256) as u8).collect::<Vec<_>>());
        let right = cache.read("f", 768, 1023).unwrap();
        assert_eq!(
            right,
            (768u32..1024).map(|i| (i % 256) as u8).collect::<Vec<_>>()
        );
    }

    #[test]
    fn lru_eviction_drops_least_recently_touched() {
        let mut cache = DataCache::new(4);
        cache.update("f", 0, 9, vec![0; 10]);
        cache.update("f", 20, 29, vec![1; 10]);
        cache.update("f", 40, 49, vec![2; 10]);
        cache.update("f", 60, 69, vec![3; 10]);

        // touch the first three, leaving [60,69] the LRU victim.
        cache.read("f", 0, 9);
        cache.read("f", 20, 29);
        cache.read("f", 40, 49);

        cache.update("f", 80, 89, vec![4; 10]);

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.read("f", 60, 69), None);
        assert!(cache.read("f", 0, 9).is_some());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn update_over_existing_overlap_keeps_blocks_disjoint() {
        let mut cache = DataCache::new(4);
        cache.update("f", 0, 9, vec![1; 10]);
        cache.update("f", 5, 14, vec![2; 10]);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.read("f", 0, 4), Some(vec![1; 5]));
        assert_eq!(cache.read("f", 5, 14), Some(vec![2; 10]));
    }

    #[test]
    fn invalidation_splits_never_grow_past_the_cap() {
        let mut cache = DataCache::new(2);
        cache.update("f", 0, 9, vec![0; 10]);
        cache.update("f", 20, 29, vec![1; 10]);

        // Splitting [0,9] around [3,6] adds a block; the cap still holds.
        cache.invalidate("f", 3, 6);
        assert!(cache.len() <= 2);
    }

    #[test]
    fn close_drops_all_blocks_for_file() {
        let mut cache = DataCache::new(4);
        cache.update("f", 0, 9, vec![0; 10]);
        cache.update("g", 0, 9, vec![1; 10]);

        let dropped = cache.close("f");
        assert_eq!(dropped, 1);
        assert_eq!(cache.read("f", 0, 9), None);
        assert!(cache.read("g", 0, 9).is_some());
    }
}
