use std::collections::{BTreeMap, HashMap};

use crate::{blob::BlobPtr, itemset::ItemSet};

struct Entry<K, I> {
    set: ItemSet<K, I>,
    tick: u64,
    // Bytes counted into `mem_used` for this entry.
    size: u64,
}

/// Byte-budgeted LRU of itemsets, keyed by the blob pointer the itemset was
/// loaded from or last stored to.
///
/// Cached itemsets change size while they are mutated in place, so
/// `mem_used` is an estimate between calls to `refresh_mem_used`.
pub struct ItemSetCache<K, I> {
    entries: HashMap<BlobPtr, Entry<K, I>>,
    // Recency tick to pointer, oldest first.
    recency: BTreeMap<u64, BlobPtr>,
    next_tick: u64,
    capacity: u64,
    mem_used: u64,
}

impl<K, I: Clone> ItemSetCache<K, I> {
    pub fn new(capacity: u64) -> Self {
        ItemSetCache {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            capacity,
            mem_used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used
    }

    pub fn is_full(&self) -> bool {
        self.mem_used > self.capacity
    }

    pub fn contains(&self, ptr: BlobPtr) -> bool {
        self.entries.contains_key(&ptr)
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Inserts as the most recently used entry.
    pub fn insert(&mut self, ptr: BlobPtr, set: ItemSet<K, I>) {
        self.remove(ptr);
        let tick = self.bump();
        let size = set.mem_used() as u64;
        self.mem_used += size;
        self.recency.insert(tick, ptr);
        self.entries.insert(ptr, Entry { set, tick, size });
    }

    /// Looks up an entry and marks it most recently used.
    pub fn get_mut(&mut self, ptr: BlobPtr) -> Option<&mut ItemSet<K, I>> {
        let tick = self.bump();
        let entry = self.entries.get_mut(&ptr)?;
        self.recency.remove(&entry.tick);
        self.recency.insert(tick, ptr);
        entry.tick = tick;
        Some(&mut entry.set)
    }

    /// Looks up an entry without touching its recency.
    pub fn peek(&self, ptr: BlobPtr) -> Option<&ItemSet<K, I>> {
        self.entries.get(&ptr).map(|e| &e.set)
    }

    pub fn peek_mut(&mut self, ptr: BlobPtr) -> Option<&mut ItemSet<K, I>> {
        self.entries.get_mut(&ptr).map(|e| &mut e.set)
    }

    pub fn remove(&mut self, ptr: BlobPtr) -> Option<ItemSet<K, I>> {
        let entry = self.entries.remove(&ptr)?;
        self.recency.remove(&entry.tick);
        self.mem_used = self.mem_used.saturating_sub(entry.size);
        Some(entry.set)
    }

    /// Moves an entry to a new pointer, keeping its recency.
    pub fn rekey(&mut self, from: BlobPtr, to: BlobPtr) {
        if from == to {
            return;
        }
        if let Some(entry) = self.entries.remove(&from) {
            self.recency.insert(entry.tick, to);
            self.entries.insert(to, entry);
        }
    }

    /// Pointers from least to most recently used.
    pub fn ptrs_lru(&self) -> Vec<BlobPtr> {
        self.recency.values().copied().collect()
    }

    /// Entries from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (BlobPtr, &ItemSet<K, I>)> {
        self.recency
            .values()
            .rev()
            .filter_map(|ptr| self.entries.get(ptr).map(|e| (*ptr, &e.set)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ItemSet<K, I>> {
        self.entries.values_mut().map(|e| &mut e.set)
    }

    pub fn pop_lru(&mut self) -> Option<(BlobPtr, ItemSet<K, I>)> {
        let (_, ptr) = self.recency.pop_first()?;
        let entry = self.entries.remove(&ptr)?;
        self.mem_used = self.mem_used.saturating_sub(entry.size);
        Some((ptr, entry.set))
    }

    /// Re-measures every entry.
    pub fn refresh_mem_used(&mut self) -> u64 {
        self.mem_used = self
            .entries
            .values_mut()
            .map(|e| {
                e.size = e.set.mem_used() as u64;
                e.size
            })
            .sum();
        self.mem_used
    }

    /// Evicts least recently used entries until `reserve` more bytes fit in
    /// the budget. Returns how many entries were evicted.
    pub fn shrink_to_capacity<F>(&mut self, reserve: u64, mut on_evict: F) -> anyhow::Result<usize>
    where
        F: FnMut(BlobPtr, ItemSet<K, I>) -> anyhow::Result<()>,
    {
        let mut evicted = 0;
        while self.mem_used + reserve > self.capacity {
            match self.pop_lru() {
                Some((ptr, set)) => {
                    on_evict(ptr, set)?;
                    evicted += 1;
                }
                None => break,
            }
        }
        Ok(evicted)
    }
}
