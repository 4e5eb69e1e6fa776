use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    io,
    ops::Deref,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    blob::{BlobMeta, BlobPtr, BlobStats, BlobStore, FileBlobStore},
    cache::ItemSetCache,
    config::{Access, GixConfig},
    encoding::{decode_from_slice, encode_to_vec, Decode, Encode},
    error::GixError,
    fs::DbDir,
    itemset::{ItemSet, ItemSetStore},
    merger::Merger,
    root::Root,
};

#[cfg(test)]
mod metamorphic_test;

pub const BLOB_FILE: &str = "gix.blob";

pub trait GixKey: Clone + Eq + Hash + Debug + Encode + Decode + Serialize + DeserializeOwned {}

impl<T> GixKey for T where T: Clone + Eq + Hash + Debug + Encode + Decode + Serialize + DeserializeOwned
{}

pub trait GixItem: Clone + Debug + Encode + Decode {}

impl<T> GixItem for T where T: Clone + Debug + Encode + Decode {}

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta<K> {
    keys: Vec<(K, BlobPtr)>,
    blobs: BlobMeta,
}

/// Everything an itemset may touch besides itself: blob storage, the merge
/// policy, split configuration and the running size delta.
#[derive(Debug)]
pub struct Backend<B, M> {
    blobs: B,
    merger: M,
    config: GixConfig,
    size_delta: u64,
}

impl<B: BlobStore, M> Backend<B, M> {
    pub fn new(blobs: B, merger: M, config: GixConfig) -> Self {
        Backend {
            blobs,
            merger,
            config,
            size_delta: 0,
        }
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn size_delta(&self) -> u64 {
        self.size_delta
    }

    pub fn assert_writable(&self) {
        assert!(
            self.config.access.is_writable(),
            "{} (opened as {:?})",
            GixError::ReadOnly,
            self.config.access
        );
    }
}

impl<K, I, B, M> ItemSetStore<K, I> for Backend<B, M>
where
    I: Encode + Decode,
    B: BlobStore,
    M: Merger<K, I>,
{
    type Merger = M;

    fn merger(&self) -> &M {
        &self.merger
    }

    fn config(&self) -> &GixConfig {
        &self.config
    }

    fn load_child(&mut self, ptr: BlobPtr) -> anyhow::Result<Vec<I>> {
        let buf = self.blobs.get(ptr)?;
        decode_from_slice(&buf).map_err(|e| GixError::corrupt(ptr, e.to_string()).into())
    }

    fn enlist_child(&mut self, items: &[I]) -> anyhow::Result<BlobPtr> {
        self.assert_writable();
        self.blobs.put(&encode_to_vec(items))
    }

    fn store_child(&mut self, ptr: BlobPtr, items: &[I]) -> anyhow::Result<BlobPtr> {
        self.assert_writable();
        self.blobs.put_at(ptr, &encode_to_vec(items))
    }

    fn delete_child(&mut self, ptr: BlobPtr) -> anyhow::Result<()> {
        self.assert_writable();
        self.blobs.delete(ptr)
    }

    fn add_to_size_delta(&mut self, old: usize, new: usize) {
        if new >= old {
            self.size_delta += (new - old) as u64;
        } else {
            self.size_delta = self.size_delta.saturating_sub((old - new) as u64);
        }
    }
}

enum SetRef<'a, K, I> {
    Cached(&'a mut ItemSet<K, I>),
    // Not in the index; nothing done to it is kept.
    Fresh(ItemSet<K, I>),
}

/// An itemset borrowed from an index together with the storage it needs to
/// page in children.
pub struct ItemSetView<'a, K, I, S> {
    set: SetRef<'a, K, I>,
    store: &'a mut S,
}

impl<'a, K, I, S> ItemSetView<'a, K, I, S>
where
    I: Clone,
    S: ItemSetStore<K, I>,
{
    fn parts(&mut self) -> (&mut ItemSet<K, I>, &mut S) {
        let set = match &mut self.set {
            SetRef::Cached(set) => &mut **set,
            SetRef::Fresh(set) => set,
        };
        (set, &mut *self.store)
    }

    /// Whether the key had no itemset in the index.
    pub fn is_fresh(&self) -> bool {
        matches!(self.set, SetRef::Fresh(_))
    }

    pub fn consolidate(&mut self) -> anyhow::Result<()> {
        let (set, store) = self.parts();
        set.consolidate(store)
    }

    pub fn item_vec(&mut self) -> anyhow::Result<Vec<I>> {
        let (set, store) = self.parts();
        set.item_vec(store)
    }

    pub fn get_item(&mut self, n: usize) -> anyhow::Result<I> {
        let (set, store) = self.parts();
        Ok(set.get_item(n, store)?.clone())
    }
}

impl<'a, K, I, S> Deref for ItemSetView<'a, K, I, S> {
    type Target = ItemSet<K, I>;

    fn deref(&self) -> &ItemSet<K, I> {
        match &self.set {
            SetRef::Cached(set) => set,
            SetRef::Fresh(set) => set,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GixStats {
    pub cached_item_sets: usize,
    pub dirty_item_sets: usize,
    pub avg_loaded_fraction: f64,
    pub avg_dirty_loaded_fraction: f64,
    pub avg_len: f64,
    pub mem_used: u64,
}

impl GixStats {
    /// Combines the stats of two indexes, weighting averages by how many
    /// itemsets each side contributed.
    pub fn add(&self, other: &GixStats) -> GixStats {
        let weighted = |a: f64, na: usize, b: f64, nb: usize| {
            if na + nb == 0 {
                0.0
            } else {
                (a * na as f64 + b * nb as f64) / (na + nb) as f64
            }
        };
        GixStats {
            cached_item_sets: self.cached_item_sets + other.cached_item_sets,
            dirty_item_sets: self.dirty_item_sets + other.dirty_item_sets,
            avg_loaded_fraction: weighted(
                self.avg_loaded_fraction,
                self.cached_item_sets,
                other.avg_loaded_fraction,
                other.cached_item_sets,
            ),
            avg_dirty_loaded_fraction: weighted(
                self.avg_dirty_loaded_fraction,
                self.dirty_item_sets,
                other.avg_dirty_loaded_fraction,
                other.dirty_item_sets,
            ),
            avg_len: weighted(
                self.avg_len,
                self.cached_item_sets,
                other.avg_len,
                other.cached_item_sets,
            ),
            mem_used: self.mem_used + other.mem_used,
        }
    }
}

pub type FileBackend<D, M> = Backend<FileBlobStore<<D as DbDir>::DbFile>, M>;

/// A disk-backed inverted index from keys to itemsets.
///
/// Every itemset is a blob in the index directory; recently used ones are
/// kept decoded in a byte-budgeted cache and written back when evicted,
/// flushed or when the index is dropped. The key table is persisted as a
/// whole on flush.
pub struct Gix<D, K, I, M>
where
    D: DbDir,
    K: GixKey,
    I: GixItem,
    M: Merger<K, I>,
{
    root: Root<IndexMeta<K>, D>,
    keys: HashMap<K, BlobPtr>,
    cache: ItemSetCache<K, I>,
    backend: FileBackend<D, M>,
    cache_full: bool,
    closed: bool,
}

impl<D, K, I, M> Gix<D, K, I, M>
where
    D: DbDir,
    K: GixKey,
    I: GixItem,
    M: Merger<K, I>,
{
    pub fn open(mut dir: D, config: GixConfig, merger: M) -> anyhow::Result<Self> {
        config.validate()?;
        let mut root: Root<IndexMeta<K>, D> = Root::new(dir.clone());
        let (keys, blobs) = match config.access {
            Access::Create => {
                dir.unlink(&BLOB_FILE)?;
                let file = dir
                    .create(&BLOB_FILE)?
                    .ok_or_else(|| anyhow!("{} reappeared during create", BLOB_FILE))?;
                let blobs = FileBlobStore::create(file);
                root.write(&IndexMeta {
                    keys: Vec::new(),
                    blobs: blobs.meta(),
                })?;
                (HashMap::new(), blobs)
            }
            Access::Update | Access::ReadOnly | Access::Restore => {
                let meta = root.load().context("loading index metadata")?;
                let file = dir
                    .open(&BLOB_FILE)?
                    .ok_or_else(|| anyhow!("index directory has no {}", BLOB_FILE))?;
                let blobs = if config.access == Access::Restore {
                    FileBlobStore::restore(file)?
                } else {
                    FileBlobStore::open(file, meta.blobs)
                };
                (meta.keys.into_iter().collect(), blobs)
            }
        };
        tracing::debug!(access = ?config.access, keys = keys.len(), "opened index");

        Ok(Gix {
            root,
            keys,
            cache: ItemSetCache::new(config.cache_size),
            backend: Backend::new(blobs, merger, config),
            cache_full: false,
            closed: false,
        })
    }

    pub fn config(&self) -> &GixConfig {
        &self.backend.config
    }

    pub fn is_key(&self, key: &K) -> bool {
        self.keys.contains_key(key)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.keys()
    }

    pub fn is_cache_full(&self) -> bool {
        self.cache_full
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn blob_stats(&self) -> &BlobStats {
        self.backend.blobs.stats()
    }

    pub fn reset_blob_stats(&mut self) {
        self.backend.blobs.reset_stats()
    }

    /// Writes a dirty itemset back to its blob, or frees the blob and drops
    /// the key if consolidation left the itemset empty.
    fn persist(
        backend: &mut FileBackend<D, M>,
        keys: &mut HashMap<K, BlobPtr>,
        ptr: BlobPtr,
        set: &mut ItemSet<K, I>,
    ) -> anyhow::Result<Option<BlobPtr>> {
        backend.assert_writable();
        set.consolidate(backend)?;
        if set.is_empty() {
            backend.blobs.delete(ptr)?;
            keys.remove(set.key());
            return Ok(None);
        }
        let buf = set.save(backend)?;
        let new_ptr = backend.blobs.put_at(ptr, &buf)?;
        if let Some(p) = keys.get_mut(set.key()) {
            *p = new_ptr;
        }
        Ok(Some(new_ptr))
    }

    fn shrink_cache(
        cache: &mut ItemSetCache<K, I>,
        backend: &mut FileBackend<D, M>,
        keys: &mut HashMap<K, BlobPtr>,
        reserve: u64,
    ) -> anyhow::Result<usize> {
        let writable = backend.config.access.is_writable();
        cache.shrink_to_capacity(reserve, |ptr, mut set| {
            if writable && set.is_dirty() {
                Self::persist(backend, keys, ptr, &mut set)?;
            }
            Ok(())
        })
    }

    /// The cached itemset of `key`, stored at `ptr`, loading it if needed.
    fn cached<'c>(
        cache: &'c mut ItemSetCache<K, I>,
        backend: &mut FileBackend<D, M>,
        keys: &mut HashMap<K, BlobPtr>,
        key: &K,
        ptr: BlobPtr,
    ) -> anyhow::Result<&'c mut ItemSet<K, I>> {
        if !cache.contains(ptr) {
            let buf = backend.blobs.get(ptr)?;
            let set: ItemSet<K, I> =
                ItemSet::load(&buf).map_err(|e| GixError::corrupt(ptr, e.to_string()))?;
            if set.key() != key {
                return Err(GixError::corrupt(
                    ptr,
                    format!("holds itemset of {:?}, expected {:?}", set.key(), key),
                )
                .into());
            }
            let size = set.mem_used();
            Self::shrink_cache(cache, backend, keys, size as u64)?;
            ItemSetStore::<K, I>::add_to_size_delta(backend, 0, size);
            cache.insert(ptr, set);
        }
        cache
            .get_mut(ptr)
            .ok_or_else(|| anyhow!("itemset {:?} vanished from cache", ptr))
    }

    /// Stores a brand new itemset and registers its key.
    fn enlist(&mut self, key: K, mut set: ItemSet<K, I>) -> anyhow::Result<()> {
        let buf = set.save(&mut self.backend)?;
        let ptr = self.backend.blobs.put(&buf)?;
        self.keys.insert(key, ptr);
        Self::shrink_cache(
            &mut self.cache,
            &mut self.backend,
            &mut self.keys,
            set.mem_used() as u64,
        )?;
        self.cache.insert(ptr, set);
        Ok(())
    }

    fn new_item_set(&mut self, key: K) -> ItemSet<K, I> {
        ItemSetStore::<K, I>::add_to_size_delta(
            &mut self.backend,
            0,
            ItemSet::<K, I>::FIXED_OVERHEAD,
        );
        ItemSet::new(key)
    }

    pub fn add_item(&mut self, key: K, item: I) -> anyhow::Result<()> {
        self.backend.assert_writable();
        match self.keys.get(&key).copied() {
            Some(ptr) => {
                let set =
                    Self::cached(&mut self.cache, &mut self.backend, &mut self.keys, &key, ptr)?;
                set.add_item(item, &mut self.backend)?;
            }
            None => {
                let mut set = self.new_item_set(key.clone());
                set.add_item(item, &mut self.backend)?;
                self.enlist(key, set)?;
            }
        }
        self.refresh_mem_used()
    }

    pub fn add_item_vec(&mut self, key: K, items: Vec<I>) -> anyhow::Result<()> {
        self.backend.assert_writable();
        if items.is_empty() {
            return Ok(());
        }
        match self.keys.get(&key).copied() {
            Some(ptr) => {
                let set =
                    Self::cached(&mut self.cache, &mut self.backend, &mut self.keys, &key, ptr)?;
                set.add_item_vec(items, &mut self.backend)?;
            }
            None => {
                let mut set = self.new_item_set(key.clone());
                set.add_item_vec(items, &mut self.backend)?;
                self.enlist(key, set)?;
            }
        }
        self.refresh_mem_used()
    }

    /// Deletes `item` from the itemset of `key`. Unknown keys are ignored.
    /// The delete is applied on consolidation; an itemset it empties is
    /// dropped from the index when it is next stored.
    pub fn del_item(&mut self, key: &K, item: I) -> anyhow::Result<()> {
        self.backend.assert_writable();
        let ptr = match self.keys.get(key) {
            Some(ptr) => *ptr,
            None => return Ok(()),
        };
        let set = Self::cached(&mut self.cache, &mut self.backend, &mut self.keys, key, ptr)?;
        set.del_item(item, &mut self.backend)?;
        self.refresh_mem_used()
    }

    /// Removes every item of `key`. The emptied itemset is dropped from the
    /// index when it is next stored.
    pub fn clear(&mut self, key: &K) -> anyhow::Result<()> {
        self.backend.assert_writable();
        if let Some(ptr) = self.keys.get(key).copied() {
            let set = Self::cached(&mut self.cache, &mut self.backend, &mut self.keys, key, ptr)?;
            set.clear(&mut self.backend)?;
        }
        Ok(())
    }

    /// Drops `key` and frees its itemset blob along with all child blobs.
    pub fn delete_item_set(&mut self, key: &K) -> anyhow::Result<()> {
        self.backend.assert_writable();
        let ptr = match self.keys.remove(key) {
            Some(ptr) => ptr,
            None => return Ok(()),
        };
        let mut set = match self.cache.remove(ptr) {
            Some(set) => set,
            None => {
                let buf = self.backend.blobs.get(ptr)?;
                ItemSet::<K, I>::load(&buf).map_err(|e| GixError::corrupt(ptr, e.to_string()))?
            }
        };
        let size = set.mem_used();
        set.clear(&mut self.backend)?;
        self.backend.blobs.delete(ptr)?;
        ItemSetStore::<K, I>::add_to_size_delta(&mut self.backend, size, 0);
        Ok(())
    }

    /// The itemset of `key`. Keys not in the index get a fresh empty itemset
    /// that is not registered.
    pub fn item_set(
        &mut self,
        key: &K,
    ) -> anyhow::Result<ItemSetView<'_, K, I, FileBackend<D, M>>> {
        let set = match self.keys.get(key).copied() {
            Some(ptr) => SetRef::Cached(Self::cached(
                &mut self.cache,
                &mut self.backend,
                &mut self.keys,
                key,
                ptr,
            )?),
            None => SetRef::Fresh(ItemSet::new(key.clone())),
        };
        Ok(ItemSetView {
            set,
            store: &mut self.backend,
        })
    }

    /// All items of `key` in canonical order.
    pub fn item_vec(&mut self, key: &K) -> anyhow::Result<Vec<I>> {
        let mut view = self.item_set(key)?;
        view.consolidate()?;
        view.item_vec()
    }

    /// Stores the cached itemset at `ptr`, returning where it now lives, or
    /// `None` if it was empty and has been removed.
    pub fn store_item_set(&mut self, ptr: BlobPtr) -> anyhow::Result<Option<BlobPtr>> {
        let set = self
            .cache
            .peek_mut(ptr)
            .ok_or_else(|| anyhow!("itemset {:?} is not cached", ptr))?;
        let result = Self::persist(&mut self.backend, &mut self.keys, ptr, set)?;
        match result {
            None => {
                self.cache.remove(ptr);
            }
            Some(new_ptr) => self.cache.rekey(ptr, new_ptr),
        }
        Ok(result)
    }

    /// Stores dirty itemsets, least recently used first, until `budget` has
    /// elapsed. Returns how many were stored.
    pub fn partial_flush(&mut self, budget: Duration) -> anyhow::Result<usize> {
        if !self.backend.config.access.is_writable() {
            return Ok(0);
        }
        let start = Instant::now();
        let mut stored = 0;
        for ptr in self.cache.ptrs_lru() {
            if start.elapsed() > budget {
                break;
            }
            if self.cache.peek(ptr).map_or(false, |s| s.is_dirty()) {
                self.store_item_set(ptr)?;
                stored += 1;
            }
        }
        tracing::info!(stored, elapsed = ?start.elapsed(), "partial flush");
        Ok(stored)
    }

    /// Once enough size change has accumulated, compacts the work buffers of
    /// cached itemsets, re-measures the cache and evicts down to budget.
    pub fn refresh_mem_used(&mut self) -> anyhow::Result<()> {
        if self.backend.size_delta <= self.backend.config.cache_reset_threshold() {
            return Ok(());
        }
        for set in self.cache.iter_mut() {
            set.def_local(&mut self.backend);
        }
        let used = self.cache.refresh_mem_used();
        self.cache_full = used > self.cache.capacity();
        let evicted = Self::shrink_cache(&mut self.cache, &mut self.backend, &mut self.keys, 0)?;
        tracing::debug!(used, evicted, "refreshed cache size");
        self.backend.size_delta = 0;
        Ok(())
    }

    /// Stores every dirty itemset and persists the key table.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.backend.assert_writable();
        let dirty: Vec<BlobPtr> = self
            .cache
            .ptrs_lru()
            .into_iter()
            .filter(|ptr| self.cache.peek(*ptr).map_or(false, |s| s.is_dirty()))
            .collect();
        let stored = dirty.len();
        for ptr in dirty {
            self.store_item_set(ptr)?;
        }
        self.backend.blobs.sync()?;
        self.root.write(&IndexMeta {
            keys: self.keys.iter().map(|(k, p)| (k.clone(), *p)).collect(),
            blobs: self.backend.blobs.meta(),
        })?;
        // Records the previous root pointed at are unreachable only now.
        self.backend.blobs.checkpoint()?;
        tracing::debug!(stored, keys = self.keys.len(), "flushed index");
        Ok(())
    }

    /// Flushes a writable index and reports any failure, which dropping
    /// can only log.
    pub fn close(mut self) -> anyhow::Result<()> {
        self.closed = true;
        if self.backend.config.access.is_writable() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> GixStats {
        let mut stats = GixStats::default();
        let (mut loaded, mut dirty_loaded, mut len) = (0.0, 0.0, 0.0);
        for (_, set) in self.cache.iter() {
            stats.cached_item_sets += 1;
            loaded += set.loaded_fraction();
            len += set.len() as f64;
            if set.is_dirty() {
                stats.dirty_item_sets += 1;
                dirty_loaded += set.loaded_fraction();
            }
        }
        if stats.cached_item_sets > 0 {
            stats.avg_loaded_fraction = loaded / stats.cached_item_sets as f64;
            stats.avg_len = len / stats.cached_item_sets as f64;
        }
        if stats.dirty_item_sets > 0 {
            stats.avg_dirty_loaded_fraction = dirty_loaded / stats.dirty_item_sets as f64;
        }
        stats.mem_used = self.cache.mem_used();
        stats
    }

    /// Writes one line per key: its name, item count and size in memory.
    pub fn save_txt<W, F>(&mut self, w: &mut W, key_name: F) -> anyhow::Result<()>
    where
        W: io::Write,
        F: Fn(&K) -> String,
    {
        let mut named: Vec<(String, K)> =
            self.keys.keys().map(|k| (key_name(k), k.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, key) in named {
            let view = self.item_set(&key)?;
            writeln!(w, "{}\t{}\t{}", name, view.len(), view.mem_used())?;
        }
        Ok(())
    }

    /// Appends every itemset of `other` to this index.
    pub fn merge_index<D2, M2>(&mut self, other: &mut Gix<D2, K, I, M2>) -> anyhow::Result<()>
    where
        D2: DbDir,
        M2: Merger<K, I>,
    {
        self.backend.assert_writable();
        let keys: Vec<(K, BlobPtr)> = other.keys.iter().map(|(k, p)| (k.clone(), *p)).collect();
        for (key, other_ptr) in keys {
            let src = Gix::<D2, K, I, M2>::cached(
                &mut other.cache,
                &mut other.backend,
                &mut other.keys,
                &key,
                other_ptr,
            )?;
            match self.keys.get(&key).copied() {
                Some(ptr) => {
                    let dst =
                        Self::cached(&mut self.cache, &mut self.backend, &mut self.keys, &key, ptr)?;
                    dst.append_item_set(src, &mut other.backend, &mut self.backend)?;
                }
                None => {
                    let mut dst = self.new_item_set(key.clone());
                    dst.append_item_set(src, &mut other.backend, &mut self.backend)?;
                    if dst.is_empty() {
                        continue;
                    }
                    self.enlist(key, dst)?;
                }
            }
            self.refresh_mem_used()?;
        }
        Ok(())
    }
}

impl<D, K, I, M> Drop for Gix<D, K, I, M>
where
    D: DbDir,
    K: GixKey,
    I: GixItem,
    M: Merger<K, I>,
{
    fn drop(&mut self) {
        if self.closed || !self.backend.config.access.is_writable() {
            return;
        }
        if let Err(err) = self.flush() {
            tracing::error!(%err, "flushing index on drop failed");
        }
    }
}
