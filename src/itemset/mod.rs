use anyhow::bail;

use crate::{
    blob::BlobPtr,
    config::GixConfig,
    encoding::{BlobReader, BlobWriter, Decode, Encode},
    error::{reserve, GixError},
    merger::Merger,
};


/// What an itemset needs from its index while it splits, merges and pages
/// children in and out.
pub trait ItemSetStore<K, I> {
    type Merger: Merger<K, I>;

    fn merger(&self) -> &Self::Merger;
    fn config(&self) -> &GixConfig;
    fn load_child(&mut self, ptr: BlobPtr) -> anyhow::Result<Vec<I>>;
    fn enlist_child(&mut self, items: &[I]) -> anyhow::Result<BlobPtr>;
    fn store_child(&mut self, ptr: BlobPtr, items: &[I]) -> anyhow::Result<BlobPtr>;
    fn delete_child(&mut self, ptr: BlobPtr) -> anyhow::Result<()>;
    /// Reports that something owned by the index went from `old` to `new`
    /// bytes.
    fn add_to_size_delta(&mut self, old: usize, new: usize);
}

#[derive(Debug)]
enum ChildSlot<I> {
    Unloaded,
    Loaded(Vec<I>),
}

/// A paged segment of an itemset. `min` and `max` bound its items, so the
/// segment can be skipped without loading it.
#[derive(Debug)]
struct Child<I> {
    min: I,
    max: I,
    len: usize,
    ptr: BlobPtr,
    // Loaded contents differ from the stored blob.
    dirty: bool,
    slot: ChildSlot<I>,
}

/// The items of one key: a sorted chain of blob-backed children followed by
/// an in-memory work buffer that absorbs new items and tombstones.
///
/// Appends are cheap; ordering, coalescing and deletion are deferred to
/// [`ItemSet::consolidate`], after which the work buffer and every child are
/// sorted, disjoint and free of pending deletes.
#[derive(Debug)]
pub struct ItemSet<K, I> {
    key: K,
    items: Vec<I>,
    // Indices into `items` of tombstones.
    deletes: Vec<usize>,
    children: Vec<Child<I>>,
    total: usize,
    merged: bool,
    dirty: bool,
}

impl<K, I: Clone> ItemSet<K, I> {
    pub const FIXED_OVERHEAD: usize = std::mem::size_of::<Self>();

    pub fn new(key: K) -> Self {
        ItemSet {
            key,
            items: Vec::new(),
            deletes: Vec::new(),
            children: Vec::new(),
            total: 0,
            merged: true,
            dirty: false,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Number of items, counting unconsolidated entries and tombstones.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_full(&self, config: &GixConfig) -> bool {
        self.items.len() >= config.split_len
    }

    pub fn work_buffer_len(&self) -> usize {
        self.items.len()
    }

    pub fn pending_deletes(&self) -> &[usize] {
        &self.deletes
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn child_len(&self, i: usize) -> usize {
        self.children[i].len
    }

    pub fn child_range(&self, i: usize) -> (&I, &I) {
        (&self.children[i].min, &self.children[i].max)
    }

    pub fn is_child_loaded(&self, i: usize) -> bool {
        matches!(self.children[i].slot, ChildSlot::Loaded(_))
    }

    pub fn loaded_fraction(&self) -> f64 {
        if self.children.is_empty() {
            return 1.0;
        }
        let loaded = (0..self.children.len())
            .filter(|i| self.is_child_loaded(*i))
            .count();
        loaded as f64 / self.children.len() as f64
    }

    pub fn mem_used(&self) -> usize {
        Self::FIXED_OVERHEAD + self.variable_mem()
    }

    fn items_mem(&self) -> usize {
        self.items.capacity() * std::mem::size_of::<I>()
    }

    fn variable_mem(&self) -> usize {
        let loaded: usize = self
            .children
            .iter()
            .map(|c| match &c.slot {
                ChildSlot::Loaded(data) => data.capacity() * std::mem::size_of::<I>(),
                ChildSlot::Unloaded => 0,
            })
            .sum();
        self.items_mem()
            + self.deletes.capacity() * std::mem::size_of::<usize>()
            + self.children.capacity() * std::mem::size_of::<Child<I>>()
            + loaded
    }

    fn recalc_total(&mut self) {
        self.total = self.items.len() + self.children.iter().map(|c| c.len).sum::<usize>();
    }

    /// Loads child `i` if needed and returns how many bytes that brought in.
    fn ensure_loaded<S>(&mut self, i: usize, store: &mut S) -> anyhow::Result<usize>
    where
        S: ItemSetStore<K, I>,
    {
        let child = &mut self.children[i];
        if let ChildSlot::Loaded(_) = child.slot {
            return Ok(0);
        }
        let data = store.load_child(child.ptr)?;
        if data.len() != child.len {
            return Err(GixError::corrupt(
                child.ptr,
                format!("child holds {} items, expected {}", data.len(), child.len),
            )
            .into());
        }
        let bytes = data.capacity() * std::mem::size_of::<I>();
        child.slot = ChildSlot::Loaded(data);
        child.dirty = false;
        Ok(bytes)
    }

    fn child_data_mut<S>(&mut self, i: usize, store: &mut S) -> anyhow::Result<&mut Vec<I>>
    where
        S: ItemSetStore<K, I>,
    {
        self.ensure_loaded(i, store)?;
        match &mut self.children[i].slot {
            ChildSlot::Loaded(data) => Ok(data),
            ChildSlot::Unloaded => unreachable!("child {} was just loaded", i),
        }
    }

    fn push_item<S>(&mut self, item: I, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        let old = self.items_mem();
        reserve(&mut self.items, 1)?;
        self.items.push(item);
        store.add_to_size_delta(old, self.items_mem());
        self.total += 1;
        self.dirty = true;
        Ok(())
    }

    /// Consolidates a full work buffer and moves whatever still does not fit
    /// into new children.
    fn make_room<S>(&mut self, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        if !self.is_full(store.config()) {
            return Ok(());
        }
        let old = self.variable_mem();
        self.def(store)?;
        if self.is_full(store.config()) {
            self.push_work_buffer_to_children(store)?;
        }
        self.recalc_total();
        store.add_to_size_delta(old, self.variable_mem());
        Ok(())
    }

    pub fn add_item<S>(&mut self, item: I, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        self.make_room(store)?;
        if self.merged {
            // Still merged only if the item strictly extends the sequence;
            // an equal item has to be coalesced.
            let merger = store.merger();
            self.merged = match (self.items.last(), self.children.last()) {
                (Some(last), _) => merger.is_lt(last, &item),
                (None, Some(child)) => merger.is_lt(&child.max, &item),
                (None, None) => true,
            };
        }
        self.push_item(item, store)
    }

    pub fn add_item_vec<S>(&mut self, items: Vec<I>, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        for item in items {
            self.add_item(item, store)?;
        }
        Ok(())
    }

    /// Records a tombstone. Consolidation removes every entry equal to `item`
    /// from the children and from the work buffer up to the tombstone.
    pub fn del_item<S>(&mut self, item: I, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        self.make_room(store)?;
        reserve(&mut self.deletes, 1)?;
        self.deletes.push(self.items.len());
        self.merged = false;
        self.push_item(item, store)
    }

    /// Merges the work buffer alone, which is cheap and needs no child I/O.
    /// Skipped while tombstones are pending.
    pub fn def_local<S>(&mut self, store: &mut S)
    where
        S: ItemSetStore<K, I>,
    {
        if self.merged || !self.deletes.is_empty() {
            return;
        }
        let old_len = self.items.len();
        let old_mem = self.items_mem();
        store.merger().merge(&mut self.items, true);
        self.merged = match (self.children.last(), self.items.first()) {
            (Some(last), Some(first)) => store.merger().is_lt(&last.max, first),
            _ => true,
        };
        self.total = self.total - old_len + self.items.len();
        self.dirty = true;
        store.add_to_size_delta(old_mem, self.items_mem());
    }

    /// Brings the itemset into canonical form: deletes applied, everything
    /// sorted and coalesced, children within split bounds.
    pub fn consolidate<S>(&mut self, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        if self.merged {
            return Ok(());
        }
        let old = self.variable_mem();
        self.def(store)?;
        store.add_to_size_delta(old, self.variable_mem());
        Ok(())
    }

    fn def<S>(&mut self, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        if self.merged {
            return Ok(());
        }
        self.process_deletes(store)?;
        store.merger().merge(&mut self.items, true);
        self.dirty = true;
        self.inject_work_buffer_to_children(store)?;

        let first = self.first_child_to_merge(store.config());
        if first.is_some() || (!self.children.is_empty() && !self.items.is_empty()) {
            let first = first.unwrap_or(self.children.len());
            let mut merged = Vec::new();
            for i in first..self.children.len() {
                let data = self.child_data_mut(i, store)?;
                reserve(&mut merged, data.len())?;
                merged.append(data);
            }
            reserve(&mut merged, self.items.len())?;
            merged.append(&mut self.items);
            store.merger().merge(&mut merged, false);
            self.push_merged_data_back(first, merged, store)?;
            self.push_work_buffer_to_children(store)?;
        }

        while self.children.first().map_or(false, |c| c.len == 0) {
            let child = self.children.remove(0);
            store.delete_child(child.ptr)?;
        }
        self.recalc_total();
        self.merged = true;
        Ok(())
    }

    fn process_deletes<S>(&mut self, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        if self.deletes.is_empty() {
            return Ok(());
        }
        let deletes = std::mem::take(&mut self.deletes);
        let items = std::mem::take(&mut self.items);
        let mut kept = Vec::new();
        reserve(&mut kept, items.len())?;
        let mut next = 0;
        for &d in &deletes {
            let val = &items[d];
            if let Some(i) = self.child_containing(val, store.merger()) {
                let data = self.child_data_mut(i, store)?;
                store.merger().delete(val, data);
                let len = data.len();
                let child = &mut self.children[i];
                child.len = len;
                child.dirty = true;
            }
            // Only entries up to the tombstone are affected; later ones were
            // added after the delete.
            kept.extend_from_slice(&items[next..=d]);
            next = d + 1;
            store.merger().delete(val, &mut kept);
        }
        kept.extend_from_slice(&items[next..]);
        self.items = kept;
        self.dirty = true;
        Ok(())
    }

    fn child_containing<M: Merger<K, I>>(&self, val: &I, merger: &M) -> Option<usize> {
        let first = self.children.first()?;
        let mut j = if merger.is_lte(val, &first.max) {
            Some(0)
        } else {
            Some(self.children.len() - 1)
        };
        while let Some(i) = j {
            let child = &self.children[i];
            if !merger.is_lte(val, &child.max) {
                break;
            }
            if merger.is_lte(&child.min, val) {
                return Some(i);
            }
            j = i.checked_sub(1);
        }
        None
    }

    /// Moves work buffer items that fall inside the range of an existing
    /// child into that child.
    fn inject_work_buffer_to_children<S>(&mut self, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        if self.children.is_empty() || self.items.is_empty() {
            return Ok(());
        }
        let mut j = self.children.len() - 1;
        while j > 0 && store.merger().is_lt(&self.items[0], &self.children[j].min) {
            j -= 1;
        }
        let mut touched = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            while j < self.children.len() && store.merger().is_lt(&self.children[j].max, &self.items[i]) {
                j += 1;
            }
            if j >= self.children.len() {
                break;
            }
            let val = self.items[i].clone();
            let data = self.child_data_mut(j, store)?;
            data.push(val);
            let len = data.len();
            self.children[j].len = len;
            self.children[j].dirty = true;
            if touched.last() != Some(&j) {
                touched.push(j);
            }
            i += 1;
        }
        if i > 0 {
            self.items.drain(..i);
            self.dirty = true;
        }
        for t in touched {
            let mut data = std::mem::take(self.child_data_mut(t, store)?);
            store.merger().merge(&mut data, false);
            let child = &mut self.children[t];
            child.len = data.len();
            child.dirty = true;
            if let (Some(first), Some(last)) = (data.first(), data.last()) {
                child.min = first.clone();
                child.max = last.clone();
            }
            child.slot = ChildSlot::Loaded(data);
        }
        Ok(())
    }

    /// The first modified child whose length left the split bounds, if any.
    fn first_child_to_merge(&self, config: &GixConfig) -> Option<usize> {
        self.children.iter().enumerate().position(|(i, c)| {
            if !c.dirty {
                return false;
            }
            if config.split_len_min <= c.len && c.len <= config.split_len_max {
                return false;
            }
            !(i == 0 && config.allow_unfilled_first_child && c.len <= config.split_len_max)
        })
    }

    /// Refills children from `first` onwards with `split_len` items each,
    /// leaves the remainder in the work buffer and frees unused children.
    fn push_merged_data_back<S>(
        &mut self,
        first: usize,
        mut merged: Vec<I>,
        store: &mut S,
    ) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        let split_len = store.config().split_len;
        let mut ci = first;
        let mut cur = 0;
        while ci < self.children.len() && merged.len() - cur > split_len {
            let chunk = merged[cur..cur + split_len].to_vec();
            let child = &mut self.children[ci];
            child.min = chunk[0].clone();
            child.max = chunk[split_len - 1].clone();
            child.len = split_len;
            child.dirty = true;
            child.slot = ChildSlot::Loaded(chunk);
            cur += split_len;
            ci += 1;
        }
        self.items = merged.split_off(cur);
        for child in self.children.drain(ci..) {
            store.delete_child(child.ptr)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Cuts full `split_len` runs off the front of the work buffer into new,
    /// already stored children.
    fn push_work_buffer_to_children<S>(&mut self, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        let split_len = store.config().split_len;
        if self.items.len() < split_len {
            return Ok(());
        }
        let full = self.items.len() / split_len * split_len;
        let tail = self.items.split_off(full);
        let head = std::mem::replace(&mut self.items, tail);
        for chunk in head.chunks(split_len) {
            let ptr = store.enlist_child(chunk)?;
            self.children.push(Child {
                min: chunk[0].clone(),
                max: chunk[split_len - 1].clone(),
                len: split_len,
                ptr,
                dirty: false,
                slot: ChildSlot::Unloaded,
            });
        }
        self.dirty = true;
        Ok(())
    }

    /// The `n`th item in child order, loading its child if needed. Does not
    /// consolidate, so on an unmerged itemset positions are not sorted.
    pub fn get_item<S>(&mut self, n: usize, store: &mut S) -> anyhow::Result<&I>
    where
        S: ItemSetStore<K, I>,
    {
        if n >= self.total {
            bail!("item index {} out of range for itemset of {}", n, self.total);
        }
        let mut offset = n;
        let mut found = None;
        for (i, child) in self.children.iter().enumerate() {
            if offset < child.len {
                found = Some(i);
                break;
            }
            offset -= child.len;
        }
        match found {
            Some(i) => {
                let loaded = self.ensure_loaded(i, store)?;
                store.add_to_size_delta(0, loaded);
                match &self.children[i].slot {
                    ChildSlot::Loaded(data) => Ok(&data[offset]),
                    ChildSlot::Unloaded => unreachable!("child {} was just loaded", i),
                }
            }
            None => Ok(&self.items[offset]),
        }
    }

    /// All items, children first, then the work buffer.
    pub fn item_vec<S>(&mut self, store: &mut S) -> anyhow::Result<Vec<I>>
    where
        S: ItemSetStore<K, I>,
    {
        let mut loaded = 0;
        for i in 0..self.children.len() {
            loaded += self.ensure_loaded(i, store)?;
        }
        store.add_to_size_delta(0, loaded);

        let mut result = Vec::new();
        reserve(&mut result, self.total)?;
        for child in &self.children {
            if let ChildSlot::Loaded(data) = &child.slot {
                result.extend_from_slice(data);
            }
        }
        result.extend_from_slice(&self.items);
        Ok(result)
    }

    /// Appends every item of `other`, which lives in a different store.
    pub fn append_item_set<S, T>(
        &mut self,
        other: &mut ItemSet<K, I>,
        other_store: &mut T,
        store: &mut S,
    ) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
        T: ItemSetStore<K, I>,
    {
        let items = other.item_vec(other_store)?;
        self.add_item_vec(items, store)
    }

    /// Drops every item and frees all child blobs.
    pub fn clear<S>(&mut self, store: &mut S) -> anyhow::Result<()>
    where
        S: ItemSetStore<K, I>,
    {
        let old = self.variable_mem();
        for child in self.children.drain(..) {
            store.delete_child(child.ptr)?;
        }
        self.children.shrink_to_fit();
        self.items = Vec::new();
        self.deletes = Vec::new();
        self.total = 0;
        self.merged = true;
        self.dirty = true;
        store.add_to_size_delta(old, self.variable_mem());
        Ok(())
    }
}

impl<K, I> ItemSet<K, I>
where
    K: Encode,
    I: Clone + Encode,
{
    /// Consolidates, writes back modified children and returns the encoded
    /// itemset. The itemset is clean afterwards.
    pub fn save<S>(&mut self, store: &mut S) -> anyhow::Result<Vec<u8>>
    where
        S: ItemSetStore<K, I>,
    {
        self.consolidate(store)?;
        for child in self.children.iter_mut() {
            if !child.dirty {
                continue;
            }
            if let ChildSlot::Loaded(data) = &child.slot {
                child.ptr = store.store_child(child.ptr, data)?;
            }
            child.dirty = false;
        }

        let mut w = BlobWriter::new();
        self.key.write_bytes(&mut w);
        self.items.write_bytes(&mut w);
        self.children.len().write_bytes(&mut w);
        for child in &self.children {
            child.min.write_bytes(&mut w);
            child.max.write_bytes(&mut w);
            child.len.write_bytes(&mut w);
            child.ptr.0.write_bytes(&mut w);
        }
        self.dirty = false;
        Ok(w.into_inner())
    }
}

impl<K, I> ItemSet<K, I>
where
    K: Decode,
    I: Clone + Decode,
{
    /// Decodes a saved itemset. Children start out unloaded.
    pub fn load(buf: &[u8]) -> anyhow::Result<Self> {
        let mut r = BlobReader::new(buf);
        let key = K::decode(&mut r)?;
        let items = Vec::<I>::decode(&mut r)?;
        let n = usize::decode(&mut r)?;
        let mut children = Vec::new();
        for _ in 0..n {
            children.push(Child {
                min: I::decode(&mut r)?,
                max: I::decode(&mut r)?,
                len: usize::decode(&mut r)?,
                ptr: BlobPtr(u64::decode(&mut r)?),
                dirty: false,
                slot: ChildSlot::Unloaded,
            });
        }
        if !r.is_empty() {
            bail!("trailing bytes after itemset");
        }
        let mut result = ItemSet {
            key,
            items,
            deletes: Vec::new(),
            children,
            total: 0,
            merged: true,
            dirty: false,
        };
        result.recalc_total();
        Ok(result)
    }
}
