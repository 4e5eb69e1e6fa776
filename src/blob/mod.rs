use std::collections::{BTreeMap, HashSet};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::{error::GixError, fs::DbFile};

/// Location of a record in the blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobPtr(pub u64);

pub trait BlobStore {
    /// Stores a new record.
    fn put(&mut self, data: &[u8]) -> anyhow::Result<BlobPtr>;
    /// Replaces the record at `ptr`. The new contents may live elsewhere;
    /// the returned pointer is where they are.
    fn put_at(&mut self, ptr: BlobPtr, data: &[u8]) -> anyhow::Result<BlobPtr>;
    fn get(&mut self, ptr: BlobPtr) -> anyhow::Result<Vec<u8>>;
    fn delete(&mut self, ptr: BlobPtr) -> anyhow::Result<()>;
    fn sync(&mut self) -> anyhow::Result<()>;
    /// Makes the space of records replaced or deleted since the previous
    /// checkpoint reusable. Must only be called once metadata that no longer
    /// references them is durable.
    fn checkpoint(&mut self) -> anyhow::Result<()>;
    fn stats(&self) -> &BlobStats;
    fn reset_stats(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobStats {
    pub puts: u64,
    pub puts_new: u64,
    pub gets: u64,
    pub dels: u64,
    /// Number of `put_at` calls that moved the record to another size class.
    pub size_changes: u64,
    pub bytes_put: u64,
    pub bytes_got: u64,
}

/// Allocator state that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub end: u64,
    pub free: Vec<(BlobPtr, u32)>,
}

const HEADER_LEN: u64 = 12;
const MIN_CAPACITY: u32 = 16;
// Stored in the length field of released records.
const FREE_MARK: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Header {
    cap: u32,
    len: u32,
    crc: u32,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_LEN as usize] {
        let mut result = [0; HEADER_LEN as usize];
        result[0..4].copy_from_slice(&self.cap.to_le_bytes());
        result[4..8].copy_from_slice(&self.len.to_le_bytes());
        result[8..12].copy_from_slice(&self.crc.to_le_bytes());
        result
    }

    fn from_bytes(buf: &[u8; HEADER_LEN as usize]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Header {
            cap: word(0),
            len: word(4),
            crc: word(8),
        }
    }
}

fn capacity_for(len: usize) -> anyhow::Result<u32> {
    let cap = len.max(MIN_CAPACITY as usize).next_power_of_two();
    if cap > u32::MAX as usize / 2 {
        bail!("blob of {} bytes is too large", len);
    }
    Ok(cap as u32)
}

/// Blob store over a single file of `[capacity][len][crc32][payload]`
/// records. Capacities are powers of two so released records can be reused
/// by any later record of the same size class.
///
/// Records written before the last checkpoint are never overwritten: the
/// metadata saved at that checkpoint may still point at them. Replacing one
/// writes a new record, and its old slot only becomes free at the next
/// checkpoint.
#[derive(Debug)]
pub struct FileBlobStore<F: DbFile> {
    file: F,
    end: u64,
    free: BTreeMap<u32, Vec<BlobPtr>>,
    // Written since the last checkpoint; safe to overwrite or release.
    fresh: HashSet<BlobPtr>,
    // Superseded, released at the next checkpoint. Pointer to capacity.
    pending: BTreeMap<BlobPtr, u32>,
    stats: BlobStats,
}

impl<F: DbFile> FileBlobStore<F> {
    pub fn create(file: F) -> Self {
        FileBlobStore {
            file,
            end: 0,
            free: BTreeMap::new(),
            fresh: HashSet::new(),
            pending: BTreeMap::new(),
            stats: BlobStats::default(),
        }
    }

    pub fn open(file: F, meta: BlobMeta) -> Self {
        let mut free: BTreeMap<u32, Vec<BlobPtr>> = BTreeMap::new();
        for (ptr, cap) in meta.free {
            free.entry(cap).or_default().push(ptr);
        }
        FileBlobStore {
            file,
            end: meta.end,
            free,
            fresh: HashSet::new(),
            pending: BTreeMap::new(),
            stats: BlobStats::default(),
        }
    }

    /// Rebuilds the allocator state by walking every record header, for
    /// files whose saved metadata may be stale.
    pub fn restore(mut file: F) -> anyhow::Result<Self> {
        let file_len = file.len()?;
        let mut free: BTreeMap<u32, Vec<BlobPtr>> = BTreeMap::new();
        let mut at = 0;
        while at + HEADER_LEN <= file_len {
            let mut buf = [0; HEADER_LEN as usize];
            file.read_at(at, &mut buf)?;
            let header = Header::from_bytes(&buf);
            if header.cap < MIN_CAPACITY || !header.cap.is_power_of_two() {
                // A torn append; nothing after it is reachable.
                tracing::warn!(offset = at, "blob scan stopped at invalid header");
                break;
            }
            if header.len == FREE_MARK {
                free.entry(header.cap).or_default().push(BlobPtr(at));
            }
            at += HEADER_LEN + header.cap as u64;
        }
        tracing::debug!(end = at, "restored blob allocator");
        Ok(FileBlobStore {
            file,
            end: at,
            free,
            fresh: HashSet::new(),
            pending: BTreeMap::new(),
            stats: BlobStats::default(),
        })
    }

    /// Allocator state to save alongside metadata written now. Pending
    /// records count as free, since that metadata no longer references them.
    pub fn meta(&self) -> BlobMeta {
        BlobMeta {
            end: self.end,
            free: self
                .free
                .iter()
                .flat_map(|(cap, ptrs)| ptrs.iter().map(move |ptr| (*ptr, *cap)))
                .chain(self.pending.iter().map(|(ptr, cap)| (*ptr, *cap)))
                .collect(),
        }
    }

    fn read_header(&mut self, ptr: BlobPtr) -> anyhow::Result<Header> {
        if ptr.0 + HEADER_LEN > self.end {
            return Err(GixError::corrupt(ptr, "pointer past end of blob file").into());
        }
        let mut buf = [0; HEADER_LEN as usize];
        self.file.read_at(ptr.0, &mut buf)?;
        let header = Header::from_bytes(&buf);
        if header.len == FREE_MARK || self.pending.contains_key(&ptr) {
            return Err(GixError::corrupt(ptr, "record was released").into());
        }
        if header.len > header.cap || ptr.0 + HEADER_LEN + header.cap as u64 > self.end {
            return Err(GixError::corrupt(ptr, "record header out of bounds").into());
        }
        Ok(header)
    }

    fn write_record(
        &mut self,
        ptr: BlobPtr,
        cap: u32,
        data: &[u8],
        pad: bool,
    ) -> anyhow::Result<()> {
        let header = Header {
            cap,
            len: data.len() as u32,
            crc: crc32fast::hash(data),
        };
        let mut buf = Vec::with_capacity(HEADER_LEN as usize + cap as usize);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(data);
        if pad {
            buf.resize(HEADER_LEN as usize + cap as usize, 0);
        }
        self.file.write_at(ptr.0, &buf)?;
        self.stats.bytes_put += data.len() as u64;
        Ok(())
    }

    fn allocate(&mut self, cap: u32) -> (BlobPtr, bool) {
        let reused = self.free.get_mut(&cap).and_then(|ptrs| ptrs.pop());
        if self.free.get(&cap).map_or(false, |ptrs| ptrs.is_empty()) {
            self.free.remove(&cap);
        }
        let (ptr, appended) = match reused {
            Some(ptr) => (ptr, false),
            None => {
                let ptr = BlobPtr(self.end);
                self.end += HEADER_LEN + cap as u64;
                (ptr, true)
            }
        };
        self.fresh.insert(ptr);
        (ptr, appended)
    }

    fn write_new(&mut self, data: &[u8]) -> anyhow::Result<BlobPtr> {
        let cap = capacity_for(data.len())?;
        let (ptr, appended) = self.allocate(cap);
        // Appended records are padded so the file always ends on a record
        // boundary.
        self.write_record(ptr, cap, data, appended)?;
        Ok(ptr)
    }

    fn release(&mut self, ptr: BlobPtr, cap: u32) -> anyhow::Result<()> {
        let released = Header {
            cap,
            len: FREE_MARK,
            crc: 0,
        };
        self.file.write_at(ptr.0, &released.to_bytes())?;
        self.free.entry(cap).or_default().push(ptr);
        Ok(())
    }

    /// Frees `ptr` now if no saved metadata can reference it, otherwise at
    /// the next checkpoint.
    fn retire(&mut self, ptr: BlobPtr, cap: u32) -> anyhow::Result<()> {
        if self.fresh.remove(&ptr) {
            self.release(ptr, cap)
        } else {
            self.pending.insert(ptr, cap);
            Ok(())
        }
    }
}

impl<F: DbFile> BlobStore for FileBlobStore<F> {
    fn put(&mut self, data: &[u8]) -> anyhow::Result<BlobPtr> {
        let ptr = self.write_new(data)?;
        self.stats.puts_new += 1;
        Ok(ptr)
    }

    fn put_at(&mut self, ptr: BlobPtr, data: &[u8]) -> anyhow::Result<BlobPtr> {
        let header = self.read_header(ptr)?;
        self.stats.puts += 1;
        if data.len() <= header.cap as usize && self.fresh.contains(&ptr) {
            self.write_record(ptr, header.cap, data, false)?;
            return Ok(ptr);
        }
        if capacity_for(data.len())? != header.cap {
            self.stats.size_changes += 1;
        }
        // Written before the replacement is retired, so a released slot of
        // the same size is never the one being replaced.
        let new_ptr = self.write_new(data)?;
        self.retire(ptr, header.cap)?;
        Ok(new_ptr)
    }

    fn get(&mut self, ptr: BlobPtr) -> anyhow::Result<Vec<u8>> {
        let header = self.read_header(ptr)?;
        let mut data = vec![0; header.len as usize];
        self.file.read_at(ptr.0 + HEADER_LEN, &mut data)?;
        if crc32fast::hash(&data) != header.crc {
            return Err(GixError::corrupt(ptr, "checksum mismatch").into());
        }
        self.stats.gets += 1;
        self.stats.bytes_got += data.len() as u64;
        Ok(data)
    }

    fn delete(&mut self, ptr: BlobPtr) -> anyhow::Result<()> {
        let header = self.read_header(ptr)?;
        self.retire(ptr, header.cap)?;
        self.stats.dels += 1;
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.file.sync()
    }

    fn checkpoint(&mut self) -> anyhow::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let released = pending.len();
        for (ptr, cap) in pending {
            self.release(ptr, cap)?;
        }
        self.fresh.clear();
        tracing::debug!(released, "blob checkpoint");
        Ok(())
    }

    fn stats(&self) -> &BlobStats {
        &self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = BlobStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DbDir, MockDir, MockFile};

    fn new_store() -> (MockDir, FileBlobStore<MockFile>) {
        let mut dir = MockDir::new();
        let file = dir.create(&"gix.blob").unwrap().unwrap();
        (dir, FileBlobStore::create(file))
    }

    #[test]
    fn test_put_get() -> anyhow::Result<()> {
        let (_dir, mut store) = new_store();
        let a = store.put(b"hello")?;
        let b = store.put(&[7; 100])?;
        assert_eq!(a, BlobPtr(0));
        assert_eq!(b, BlobPtr(HEADER_LEN + 16));
        assert_eq!(store.get(a)?, b"hello".to_vec());
        assert_eq!(store.get(b)?, vec![7; 100]);
        let empty = store.put(&[])?;
        assert_eq!(store.get(empty)?, Vec::<u8>::new());
        assert_eq!(store.stats().puts_new, 3);
        assert_eq!(store.stats().gets, 3);
        Ok(())
    }

    #[test]
    fn test_put_at_in_place_and_relocate() -> anyhow::Result<()> {
        let (_dir, mut store) = new_store();
        let a = store.put(&[1; 20])?;
        let b = store.put(&[2; 20])?;

        assert_eq!(store.put_at(a, &[3; 32])?, a);
        assert_eq!(store.get(a)?, vec![3; 32]);

        let moved = store.put_at(a, &[4; 33])?;
        assert_ne!(moved, a);
        assert_eq!(store.get(moved)?, vec![4; 33]);
        assert_eq!(store.get(b)?, vec![2; 20]);
        assert!(store.get(a).is_err());
        assert_eq!(store.stats().size_changes, 1);

        // The released slot is handed out again.
        assert_eq!(store.put(&[5; 17])?, a);
        Ok(())
    }

    #[test]
    fn test_replace_after_checkpoint() -> anyhow::Result<()> {
        let (_dir, mut store) = new_store();
        let a = store.put(&[1; 20])?;
        let b = store.put(&[2; 20])?;
        store.checkpoint()?;

        // Saved metadata may reference `a`, so it is left alone.
        let a2 = store.put_at(a, &[3; 20])?;
        assert_ne!(a2, a);
        assert_eq!(store.stats().size_changes, 0);
        assert!(store.get(a).is_err());
        assert_eq!(store.meta().free, vec![(a, 32)]);
        let mut raw = vec![0; 20];
        store.file.read_at(a.0 + HEADER_LEN, &mut raw)?;
        assert_eq!(raw, vec![1; 20]);

        // Rewritten in place until the next checkpoint.
        assert_eq!(store.put_at(a2, &[4; 30])?, a2);
        store.delete(b)?;
        assert_eq!(store.put(&[5; 20])?.0, store.meta().end - HEADER_LEN - 32);

        store.checkpoint()?;
        let mut reused = vec![store.put(&[6; 20])?, store.put(&[7; 20])?];
        reused.sort();
        assert_eq!(reused, vec![a, b]);
        assert_eq!(store.get(a2)?, vec![4; 30]);
        Ok(())
    }

    #[test]
    fn test_checksum() -> anyhow::Result<()> {
        let (_dir, mut store) = new_store();
        let a = store.put(b"some payload")?;
        store.file.write_at(HEADER_LEN + 2, b"X")?;
        let err = store.get(a).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GixError>(),
            Some(GixError::Corrupt { .. })
        ));
        assert!(store.get(BlobPtr(10_000)).is_err());
        Ok(())
    }

    #[test]
    fn test_reopen_and_restore() -> anyhow::Result<()> {
        let (mut dir, mut store) = new_store();
        let a = store.put(&[1; 10])?;
        let b = store.put(&[2; 40])?;
        let c = store.put(&[3; 10])?;
        store.delete(b)?;
        let meta = store.meta();
        assert_eq!(meta.free, vec![(b, 64)]);

        let file = dir.open(&"gix.blob")?.unwrap();
        let mut reopened = FileBlobStore::open(file, meta.clone());
        assert_eq!(reopened.get(c)?, vec![3; 10]);

        let file = dir.open(&"gix.blob")?.unwrap();
        let mut restored = FileBlobStore::restore(file)?;
        assert_eq!(restored.meta(), meta);
        assert_eq!(restored.get(a)?, vec![1; 10]);
        assert_eq!(restored.put(&[9; 50])?, b);
        Ok(())
    }
}
