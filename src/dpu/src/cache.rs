//! In-DPU cuckoo cache table.
//!
//! Fixed-size items live in power-of-two many buckets of
//! [`CACHE_BUCKET_SIZE`] elements. Each element can sit in one of two
//! buckets, addressed by two independent hashes of its key; inserts
//! displace cooperatively up to a bounded depth and roll the chain back
//! when the bound is hit, leaving the table untouched.
//!
//! Writers are expected to be serialized externally (the file service owns
//! mutation); readers may run concurrently on other threads. The occupancy
//! flag is a soft lock: a writer stores 1 with `Release` before a
//! structural mutation and 0 after, and a reader that observes 1 skips the
//! bucket and falls through to the alternate one, accepting a spurious
//! miss.

use std::cell::UnsafeCell;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use log::info;
use thiserror::Error;

use crate::params::CACHE_BUCKET_SIZE;

pub const CACHE_VALUE_SIZE: usize = 40;

pub type Key = u64;
pub type HashValue = u32;

/// A key hash function. The two table hashes are injected so callers (and
/// tests) choose the functions; see [`default_hashers`].
pub type KeyHasher = fn(Key) -> HashValue;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheItem {
    pub key: Key,
    pub value: [u8; CACHE_VALUE_SIZE],
}

pub const CACHE_ITEM_SIZE: usize = std::mem::size_of::<CacheItem>();

impl CacheItem {
    pub fn new(key: Key, value: [u8; CACHE_VALUE_SIZE]) -> Self {
        CacheItem { key, value }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache table is full")]
    Full,
    #[error("preload file is not a whole number of items ({0} trailing bytes)")]
    ShortRead(usize),
    #[error("preload I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy)]
struct Element {
    hash1: HashValue,
    hash2: HashValue,
    item: CacheItem,
}

const EMPTY_ELEMENT: Element = Element {
    hash1: 0,
    hash2: 0,
    item: CacheItem {
        key: 0,
        value: [0; CACHE_VALUE_SIZE],
    },
};

#[repr(align(64))]
struct Bucket {
    /// Bucket-granularity occupancy flag; with `occ-item` the flags move
    /// into `elem_occ` instead.
    #[cfg(not(feature = "occ-item"))]
    occ: AtomicU8,
    #[cfg(feature = "occ-item")]
    elem_occ: [AtomicU8; CACHE_BUCKET_SIZE],
    /// Stamps mirror `elements[i].hash1`; zero marks an empty slot.
    stamps: UnsafeCell<[HashValue; CACHE_BUCKET_SIZE]>,
    elements: UnsafeCell<[Element; CACHE_BUCKET_SIZE]>,
}

unsafe impl Sync for Bucket {}

impl Bucket {
    fn new() -> Self {
        Bucket {
            #[cfg(not(feature = "occ-item"))]
            occ: AtomicU8::new(0),
            #[cfg(feature = "occ-item")]
            elem_occ: Default::default(),
            stamps: UnsafeCell::new([0; CACHE_BUCKET_SIZE]),
            elements: UnsafeCell::new([EMPTY_ELEMENT; CACHE_BUCKET_SIZE]),
        }
    }

    #[cfg(not(feature = "occ-item"))]
    #[inline]
    fn lock(&self) {
        self.occ.store(1, Ordering::Release);
    }
    #[cfg(feature = "occ-item")]
    #[inline]
    fn lock(&self) {}

    #[cfg(not(feature = "occ-item"))]
    #[inline]
    fn unlock(&self) {
        self.occ.store(0, Ordering::Release);
    }
    #[cfg(feature = "occ-item")]
    #[inline]
    fn unlock(&self) {}

    #[cfg(not(feature = "occ-item"))]
    #[inline]
    fn is_locked(&self) -> bool {
        self.occ.load(Ordering::Acquire) != 0
    }
    #[cfg(feature = "occ-item")]
    #[inline]
    fn is_locked(&self) -> bool {
        false
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn stamps_mut(&self) -> &mut [HashValue; CACHE_BUCKET_SIZE] {
        &mut *self.stamps.get()
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn elements_mut(&self) -> &mut [Element; CACHE_BUCKET_SIZE] {
        &mut *self.elements.get()
    }
}

pub struct CacheTable {
    buckets: Box<[Bucket]>,
    mask: u32,
    bucket_count_power: u32,
    hash1: KeyHasher,
    hash2: KeyHasher,
}

/// The stock hash pair: FNV-1a and aHash with fixed keys. Both are
/// normalized to nonzero so they never collide with the empty stamp.
pub fn default_hashers() -> (KeyHasher, KeyHasher) {
    (hash_fnv, hash_ahash)
}

fn nonzero(h: u64) -> HashValue {
    let h = h as HashValue;
    if h == 0 {
        !0
    } else {
        h
    }
}

fn hash_fnv(key: Key) -> HashValue {
    use std::hash::Hasher;
    let mut h = fnv::FnvHasher::default();
    h.write_u64(key);
    nonzero(h.finish())
}

fn hash_ahash(key: Key) -> HashValue {
    use std::hash::{BuildHasher, Hasher};
    let state = ahash::RandomState::with_seeds(0x2d35, 0x8c45, 0x1f0b, 0x6a97);
    let mut h = state.build_hasher();
    h.write_u64(key);
    nonzero(h.finish())
}

impl CacheTable {
    /// Creates a table with `1 << bucket_count_power` buckets.
    pub fn new(bucket_count_power: u32, hashers: (KeyHasher, KeyHasher)) -> Self {
        let count = 1usize << bucket_count_power;
        let buckets: Vec<Bucket> = (0..count).map(|_| Bucket::new()).collect();
        CacheTable {
            buckets: buckets.into_boxed_slice(),
            mask: (count - 1) as u32,
            bucket_count_power,
            hash1: hashers.0,
            hash2: hashers.1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len() * CACHE_BUCKET_SIZE
    }

    fn hashes_of(&self, key: Key) -> (HashValue, HashValue) {
        let h1 = (self.hash1)(key);
        let mut h2 = (self.hash2)(key);
        if h1 == h2 {
            h2 = !h1;
        }
        (h1, h2)
    }

    fn max_depth(&self) -> usize {
        ((self.bucket_count_power as usize) << 2).min(self.capacity())
    }

    /// Inserts or updates an item. On `CacheError::Full` the table is left
    /// exactly as it was before the call.
    pub fn insert(&self, item: &CacheItem) -> Result<(), CacheError> {
        let (h1, h2) = self.hashes_of(item.key);
        let mut carrier = Element {
            hash1: h1,
            hash2: h2,
            item: *item,
        };

        let max_depth = self.max_depth();
        let mut offset = 0usize;

        for _depth in 0..max_depth {
            let bucket = &self.buckets[(carrier.hash1 & self.mask) as usize];
            bucket.lock();
            let stamps = unsafe { bucket.stamps_mut() };
            let elements = unsafe { bucket.elements_mut() };

            for e in 0..CACHE_BUCKET_SIZE {
                if stamps[e] == 0 {
                    self.lock_element(bucket, e);
                    elements[e] = carrier;
                    stamps[e] = carrier.hash1;
                    self.unlock_element(bucket, e);
                    bucket.unlock();
                    return Ok(());
                } else if stamps[e] == carrier.hash1 && elements[e].item.key == carrier.item.key {
                    // Idempotent update in place.
                    self.lock_element(bucket, e);
                    elements[e].item = carrier.item;
                    self.unlock_element(bucket, e);
                    bucket.unlock();
                    return Ok(());
                }
            }

            // Bucket full: evict a round-robin victim and carry it on,
            // oriented at its alternate bucket.
            self.lock_element(bucket, offset);
            let mut victim = elements[offset];
            elements[offset] = carrier;
            stamps[offset] = carrier.hash1;
            self.unlock_element(bucket, offset);
            std::mem::swap(&mut victim.hash1, &mut victim.hash2);
            carrier = victim;

            offset = (offset + 1) % CACHE_BUCKET_SIZE;
            bucket.unlock();
        }

        // Depth bound hit: walk the displacement chain backwards. Each
        // step restores the carried element's original orientation and
        // puts it back where it was evicted from; the final displaced
        // element is the item we failed to insert.
        for _depth in 0..max_depth {
            let bucket = &self.buckets[(carrier.hash2 & self.mask) as usize];
            offset = if offset == 0 {
                CACHE_BUCKET_SIZE - 1
            } else {
                offset - 1
            };

            bucket.lock();
            std::mem::swap(&mut carrier.hash1, &mut carrier.hash2);
            let stamps = unsafe { bucket.stamps_mut() };
            let elements = unsafe { bucket.elements_mut() };
            self.lock_element(bucket, offset);
            // The displaced element comes back out already oriented at its
            // eviction origin (hash2), so its hashes are not swapped here.
            let victim = elements[offset];
            elements[offset] = carrier;
            stamps[offset] = carrier.hash1;
            self.unlock_element(bucket, offset);
            carrier = victim;
            bucket.unlock();
        }

        debug_assert_eq!(carrier.item, *item);
        Err(CacheError::Full)
    }

    /// Looks up a key, copying the item out. A bucket mid-mutation is
    /// skipped in favor of the alternate bucket.
    pub fn lookup(&self, key: Key) -> Option<CacheItem> {
        let (h1, h2) = self.hashes_of(key);

        if let Some(item) = self.scan_bucket(h1, key) {
            return Some(item);
        }
        self.scan_bucket(h2, key)
    }

    fn scan_bucket(&self, hash: HashValue, key: Key) -> Option<CacheItem> {
        let bucket = &self.buckets[(hash & self.mask) as usize];
        if bucket.is_locked() {
            return None;
        }
        let stamps = unsafe { &*bucket.stamps.get() };
        let elements = unsafe { &*bucket.elements.get() };
        for e in 0..CACHE_BUCKET_SIZE {
            if stamps[e] == hash {
                if self.element_locked(bucket, e) {
                    continue;
                }
                if elements[e].item.key == key {
                    return Some(elements[e].item);
                }
            }
        }
        None
    }

    /// Deletes a key if present, zeroing both the stamp and the element.
    pub fn delete(&self, key: Key) {
        let (h1, h2) = self.hashes_of(key);
        if self.delete_from_bucket(h1, key) {
            return;
        }
        self.delete_from_bucket(h2, key);
    }

    fn delete_from_bucket(&self, hash: HashValue, key: Key) -> bool {
        let bucket = &self.buckets[(hash & self.mask) as usize];
        bucket.lock();
        let stamps = unsafe { bucket.stamps_mut() };
        let elements = unsafe { bucket.elements_mut() };
        let mut deleted = false;
        for e in 0..CACHE_BUCKET_SIZE {
            if stamps[e] == hash && elements[e].item.key == key {
                self.lock_element(bucket, e);
                elements[e] = EMPTY_ELEMENT;
                stamps[e] = 0;
                self.unlock_element(bucket, e);
                deleted = true;
                break;
            }
        }
        bucket.unlock();
        deleted
    }

    /// Best-effort preload from a packed file of [`CacheItem`] records.
    /// A trailing partial item is an error; a full table stops the load.
    pub fn preload<P: AsRef<Path>>(&self, path: P) -> Result<usize, CacheError> {
        let mut file = File::open(path)?;
        let mut chunk = vec![0u8; CACHE_ITEM_SIZE * 1000];
        let mut total = 0usize;
        loop {
            let n = read_full(&mut file, &mut chunk)?;
            if n == 0 {
                break;
            }
            if n % CACHE_ITEM_SIZE != 0 {
                return Err(CacheError::ShortRead(n % CACHE_ITEM_SIZE));
            }
            for raw in chunk[..n].chunks_exact(CACHE_ITEM_SIZE) {
                let item = unsafe { std::ptr::read_unaligned(raw.as_ptr().cast::<CacheItem>()) };
                self.insert(&item)?;
                total += 1;
            }
            if n < chunk.len() {
                break;
            }
        }
        info!("cache table preloaded with {} items", total);
        Ok(total)
    }

    #[cfg(not(feature = "occ-item"))]
    #[inline]
    fn lock_element(&self, _bucket: &Bucket, _e: usize) {}
    #[cfg(not(feature = "occ-item"))]
    #[inline]
    fn unlock_element(&self, _bucket: &Bucket, _e: usize) {}
    #[cfg(not(feature = "occ-item"))]
    #[inline]
    fn element_locked(&self, _bucket: &Bucket, _e: usize) -> bool {
        false
    }

    #[cfg(feature = "occ-item")]
    #[inline]
    fn lock_element(&self, bucket: &Bucket, e: usize) {
        bucket.elem_occ[e].store(1, Ordering::Release);
    }
    #[cfg(feature = "occ-item")]
    #[inline]
    fn unlock_element(&self, bucket: &Bucket, e: usize) {
        bucket.elem_occ[e].store(0, Ordering::Release);
    }
    #[cfg(feature = "occ-item")]
    #[inline]
    fn element_locked(&self, bucket: &Bucket, e: usize) -> bool {
        bucket.elem_occ[e].load(Ordering::Acquire) != 0
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            let stamps = unsafe { &*bucket.stamps.get() };
            let elements = unsafe { &*bucket.elements.get() };
            for e in 0..CACHE_BUCKET_SIZE {
                out.extend_from_slice(&stamps[e].to_le_bytes());
                out.extend_from_slice(&elements[e].hash1.to_le_bytes());
                out.extend_from_slice(&elements[e].hash2.to_le_bytes());
                out.extend_from_slice(&elements[e].item.key.to_le_bytes());
                out.extend_from_slice(&elements[e].item.value);
            }
        }
        out
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn value_of(byte: u8) -> [u8; CACHE_VALUE_SIZE] {
        [byte; CACHE_VALUE_SIZE]
    }

    #[test]
    fn insert_then_lookup() {
        let table = CacheTable::new(4, default_hashers());
        table.insert(&CacheItem::new(17, value_of(3))).unwrap();
        assert_eq!(table.lookup(17).unwrap().value, value_of(3));
        assert!(table.lookup(18).is_none());
    }

    #[test]
    fn insert_same_key_updates_value() {
        let table = CacheTable::new(4, default_hashers());
        table.insert(&CacheItem::new(5, value_of(1))).unwrap();
        table.insert(&CacheItem::new(5, value_of(2))).unwrap();
        assert_eq!(table.lookup(5).unwrap().value, value_of(2));
    }

    #[test]
    fn delete_removes_key() {
        let table = CacheTable::new(4, default_hashers());
        table.insert(&CacheItem::new(9, value_of(9))).unwrap();
        table.delete(9);
        assert!(table.lookup(9).is_none());
        // deleting again is a no-op
        table.delete(9);
    }

    /// Degenerate hashes pin every key to the same two buckets, so
    /// 2 * CACHE_BUCKET_SIZE + 1 inserts must fail and roll back.
    #[test]
    fn failed_insert_restores_table_bitwise() {
        fn fixed1(_k: Key) -> HashValue {
            1
        }
        fn fixed2(_k: Key) -> HashValue {
            2
        }
        let table = CacheTable::new(4, (fixed1, fixed2));

        for k in 0..(2 * CACHE_BUCKET_SIZE as Key) {
            table.insert(&CacheItem::new(k, value_of(k as u8))).unwrap();
        }

        let before = table.snapshot();
        let overflow = CacheItem::new(1000, value_of(0xFF));
        assert!(matches!(table.insert(&overflow), Err(CacheError::Full)));
        assert_eq!(before, table.snapshot());

        // everything inserted before the failure is still there
        for k in 0..(2 * CACHE_BUCKET_SIZE as Key) {
            assert_eq!(table.lookup(k).unwrap().value, value_of(k as u8));
        }
    }

    #[test]
    fn displacement_keeps_items_reachable() {
        let table = CacheTable::new(6, default_hashers());
        let n = (table.capacity() * 3 / 4) as Key;
        for k in 0..n {
            table.insert(&CacheItem::new(k, value_of((k % 251) as u8))).unwrap();
        }
        for k in 0..n {
            assert_eq!(table.lookup(k).unwrap().value, value_of((k % 251) as u8));
        }
    }

    #[test]
    fn randomized_stress_high_load() {
        let mut rng = StdRng::seed_from_u64(0xD5);
        let table = CacheTable::new(10, default_hashers());
        let capacity = table.capacity();

        let mut ok = 0usize;
        let mut inserted = Vec::new();
        for _ in 0..capacity {
            let key: Key = rng.gen();
            let item = CacheItem::new(key, value_of((key % 256) as u8));
            if table.insert(&item).is_ok() {
                ok += 1;
                inserted.push(key);
            }
        }
        assert!(
            ok * 100 >= capacity * 99,
            "only {}/{} insertions succeeded",
            ok,
            capacity
        );

        for &key in inserted.iter() {
            assert!(table.lookup(key).is_some());
        }
    }
}
