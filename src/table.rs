// src/table.rs
//! Pool-allocated intrusive hash table.
//!
//! An open-chaining table whose header, slot array and entries all live in
//! pool memory, so the table is reclaimed wholesale with its pool and never
//! frees anything individually — deleted entries are recycled through an
//! internal freelist. Every pool uses one lazily for its userdata
//! dictionary; the type is public because it is just as useful for callers
//! building registries inside a pool.
//!
//! The default hash is the classic multiply-by-33 byte hash, seeded per
//! table from the wall clock and a few live addresses so chain shapes are
//! not predictable across runs. `copy` preserves the seed, which keeps
//! stored hashes stable across clones.
//!
//! Keys are **borrowed**: the table stores the caller's pointer and length
//! and never copies key bytes. That is what makes
//! [`HashTable::set`] `unsafe` — see the per-method contracts.
//! [`Pool::userdata_set`](crate::Pool::userdata_set) duplicates keys into
//! the pool before inserting and is the safe way in.

use std::ptr::{NonNull, null_mut};

use crate::error::{PoolError, Result};
use crate::pool::{Pool, PoolInner, pool_palloc};

/// A user-supplied hash function over raw key bytes.
pub type HashFunc = fn(&[u8]) -> u32;

/// Collision combiner for [`HashTable::merge_with`]: receives the pool the
/// result lives in, the key, the overlay's value, the base table's value
/// and the caller's context pointer; returns the value to keep.
pub type MergeFn = fn(Pool, &[u8], NonNull<u8>, NonNull<u8>, *const ()) -> NonNull<u8>;

#[repr(C)]
pub(crate) struct HashEntry {
    next: *mut HashEntry,
    hash: u32,
    key: *const u8,
    klen: usize,
    val: *const u8,
}

pub(crate) struct HashIndex {
    ht: *mut HashTableInner,
    this: *mut HashEntry,
    next: *mut HashEntry,
    index: u32,
}

pub(crate) struct HashTableInner {
    pool: *mut PoolInner,
    array: *mut *mut HashEntry,
    /// Embedded cursor for iterations that do not supply a pool.
    iterator: HashIndex,
    count: u32,
    /// Slot mask; the array holds `max + 1` chains and `max` is `2^n - 1`.
    max: u32,
    seed: u32,
    hash_func: Option<HashFunc>,
    /// Recycled entry headers.
    free: *mut HashEntry,
}

/// The multiply-by-33 byte hash with an explicit start value.
#[inline]
fn hash_seeded(key: &[u8], seed: u32) -> u32 {
    let mut hash = seed;
    for b in key {
        hash = hash.wrapping_mul(33).wrapping_add(*b as u32);
    }
    hash
}

/// The unseeded default hash, exposed for callers that want the same
/// distribution outside a table.
pub fn default_hash(key: &[u8]) -> u32 {
    hash_seeded(key, 0)
}

unsafe fn alloc_array(ht: *mut HashTableInner, max: u32) -> Option<*mut *mut HashEntry> {
    unsafe {
        let pool = Pool::from_raw((*ht).pool).unwrap();
        pool.calloc(max as usize + 1, size_of::<*mut HashEntry>())
            .ok()
            .map(|p| p.as_ptr() as *mut *mut HashEntry)
    }
}

pub(crate) unsafe fn raw_make(pool: *mut PoolInner) -> Result<*mut HashTableInner> {
    unsafe {
        let ht = pool_palloc(pool, size_of::<HashTableInner>())
            .ok_or(PoolError::OutOfMemory)?
            .as_ptr() as *mut HashTableInner;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let stack_probe = 0u8;
        let seed = ((now >> 32) as u32)
            ^ (now as u32)
            ^ (pool as usize as u32)
            ^ (ht as usize as u32)
            ^ (&stack_probe as *const u8 as usize as u32);

        std::ptr::write(
            ht,
            HashTableInner {
                pool,
                array: null_mut(),
                iterator: HashIndex {
                    ht,
                    this: null_mut(),
                    next: null_mut(),
                    index: 0,
                },
                count: 0,
                max: crate::config::INITIAL_HASH_MAX,
                seed: seed.wrapping_sub(1),
                hash_func: None,
                free: null_mut(),
            },
        );
        (*ht).array = alloc_array(ht, (*ht).max).ok_or(PoolError::OutOfMemory)?;
        Ok(ht)
    }
}

#[inline]
unsafe fn entry_hash(ht: *mut HashTableInner, key: &[u8]) -> u32 {
    unsafe {
        match (*ht).hash_func {
            Some(f) => f(key),
            None => hash_seeded(key, (*ht).seed),
        }
    }
}

#[inline]
unsafe fn entry_key<'a>(e: *mut HashEntry) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts((*e).key, (*e).klen) }
}

/// Finds the chain slot for `key`. With `val` set, a missing key is
/// inserted on the spot (the entry header comes from the freelist or a
/// fresh pool allocation), mirroring the lookup-or-insert the whole table
/// is built around.
unsafe fn find_entry(
    ht: *mut HashTableInner,
    key: &[u8],
    val: Option<*const u8>,
) -> *mut *mut HashEntry {
    unsafe {
        let hash = entry_hash(ht, key);

        let mut hep: *mut *mut HashEntry = (*ht).array.add((hash & (*ht).max) as usize);
        let mut he = *hep;
        while !he.is_null() {
            if (*he).hash == hash && (*he).klen == key.len() && entry_key(he) == key {
                break;
            }
            hep = &raw mut (*he).next;
            he = *hep;
        }
        if !he.is_null() || val.is_none() {
            return hep;
        }

        // Insert a new entry for non-None values.
        let he: *mut HashEntry = if !(*ht).free.is_null() {
            let he = (*ht).free;
            (*ht).free = (*he).next;
            he
        } else {
            match pool_palloc((*ht).pool, size_of::<HashEntry>()) {
                Some(p) => p.as_ptr() as *mut HashEntry,
                None => return hep,
            }
        };
        (*he).next = null_mut();
        (*he).hash = hash;
        (*he).key = key.as_ptr();
        (*he).klen = key.len();
        (*he).val = val.unwrap();
        *hep = he;
        (*ht).count += 1;
        hep
    }
}

unsafe fn expand_array(ht: *mut HashTableInner) {
    unsafe {
        let new_max = (*ht).max * 2 + 1;
        let Some(new_array) = alloc_array(ht, new_max) else {
            // Out of pool space: keep the old array, chains just get longer.
            return;
        };
        let mut hi = raw_first(ht, null_mut());
        while !hi.is_null() {
            let e = (*hi).this;
            let i = ((*e).hash & new_max) as usize;
            (*e).next = *new_array.add(i);
            *new_array.add(i) = e;
            hi = raw_next(hi);
        }
        (*ht).array = new_array;
        (*ht).max = new_max;
    }
}

pub(crate) unsafe fn raw_get(ht: *mut HashTableInner, key: &[u8]) -> Option<NonNull<u8>> {
    unsafe {
        let he = *find_entry(ht, key, None);
        if he.is_null() {
            None
        } else {
            Some(NonNull::new_unchecked((*he).val as *mut u8))
        }
    }
}

pub(crate) unsafe fn raw_set(ht: *mut HashTableInner, key: &[u8], val: Option<*const u8>) {
    unsafe {
        let hep = find_entry(ht, key, val);
        if !(*hep).is_null() {
            match val {
                None => {
                    // Delete: unlink and recycle the header.
                    let old = *hep;
                    *hep = (*old).next;
                    (*old).next = (*ht).free;
                    (*ht).free = old;
                    (*ht).count -= 1;
                }
                Some(v) => {
                    (*(*hep)).val = v;
                    // Keep the collision rate in check.
                    if (*ht).count > (*ht).max {
                        expand_array(ht);
                    }
                }
            }
        }
        // else: key absent and val was None.
    }
}

unsafe fn raw_next(hi: *mut HashIndex) -> *mut HashIndex {
    unsafe {
        let ht = (*hi).ht;
        (*hi).this = (*hi).next;
        while (*hi).this.is_null() {
            if (*hi).index > (*ht).max {
                return null_mut();
            }
            (*hi).this = *(*ht).array.add((*hi).index as usize);
            (*hi).index += 1;
        }
        (*hi).next = (*(*hi).this).next;
        hi
    }
}

/// Starts an iteration. With a pool the cursor is allocated there;
/// otherwise the table's embedded cursor is reused (one live iteration per
/// table in that mode).
unsafe fn raw_first(ht: *mut HashTableInner, pool: *mut PoolInner) -> *mut HashIndex {
    unsafe {
        let hi: *mut HashIndex = if !pool.is_null() {
            match pool_palloc(pool, size_of::<HashIndex>()) {
                Some(p) => p.as_ptr() as *mut HashIndex,
                None => return null_mut(),
            }
        } else {
            &raw mut (*ht).iterator
        };

        (*hi).ht = ht;
        (*hi).index = 0;
        (*hi).this = null_mut();
        (*hi).next = null_mut();
        raw_next(hi)
    }
}

/// Handle to a pool-allocated hash table.
#[derive(Clone, Copy)]
pub struct HashTable {
    inner: NonNull<HashTableInner>,
}

/// Iteration cursor over a [`HashTable`]; advance with
/// [`HashIter::next`], read with [`HashIter::entry`].
#[derive(Clone, Copy)]
pub struct HashIter {
    idx: NonNull<HashIndex>,
}

impl HashTable {
    /// Allocates an empty table inside `pool` with the default seeded hash.
    pub fn make(pool: Pool) -> Result<HashTable> {
        unsafe {
            let ht = raw_make(pool.as_ptr())?;
            Ok(HashTable {
                inner: NonNull::new_unchecked(ht),
            })
        }
    }

    /// Allocates an empty table using `hash_func` instead of the default.
    pub fn make_with(pool: Pool, hash_func: HashFunc) -> Result<HashTable> {
        let ht = HashTable::make(pool)?;
        unsafe { (*ht.inner.as_ptr()).hash_func = Some(hash_func) };
        Ok(ht)
    }

    /// Looks up `key`.
    pub fn get(&self, key: &[u8]) -> Option<NonNull<u8>> {
        unsafe { raw_get(self.inner.as_ptr(), key) }
    }

    /// Inserts, replaces or (with `None`) deletes the value under `key`.
    /// Replacement only touches the value slot; the key pointer stored at
    /// first insertion stays.
    ///
    /// # Safety
    ///
    /// The table stores `key`'s pointer without copying. On first insertion
    /// of a key, the caller must guarantee the key bytes outlive the table
    /// (pool-allocated or `'static` data both qualify).
    pub unsafe fn set(&self, key: &[u8], val: Option<NonNull<u8>>) {
        unsafe { raw_set(self.inner.as_ptr(), key, val.map(|v| v.as_ptr() as *const u8)) }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        unsafe { (*self.inner.as_ptr()).count as usize }
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every entry (headers are recycled, not freed).
    pub fn clear(&self) {
        unsafe {
            let ht = self.inner.as_ptr();
            let mut hi = raw_first(ht, null_mut());
            while !hi.is_null() {
                let e = (*hi).this;
                let key = entry_key(e);
                hi = raw_next(hi);
                raw_set(ht, key, None);
            }
        }
    }

    /// Clones the table into a single contiguous allocation in `pool`.
    /// Shares key storage with the original and preserves the seed, so
    /// hashes (and therefore chain layout) stay stable.
    pub fn copy(&self, pool: Pool) -> Result<HashTable> {
        unsafe {
            let src = self.inner.as_ptr();
            let slots = (*src).max as usize + 1;
            let total = size_of::<HashTableInner>()
                + size_of::<*mut HashEntry>() * slots
                + size_of::<HashEntry>() * (*src).count as usize;

            let base = pool_palloc(pool.as_ptr(), total)
                .ok_or(PoolError::OutOfMemory)?
                .as_ptr();

            let ht = base as *mut HashTableInner;
            let array = base.add(size_of::<HashTableInner>()) as *mut *mut HashEntry;
            let entries =
                base.add(size_of::<HashTableInner>() + size_of::<*mut HashEntry>() * slots)
                    as *mut HashEntry;

            std::ptr::write(
                ht,
                HashTableInner {
                    pool: pool.as_ptr(),
                    array,
                    iterator: HashIndex {
                        ht,
                        this: null_mut(),
                        next: null_mut(),
                        index: 0,
                    },
                    count: (*src).count,
                    max: (*src).max,
                    seed: (*src).seed,
                    hash_func: (*src).hash_func,
                    free: null_mut(),
                },
            );

            let mut j = 0usize;
            for i in 0..slots {
                let mut slot: *mut *mut HashEntry = array.add(i);
                let mut orig = *(*src).array.add(i);
                while !orig.is_null() {
                    let e = entries.add(j);
                    j += 1;
                    (*e).next = null_mut();
                    (*e).hash = (*orig).hash;
                    (*e).key = (*orig).key;
                    (*e).klen = (*orig).klen;
                    (*e).val = (*orig).val;
                    *slot = e;
                    slot = &raw mut (*e).next;
                    orig = (*orig).next;
                }
                *slot = null_mut();
            }

            Ok(HashTable {
                inner: NonNull::new_unchecked(ht),
            })
        }
    }

    /// Merges `self` and `overlay` into a new table in `pool`; on key
    /// collision the overlay's value wins.
    pub fn merge(&self, pool: Pool, overlay: &HashTable) -> Result<HashTable> {
        self.merge_impl(pool, overlay, None, std::ptr::null())
    }

    /// [`HashTable::merge`] with a combiner deciding collisions.
    pub fn merge_with(
        &self,
        pool: Pool,
        overlay: &HashTable,
        combiner: MergeFn,
        data: *const (),
    ) -> Result<HashTable> {
        self.merge_impl(pool, overlay, Some(combiner), data)
    }

    fn merge_impl(
        &self,
        pool: Pool,
        overlay: &HashTable,
        combiner: Option<MergeFn>,
        data: *const (),
    ) -> Result<HashTable> {
        unsafe {
            let base = self.inner.as_ptr();
            let over = overlay.inner.as_ptr();

            let ht = pool_palloc(pool.as_ptr(), size_of::<HashTableInner>())
                .ok_or(PoolError::OutOfMemory)?
                .as_ptr() as *mut HashTableInner;

            let mut max = (*base).max.max((*over).max);
            if (*base).count + (*over).count > max {
                max = max * 2 + 1;
            }

            std::ptr::write(
                ht,
                HashTableInner {
                    pool: pool.as_ptr(),
                    array: null_mut(),
                    iterator: HashIndex {
                        ht,
                        this: null_mut(),
                        next: null_mut(),
                        index: 0,
                    },
                    count: (*base).count,
                    max,
                    seed: (*base).seed,
                    hash_func: (*base).hash_func,
                    free: null_mut(),
                },
            );
            (*ht).array = alloc_array(ht, max).ok_or(PoolError::OutOfMemory)?;

            let total = ((*base).count + (*over).count) as usize;
            let new_vals: *mut HashEntry = if total > 0 {
                pool_palloc(pool.as_ptr(), size_of::<HashEntry>() * total)
                    .ok_or(PoolError::OutOfMemory)?
                    .as_ptr() as *mut HashEntry
            } else {
                null_mut()
            };

            let mut j = 0usize;
            for k in 0..=(*base).max as usize {
                let mut iter = *(*base).array.add(k);
                while !iter.is_null() {
                    let i = ((*iter).hash & max) as usize;
                    let e = new_vals.add(j);
                    (*e).klen = (*iter).klen;
                    (*e).key = (*iter).key;
                    (*e).val = (*iter).val;
                    (*e).hash = (*iter).hash;
                    (*e).next = *(*ht).array.add(i);
                    *(*ht).array.add(i) = e;
                    j += 1;
                    iter = (*iter).next;
                }
            }

            // Overlay entries rehash under the result's seed: their stored
            // hashes came from the overlay's own seed.
            for k in 0..=(*over).max as usize {
                let mut iter = *(*over).array.add(k);
                while !iter.is_null() {
                    let key = entry_key(iter);
                    let hash = entry_hash(ht, key);
                    let i = (hash & max) as usize;

                    let mut ent = *(*ht).array.add(i);
                    while !ent.is_null() {
                        if (*ent).klen == (*iter).klen && entry_key(ent) == key {
                            (*ent).val = match combiner {
                                Some(f) => f(
                                    pool,
                                    key,
                                    NonNull::new_unchecked((*iter).val as *mut u8),
                                    NonNull::new_unchecked((*ent).val as *mut u8),
                                    data,
                                )
                                .as_ptr() as *const u8,
                                None => (*iter).val,
                            };
                            break;
                        }
                        ent = (*ent).next;
                    }
                    if ent.is_null() {
                        let e = new_vals.add(j);
                        (*e).klen = (*iter).klen;
                        (*e).key = (*iter).key;
                        (*e).val = (*iter).val;
                        (*e).hash = hash;
                        (*e).next = *(*ht).array.add(i);
                        *(*ht).array.add(i) = e;
                        (*ht).count += 1;
                        j += 1;
                    }
                    iter = (*iter).next;
                }
            }

            Ok(HashTable {
                inner: NonNull::new_unchecked(ht),
            })
        }
    }

    /// Starts an iteration. With `pool` the cursor lives there and several
    /// iterations may run at once; with `None` the table's embedded cursor
    /// is reused.
    pub fn first(&self, pool: Option<Pool>) -> Option<HashIter> {
        unsafe {
            let hi = raw_first(
                self.inner.as_ptr(),
                pool.map_or(null_mut(), |p| p.as_ptr()),
            );
            NonNull::new(hi).map(|idx| HashIter { idx })
        }
    }

    /// Calls `f` for every entry until it returns `false`. Returns `true`
    /// iff the scan completed.
    pub fn foreach<F: FnMut(&[u8], NonNull<u8>) -> bool>(&self, mut f: F) -> bool {
        unsafe {
            let mut cursor = HashIndex {
                ht: self.inner.as_ptr(),
                this: null_mut(),
                next: null_mut(),
                index: 0,
            };

            let mut hi = raw_next(&raw mut cursor);
            let mut completed = true;
            while !hi.is_null() {
                let e = (*hi).this;
                if !f(entry_key(e), NonNull::new_unchecked((*e).val as *mut u8)) {
                    completed = false;
                    break;
                }
                hi = raw_next(hi);
            }
            completed
        }
    }
}

impl HashIter {
    /// Advances to the next entry; returns `None` when the table is
    /// exhausted.
    pub fn next(self) -> Option<HashIter> {
        unsafe {
            let hi = raw_next(self.idx.as_ptr());
            NonNull::new(hi).map(|idx| HashIter { idx })
        }
    }

    /// The key and value at the cursor.
    pub fn entry(&self) -> (&[u8], NonNull<u8>) {
        unsafe {
            let e = (*self.idx.as_ptr()).this;
            (entry_key(e), NonNull::new_unchecked((*e).val as *mut u8))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolFlags;
    use std::collections::BTreeMap;

    fn collect(ht: &HashTable) -> BTreeMap<Vec<u8>, usize> {
        let mut out = BTreeMap::new();
        ht.foreach(|key, val| {
            out.insert(key.to_vec(), val.as_ptr() as usize);
            true
        });
        out
    }

    #[test]
    fn test_set_get_replace_delete() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let ht = HashTable::make(pool).unwrap();
        let mut v1 = 1u8;
        let mut v2 = 2u8;

        unsafe {
            ht.set(b"alpha", Some(NonNull::from(&mut v1)));
            ht.set(b"beta", Some(NonNull::from(&mut v2)));
        }
        assert_eq!(ht.len(), 2);
        assert_eq!(ht.get(b"alpha").unwrap().as_ptr(), &raw mut v1);

        unsafe { ht.set(b"alpha", Some(NonNull::from(&mut v2))) };
        assert_eq!(ht.len(), 2);
        assert_eq!(ht.get(b"alpha").unwrap().as_ptr(), &raw mut v2);

        unsafe { ht.set(b"alpha", None) };
        assert_eq!(ht.len(), 1);
        assert!(ht.get(b"alpha").is_none());

        unsafe { pool.destroy() };
    }

    #[test]
    fn test_deleted_headers_recycle() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let ht = HashTable::make(pool).unwrap();
        let mut v = 0u8;

        unsafe {
            ht.set(b"k", Some(NonNull::from(&mut v)));
            ht.set(b"k", None);
            assert!(!(*ht.inner.as_ptr()).free.is_null());
            ht.set(b"k2", Some(NonNull::from(&mut v)));
            assert!((*ht.inner.as_ptr()).free.is_null());
            pool.destroy();
        }
    }

    #[test]
    fn test_growth_keeps_entries_reachable() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let ht = HashTable::make(pool).unwrap();

        // Push well past INITIAL_HASH_MAX to force at least one growth.
        let keys: Vec<String> = (0..64).map(|i| format!("key-{i}")).collect();
        let mut vals: Vec<u8> = (0..64).collect();
        unsafe {
            for (k, v) in keys.iter().zip(vals.iter_mut()) {
                ht.set(k.as_bytes(), Some(NonNull::from(v)));
            }
            assert!((*ht.inner.as_ptr()).max > crate::config::INITIAL_HASH_MAX);
        }

        assert_eq!(ht.len(), 64);
        for (k, v) in keys.iter().zip(vals.iter_mut()) {
            assert_eq!(ht.get(k.as_bytes()).unwrap().as_ptr(), &raw mut *v);
        }
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_custom_hash_function() {
        fn collide_all(_key: &[u8]) -> u32 {
            7
        }

        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let ht = HashTable::make_with(pool, collide_all).unwrap();
        let mut vals: Vec<u8> = (0..8).collect();
        unsafe {
            for (i, v) in vals.iter_mut().enumerate() {
                let key = pool.memdup(format!("c{i}").as_bytes()).unwrap();
                let key = std::slice::from_raw_parts(key.as_ptr(), 2);
                ht.set(key, Some(NonNull::from(v)));
            }
        }
        // All entries share one chain and are still all reachable.
        assert_eq!(ht.len(), 8);
        for (i, v) in vals.iter_mut().enumerate() {
            assert_eq!(
                ht.get(format!("c{i}").as_bytes()).unwrap().as_ptr(),
                &raw mut *v
            );
        }
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_copy_preserves_multiset() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let other = Pool::create(None, PoolFlags::NONE).unwrap();
        let ht = HashTable::make(pool).unwrap();
        let mut vals: Vec<u8> = (0..20).collect();
        unsafe {
            for (i, v) in vals.iter_mut().enumerate() {
                let key = pool.memdup(format!("copy-{i}").as_bytes()).unwrap();
                let key = std::slice::from_raw_parts(key.as_ptr(), format!("copy-{i}").len());
                ht.set(key, Some(NonNull::from(v)));
            }
        }

        let cloned = ht.copy(other).unwrap();
        assert_eq!(collect(&ht), collect(&cloned));
        unsafe {
            other.destroy();
            pool.destroy();
        }
    }

    #[test]
    fn test_merge_overlay_wins() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let a = HashTable::make(pool).unwrap();
        let b = HashTable::make(pool).unwrap();
        let mut base_val = 1u8;
        let mut over_val = 2u8;
        let mut only_a = 3u8;
        let mut only_b = 4u8;

        unsafe {
            a.set(b"shared", Some(NonNull::from(&mut base_val)));
            a.set(b"only-a", Some(NonNull::from(&mut only_a)));
            b.set(b"shared", Some(NonNull::from(&mut over_val)));
            b.set(b"only-b", Some(NonNull::from(&mut only_b)));
        }

        let merged = a.merge(pool, &b).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get(b"shared").unwrap().as_ptr(), &raw mut over_val);
        assert_eq!(merged.get(b"only-a").unwrap().as_ptr(), &raw mut only_a);
        assert_eq!(merged.get(b"only-b").unwrap().as_ptr(), &raw mut only_b);
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_merge_with_combiner() {
        fn keep_base(
            _pool: Pool,
            _key: &[u8],
            _overlay: NonNull<u8>,
            base: NonNull<u8>,
            _data: *const (),
        ) -> NonNull<u8> {
            base
        }

        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let a = HashTable::make(pool).unwrap();
        let b = HashTable::make(pool).unwrap();
        let mut base_val = 1u8;
        let mut over_val = 2u8;

        unsafe {
            a.set(b"k", Some(NonNull::from(&mut base_val)));
            b.set(b"k", Some(NonNull::from(&mut over_val)));
        }

        let merged = a
            .merge_with(pool, &b, keep_base, std::ptr::null())
            .unwrap();
        assert_eq!(merged.get(b"k").unwrap().as_ptr(), &raw mut base_val);
        unsafe { pool.destroy() };
    }

    #[test]
    fn test_iterator_visits_everything_once() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let ht = HashTable::make(pool).unwrap();
        let mut vals: Vec<u8> = (0..10).collect();
        unsafe {
            for (i, v) in vals.iter_mut().enumerate() {
                let key = pool.memdup(format!("it-{i}").as_bytes()).unwrap();
                let key = std::slice::from_raw_parts(key.as_ptr(), format!("it-{i}").len());
                ht.set(key, Some(NonNull::from(v)));
            }
        }

        let mut seen = 0;
        let mut cursor = ht.first(None);
        while let Some(hi) = cursor {
            let (key, _val) = hi.entry();
            assert!(key.starts_with(b"it-"));
            seen += 1;
            cursor = hi.next();
        }
        assert_eq!(seen, 10);

        // foreach early-exit reports an incomplete scan.
        let mut count = 0;
        let completed = ht.foreach(|_, _| {
            count += 1;
            count < 3
        });
        assert!(!completed);
        assert_eq!(count, 3);
        assert!(ht.foreach(|_, _| true));

        unsafe { pool.destroy() };
    }

    #[test]
    fn test_clear_empties_table() {
        let pool = Pool::create(None, PoolFlags::NONE).unwrap();
        let ht = HashTable::make(pool).unwrap();
        let mut v = 9u8;
        unsafe {
            ht.set(b"x", Some(NonNull::from(&mut v)));
            ht.set(b"y", Some(NonNull::from(&mut v)));
        }
        ht.clear();
        assert_eq!(ht.len(), 0);
        assert!(ht.get(b"x").is_none());
        unsafe { pool.destroy() };
    }
}
