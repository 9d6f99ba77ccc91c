use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

/// Thread-safe pool of comparable tokens (vsock CIDs, guest IPs).
///
/// Free tokens live on a LIFO list so recently released ones are handed out
/// first; an in-use set makes membership checks O(1). `try_reserve` and
/// `swap_reserved` exist for snapshot restore, which must claim the exact
/// tokens recorded in the snapshot.
pub struct ResourcePool<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    /// LIFO free list. May transiently contain reserved tokens; `acquire`
    /// skips anything in `in_use`.
    free: Vec<T>,
    in_use: HashSet<T>,
    /// Every token the pool has ever seen (free ∪ in use), for duplicate
    /// detection in `fill`.
    known: HashSet<T>,
}

impl<T: Eq + Hash + Clone> Default for ResourcePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> ResourcePool<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                in_use: HashSet::new(),
                known: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // A poisoned pool mutex means a panic mid-bookkeeping; the state is
        // plain collections, so continuing with it is sound.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Extend the free list, skipping tokens the pool already knows.
    pub fn fill(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.lock();
        for item in items {
            if inner.known.insert(item.clone()) {
                inner.free.push(item);
            }
        }
    }

    /// Pop a free token in O(1). `None` when exhausted.
    pub fn acquire(&self) -> Option<T> {
        let mut inner = self.lock();
        while let Some(item) = inner.free.pop() {
            // Reserved tokens may still sit on the free list; drop them.
            if !inner.in_use.contains(&item) {
                inner.in_use.insert(item.clone());
                return Some(item);
            }
        }
        None
    }

    /// Return a token to the free list. Releasing a token that is not in
    /// use is a no-op.
    pub fn release(&self, item: T) {
        let mut inner = self.lock();
        if inner.in_use.remove(&item) {
            inner.free.push(item);
        }
    }

    /// Mark a token in use without removing it from the free list (it may
    /// not be present at all). Fails if the token is already in use.
    pub fn try_reserve(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.in_use.contains(&item) {
            return false;
        }
        inner.known.insert(item.clone());
        inner.in_use.insert(item);
        true
    }

    /// Unconditionally mark a token in use.
    pub fn force_reserve(&self, item: T) {
        let mut inner = self.lock();
        inner.known.insert(item.clone());
        inner.in_use.insert(item);
    }

    /// Atomically reserve `new` and release `old`. A no-op success when
    /// `old == new`; failure when `new` is already in use (state unchanged).
    pub fn swap_reserved(&self, old: T, new: T) -> bool {
        if old == new {
            return true;
        }
        let mut inner = self.lock();
        if inner.in_use.contains(&new) {
            return false;
        }
        inner.known.insert(new.clone());
        inner.in_use.insert(new);
        if inner.in_use.remove(&old) {
            inner.free.push(old);
        }
        true
    }

    /// Total tokens known to the pool (free + in use).
    pub fn size(&self) -> usize {
        self.lock().known.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.lock().in_use.len()
    }
}
