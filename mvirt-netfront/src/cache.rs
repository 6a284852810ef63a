//! Object caches and the transmit request-id allocator
//!
//! A `Cache` hands out pre-constructed objects (pages, multicast records,
//! ...) from a lock-free magazine and only falls back to the constructor
//! when the magazine is empty and the population bound allows. Growth and
//! destruction run under an injectable `CacheLock`, so a cache can be shared
//! between a thread context and the deferred poll without assuming which one
//! already holds a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, trace};

/// Lock pair guarding cache growth and shrinkage
pub trait CacheLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Busy-wait lock for caches used from the poll path.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheLock for SpinLock {
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// For caches only ever touched under an outer lock.
#[derive(Debug, Default)]
pub struct NoLock;

impl CacheLock for NoLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

struct Guard<'a> {
    lock: Option<&'a dyn CacheLock>,
}

impl<'a> Guard<'a> {
    fn enter(lock: &'a dyn CacheLock, locked: bool) -> Self {
        if locked {
            Self { lock: None }
        } else {
            lock.acquire();
            Self { lock: Some(lock) }
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.release();
        }
    }
}

type Constructor<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;
type Destructor<T> = Box<dyn Fn(T) + Send + Sync>;

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Objects constructed and not yet destroyed
    pub population: usize,
    /// Objects currently handed out
    pub allocated: usize,
    /// Objects parked in the magazine
    pub free: usize,
}

/// Bounded object cache with constructor and destructor hooks.
pub struct Cache<T> {
    name: String,
    magazine: ArrayQueue<T>,
    population: AtomicUsize,
    allocated: AtomicUsize,
    max: usize,
    ctor: Constructor<T>,
    dtor: Destructor<T>,
    lock: Arc<dyn CacheLock>,
}

impl<T> Cache<T> {
    pub fn new(
        name: impl Into<String>,
        max: usize,
        ctor: impl Fn() -> Option<T> + Send + Sync + 'static,
        dtor: impl Fn(T) + Send + Sync + 'static,
        lock: Arc<dyn CacheLock>,
    ) -> Self {
        let name = name.into();
        debug!(cache = %name, max, "Cache created");
        Self {
            name,
            magazine: ArrayQueue::new(max.max(1)),
            population: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            max,
            ctor: Box::new(ctor),
            dtor: Box::new(dtor),
            lock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take an object.
    ///
    /// `locked` says the caller already holds this cache's lock. Returns
    /// `None` when the population bound is reached or the constructor fails;
    /// callers treat that as back-pressure.
    pub fn get(&self, locked: bool) -> Option<T> {
        if let Some(value) = self.magazine.pop() {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let _guard = Guard::enter(self.lock.as_ref(), locked);
        if self.population.load(Ordering::Relaxed) >= self.max {
            trace!(cache = %self.name, "Cache exhausted");
            return None;
        }

        let value = (self.ctor)()?;
        self.population.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Return an object taken with `get`.
    pub fn put(&self, value: T, locked: bool) {
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        if let Err(value) = self.magazine.push(value) {
            // Magazine holds max objects, only reachable if put() is unbalanced
            let _guard = Guard::enter(self.lock.as_ref(), locked);
            (self.dtor)(value);
            self.population.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Destroy every parked object.
    ///
    /// Returns the number destroyed. Objects still handed out are unaffected.
    pub fn drain(&self, locked: bool) -> usize {
        let _guard = Guard::enter(self.lock.as_ref(), locked);
        let mut count = 0;
        while let Some(value) = self.magazine.pop() {
            (self.dtor)(value);
            self.population.fetch_sub(1, Ordering::Relaxed);
            count += 1;
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            population: self.population.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            free: self.magazine.len(),
        }
    }
}

impl<T> Drop for Cache<T> {
    fn drop(&mut self) {
        while let Some(value) = self.magazine.pop() {
            (self.dtor)(value);
        }
    }
}

/// Free-list of `u16` ids kept as sorted, non-adjacent inclusive ranges.
#[derive(Debug, Clone)]
pub struct RangeSet {
    ranges: Vec<(u16, u16)>,
}

impl RangeSet {
    /// All ids in `[first, last]` free
    pub fn new(first: u16, last: u16) -> Self {
        Self {
            ranges: vec![(first, last)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of free ids
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(start, end)| (end - start) as usize + 1)
            .sum()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.ranges
            .iter()
            .any(|&(start, end)| start <= id && id <= end)
    }

    /// Take the lowest free id.
    pub fn pop(&mut self) -> Option<u16> {
        let first = self.ranges.first_mut()?;
        let id = first.0;
        if first.0 == first.1 {
            self.ranges.remove(0);
        } else {
            first.0 += 1;
        }
        Some(id)
    }

    /// Give an id back.
    ///
    /// Returns false if the id was already free.
    pub fn push(&mut self, id: u16) -> bool {
        let pos = self.ranges.partition_point(|&(_, end)| end < id);
        if let Some(&(start, _)) = self.ranges.get(pos)
            && start <= id
        {
            return false;
        }

        let joins_prev = pos > 0 && self.ranges[pos - 1].1 + 1 == id;
        let joins_next = self
            .ranges
            .get(pos)
            .is_some_and(|&(start, _)| id.checked_add(1) == Some(start));

        match (joins_prev, joins_next) {
            (true, true) => {
                self.ranges[pos - 1].1 = self.ranges[pos].1;
                self.ranges.remove(pos);
            }
            (true, false) => self.ranges[pos - 1].1 = id,
            (false, true) => self.ranges[pos].0 = id,
            (false, false) => self.ranges.insert(pos, (id, id)),
        }
        true
    }

    /// Number of disjoint ranges
    pub fn fragments(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_cache(max: usize) -> (Cache<u32>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let built_clone = built.clone();
        let destroyed_clone = destroyed.clone();
        let cache = Cache::new(
            "test",
            max,
            move || Some(built_clone.fetch_add(1, Ordering::SeqCst) as u32),
            move |_| {
                destroyed_clone.fetch_add(1, Ordering::SeqCst);
            },
            Arc::new(SpinLock::new()),
        );
        (cache, built, destroyed)
    }

    #[test]
    fn test_cache_get_put_reuses() {
        let (cache, built, _) = counting_cache(4);

        let a = cache.get(false).expect("get");
        cache.put(a, false);
        let b = cache.get(false).expect("get");
        assert_eq!(a, b);
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.population, 1);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.free, 0);
    }

    #[test]
    fn test_cache_exhaustion_is_soft() {
        let (cache, _, _) = counting_cache(2);
        let a = cache.get(false).expect("get");
        let _b = cache.get(false).expect("get");
        assert!(cache.get(false).is_none());

        cache.put(a, false);
        assert!(cache.get(false).is_some());
    }

    #[test]
    fn test_cache_ctor_failure() {
        let cache: Cache<u8> = Cache::new("empty", 8, || None, |_| {}, Arc::new(NoLock));
        assert!(cache.get(true).is_none());
        assert_eq!(cache.stats().population, 0);
    }

    #[test]
    fn test_cache_drain_runs_dtor() {
        let (cache, _, destroyed) = counting_cache(4);
        let a = cache.get(false).expect("get");
        let b = cache.get(false).expect("get");
        cache.put(a, false);
        cache.put(b, false);

        assert_eq!(cache.drain(false), 2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_range_set_pop_lowest() {
        let mut ids = RangeSet::new(0, 3);
        assert_eq!(ids.pop(), Some(0));
        assert_eq!(ids.pop(), Some(1));
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.pop(), Some(2));
        assert_eq!(ids.pop(), Some(3));
        assert_eq!(ids.pop(), None);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_range_set_push_merges() {
        let mut ids = RangeSet::new(0, 9);
        for _ in 0..10 {
            ids.pop();
        }

        assert!(ids.push(5));
        assert!(ids.push(3));
        assert_eq!(ids.fragments(), 2);
        assert!(ids.push(4));
        assert_eq!(ids.fragments(), 1);
        assert!(ids.push(6));
        assert!(ids.push(2));
        assert_eq!(ids.fragments(), 1);
        assert_eq!(ids.len(), 5);
        assert_eq!(ids.pop(), Some(2));
    }

    #[test]
    fn test_range_set_double_push() {
        let mut ids = RangeSet::new(0, 3);
        let id = ids.pop().expect("pop");
        assert!(ids.push(id));
        assert!(!ids.push(id));
        assert!(!ids.push(2));
        assert_eq!(ids.len(), 4);
    }
}
