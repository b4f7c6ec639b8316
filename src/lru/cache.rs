//! Provides a size constrained cache which loads missing values on demand.
//!
//! A [LoadingCache](LoadingCache) keeps the results of an expensive computation or a
//! slow backing store in memory. It is bounded by a maximal number of entries (and
//! optionally by a memory limit) and discards the least recently used entry once the
//! bound is hit. Reading is the only way to mutate the cache, there is no put: a value
//! which is not present is fetched via the supplied [Loader](crate::loader::Loader)
//! and then kept for subsequent reads.
//!
//! The cache is built to be shared across many threads. See [get](LoadingCache::get)
//! for a description of the locking discipline.
use crate::average::Average;
use crate::fmt::{format_short_duration, format_size};
use crate::loader::Loader;
use crate::lru::flight::FlightGroup;
use crate::lru::index::{ByteSize, LRUIndex};
use parking_lot::RwLock;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Contains the number of entries a cache holds unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 100;

/// Creates a [LoadingCache](LoadingCache) with custom settings.
///
/// # Example
///
/// ```
/// use ganymede::lru::CacheBuilder;
///
/// let cache = CacheBuilder::new()
///     .capacity(2)
///     .coalesce_loads(true)
///     .build(|key: &str| anyhow::Ok(key.len().to_string()));
///
/// assert_eq!(cache.get("ganymede").unwrap(), "8");
/// assert_eq!(cache.capacity(), 2);
/// ```
pub struct CacheBuilder {
    capacity: usize,
    max_memory: usize,
    coalesce_loads: bool,
}

impl CacheBuilder {
    /// Creates a builder with the default settings.
    ///
    /// These are a capacity of [DEFAULT_CAPACITY](DEFAULT_CAPACITY) entries, no
    /// memory bound and no coalescing of loads.
    pub fn new() -> Self {
        CacheBuilder::default()
    }

    /// Specifies the maximal number of entries to keep.
    ///
    /// A value of zero is raised to one, as a cache which cannot hold anything
    /// would simply re-load every single read.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Limits the memory footprint of the kept entries to the given number of bytes.
    ///
    /// The footprint of an entry is its key length plus the allocated size reported
    /// by the value via [ByteSize](crate::lru::ByteSize). Once the total footprint
    /// exceeds the given limit, least recently used entries are discarded until the
    /// cache fits again. By default no memory bound is enforced.
    pub fn max_memory(mut self, max_memory: usize) -> Self {
        self.max_memory = max_memory;
        self
    }

    /// Determines how concurrent misses for the same key are handled.
    ///
    /// By default a miss holds the exclusive lock of the cache while the loader runs.
    /// This guarantees a single load per missing key but also serializes loads for
    /// distinct keys. With coalescing enabled, loads are tracked per key: the first
    /// caller performs the load without blocking the whole cache and all further
    /// callers for the same key wait for that result, while loads for other keys
    /// proceed in parallel.
    ///
    /// Coalescing is worthwhile if the backing store is slow and misses for distinct
    /// keys tend to arrive together. For fast loaders the default keeps the overhead
    /// per miss lower.
    pub fn coalesce_loads(mut self, coalesce_loads: bool) -> Self {
        self.coalesce_loads = coalesce_loads;
        self
    }

    /// Creates the cache which obtains missing values from the given loader.
    pub fn build<V, L>(self, loader: L) -> LoadingCache<V>
    where
        V: ByteSize + Clone,
        L: Loader<Value = V> + 'static,
    {
        log::debug!(
            "Creating a loading cache for up to {} entries...",
            self.capacity
        );

        LoadingCache {
            index: RwLock::new(LRUIndex::with_capacity(self.capacity)),
            loader: Box::new(loader),
            flights: if self.coalesce_loads {
                Some(FlightGroup::new())
            } else {
                None
            },
            capacity: self.capacity,
            max_memory: self.max_memory,
            reads: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            coalesced_reads: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            load_time: Average::new(),
        }
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        CacheBuilder {
            capacity: DEFAULT_CAPACITY,
            max_memory: usize::MAX,
            coalesce_loads: false,
        }
    }
}

/// A bounded, thread safe cache which fills itself from a backing store.
///
/// All reads go through [get](LoadingCache::get). A hit is served from memory and
/// marks the entry as recently used, a miss invokes the [Loader](crate::loader::Loader)
/// and stores the result, evicting the least recently used entry if the cache is full.
/// Failed loads are reported to the caller and leave the cache untouched.
///
/// The cache can be shared across threads (commonly within an
/// [Arc](std::sync::Arc)), all methods take `&self`.
///
/// # Example
///
/// ```
/// use ganymede::lru::LoadingCache;
///
/// let cache = LoadingCache::new(|key: &str| anyhow::Ok(format!("value-{}", key)));
///
/// assert_eq!(cache.get("answer").unwrap(), "value-answer");
///
/// // The second read is a hit, the loader remains idle...
/// assert_eq!(cache.get("answer").unwrap(), "value-answer");
/// assert_eq!(cache.loads(), 1);
/// assert_eq!(cache.hits(), 1);
/// ```
pub struct LoadingCache<V: ByteSize> {
    index: RwLock<LRUIndex<V>>,
    loader: Box<dyn Loader<Value = V>>,
    flights: Option<FlightGroup<V>>,
    capacity: usize,
    max_memory: usize,
    reads: AtomicU64,
    hits: AtomicU64,
    coalesced_reads: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    load_time: Average,
}

impl<V: ByteSize + Clone> LoadingCache<V> {
    /// Creates a cache with the default settings for the given loader.
    ///
    /// Use a [CacheBuilder](CacheBuilder) to deviate from the defaults.
    pub fn new(loader: impl Loader<Value = V> + 'static) -> Self {
        CacheBuilder::new().build(loader)
    }

    /// Provides the value for the given key, loading it if necessary.
    ///
    /// The lookup itself only takes the shared lock, therefore hits on distinct
    /// threads proceed in parallel. Each hit marks the entry as the most recently
    /// used one. On a miss the shared lock is released and the exclusive lock is
    /// acquired. As another caller might have loaded the key in between, the cache
    /// is consulted a second time before the loader is finally invoked. This
    /// guarantees that a miss storm on a single key results in exactly one load,
    /// all other callers find the value when they re-check.
    ///
    /// A freshly loaded value is inserted as the most recently used entry. If the
    /// cache is full, the least recently used entry is evicted to make room. If the
    /// loader fails, the error is returned to the caller and nothing is recorded,
    /// therefore a later read simply tries again.
    ///
    /// # Examples
    ///
    /// ```
    /// use ganymede::lru::LoadingCache;
    ///
    /// let cache = LoadingCache::new(|key: &str| anyhow::Ok(key.to_uppercase()));
    ///
    /// assert_eq!(cache.get("moon").unwrap(), "MOON");
    /// assert_eq!(cache.get("moon").unwrap(), "MOON");
    /// assert_eq!(cache.loads(), 1);
    /// ```
    ///
    /// Sharing the cache across threads, a storm of concurrent reads for one
    /// missing key still performs a single load:
    ///
    /// ```
    /// use ganymede::lru::LoadingCache;
    /// use std::sync::Arc;
    ///
    /// let cache = Arc::new(LoadingCache::new(|key: &str| anyhow::Ok(key.to_uppercase())));
    ///
    /// let readers: Vec<_> = (0..4)
    ///     .map(|_| {
    ///         let cache = Arc::clone(&cache);
    ///         std::thread::spawn(move || cache.get("callisto").unwrap())
    ///     })
    ///     .collect();
    ///
    /// for reader in readers {
    ///     assert_eq!(reader.join().unwrap(), "CALLISTO");
    /// }
    /// assert_eq!(cache.loads(), 1);
    /// ```
    pub fn get(&self, key: &str) -> anyhow::Result<V> {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);

        // Probe under the shared lock first. A hit promotes the entry and clones
        // the value without ever blocking other readers.
        {
            let index = self.index.read();
            if let Some(slot) = index.lookup(key) {
                index.touch(slot);
                let _ = self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(index.value(slot).clone());
            }
        }

        match self.flights.as_ref() {
            Some(flights) => self.load_coalesced(flights, key),
            None => self.load_serialized(key),
        }
    }

    /// Handles a miss by loading under the exclusive lock.
    fn load_serialized(&self, key: &str) -> anyhow::Result<V> {
        let mut index = self.index.write();

        // Another caller might have loaded the key while we waited for the
        // exclusive lock. This re-check is what keeps a miss storm on a single
        // key down to one access of the backing store.
        if let Some(slot) = index.lookup(key) {
            index.touch(slot);
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(index.value(slot).clone());
        }

        let value = self.load_value(key)?;
        self.insert_loaded(&mut index, key, value.clone());

        Ok(value)
    }

    /// Handles a miss by attaching to the in-flight load for the key, if any.
    fn load_coalesced(&self, flights: &FlightGroup<V>, key: &str) -> anyhow::Result<V> {
        let mut led = false;
        let result = flights.execute(key, || {
            led = true;

            // The flight might only have been won after a previous one for the
            // same key finished and its value landed in the cache. Probe again
            // before performing the expensive load.
            {
                let index = self.index.read();
                if let Some(slot) = index.lookup(key) {
                    index.touch(slot);
                    let _ = self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(index.value(slot).clone());
                }
            }

            let value = self.load_value(key)?;

            let mut index = self.index.write();
            self.insert_loaded(&mut index, key, value.clone());

            Ok(value)
        });

        if !led {
            let _ = self.coalesced_reads.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Invokes the loader for the given key while recording metrics.
    fn load_value(&self, key: &str) -> anyhow::Result<V> {
        let _ = self.loads.fetch_add(1, Ordering::Relaxed);
        let watch = Instant::now();

        match self.loader.load(key) {
            Ok(value) => {
                let elapsed = watch.elapsed().as_micros() as i32;
                self.load_time.add(elapsed);
                log::debug!(
                    "Loaded the value for '{}' in {}.",
                    key,
                    format_short_duration(elapsed)
                );

                Ok(value)
            }
            Err(error) => {
                log::error!("Failed to load a value for '{}': {:#}", key, error);

                Err(error.context(format!("Failed to load a value for '{}'", key)))
            }
        }
    }

    /// Stores a freshly loaded value while enforcing the configured bounds.
    fn insert_loaded(&self, index: &mut LRUIndex<V>, key: &str, value: V) {
        if index.len() >= self.capacity {
            self.evict_one(index);
        }

        let _ = index.insert_front(key.to_owned(), value);

        // The optional memory bound drains further entries beyond the plain
        // capacity rule. With the default unbounded setting this never runs.
        while index.allocated_memory() > self.max_memory && !index.is_empty() {
            self.evict_one(index);
        }
    }

    /// Removes the least recently used entry.
    fn evict_one(&self, index: &mut LRUIndex<V>) {
        if let Some((key, _)) = index.evict_back() {
            let _ = self.evictions.fetch_add(1, Ordering::Relaxed);
            log::debug!("Evicted '{}' from the cache.", key);
        }
    }

    /// Returns the number of entries currently in the cache.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Determines if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Returns the maximal number of entries the cache holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the memory bound in bytes, or `usize::MAX` if none was set.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Estimates the memory footprint of all cached entries.
    pub fn allocated_memory(&self) -> usize {
        self.index.read().allocated_memory()
    }

    /// Counts all invocations of [get](LoadingCache::get).
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Counts the reads which found the value present in the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Counts the reads which shared the outcome of a load performed by another
    /// caller.
    ///
    /// This remains zero unless [coalesce_loads](CacheBuilder::coalesce_loads)
    /// was enabled.
    pub fn coalesced_reads(&self) -> u64 {
        self.coalesced_reads.load(Ordering::Relaxed)
    }

    /// Counts the invocations of the loader, including failed ones.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Counts the entries which were discarded to enforce the configured bounds.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Computes the percentage of reads which were directly served from the cache.
    pub fn hit_rate(&self) -> f32 {
        let reads = self.reads();
        if reads == 0 {
            0.
        } else {
            self.hits() as f32 / reads as f32 * 100.
        }
    }

    /// Computes the used percentage of the available capacity.
    pub fn utilization(&self) -> f32 {
        self.len() as f32 / self.capacity as f32 * 100.
    }

    /// Provides the sliding average of the recent load durations.
    pub fn load_time(&self) -> &Average {
        &self.load_time
    }

    /// Takes a point in time snapshot of all metrics.
    ///
    /// The returned [CacheStats](CacheStats) implements [Display](std::fmt::Display)
    /// and renders a small report:
    ///
    /// ```
    /// use ganymede::lru::LoadingCache;
    ///
    /// let cache = LoadingCache::new(|key: &str| anyhow::Ok(key.to_owned()));
    /// let _ = cache.get("sol").unwrap();
    ///
    /// println!("{}", cache.stats());
    /// ```
    pub fn stats(&self) -> CacheStats {
        let index = self.index.read();

        CacheStats {
            len: index.len(),
            capacity: self.capacity,
            allocated_memory: index.allocated_memory(),
            max_memory: self.max_memory,
            reads: self.reads(),
            hits: self.hits(),
            coalesced_reads: self.coalesced_reads(),
            loads: self.loads(),
            evictions: self.evictions(),
            avg_load_micros: self.load_time.avg(),
        }
    }
}

/// A point in time snapshot of the metrics of a [LoadingCache](LoadingCache).
#[derive(Clone, Debug)]
pub struct CacheStats {
    /// Contains the number of entries in the cache.
    pub len: usize,
    /// Contains the maximal number of entries the cache holds.
    pub capacity: usize,
    /// Contains the memory footprint of all entries in bytes.
    pub allocated_memory: usize,
    /// Contains the memory bound in bytes, or `usize::MAX` if none was set.
    pub max_memory: usize,
    /// Counts all reads.
    pub reads: u64,
    /// Counts the reads which found the value present in the cache.
    pub hits: u64,
    /// Counts the reads which shared a load performed by another caller.
    pub coalesced_reads: u64,
    /// Counts the invocations of the loader.
    pub loads: u64,
    /// Counts the discarded entries.
    pub evictions: u64,
    /// Contains the sliding average of the recent load durations in microseconds.
    pub avg_load_micros: i32,
}

impl CacheStats {
    /// Computes the percentage of reads which were directly served from the cache.
    pub fn hit_rate(&self) -> f32 {
        if self.reads == 0 {
            0.
        } else {
            self.hits as f32 / self.reads as f32 * 100.
        }
    }

    /// Computes the used percentage of the available capacity.
    pub fn utilization(&self) -> f32 {
        self.len as f32 / self.capacity as f32 * 100.
    }
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<30} {:>20}", "Num Entries", self.len)?;
        writeln!(f, "{:<30} {:>20}", "Max Entries", self.capacity)?;
        writeln!(f, "{:<30} {:>18.2} %", "Utilization", self.utilization())?;
        writeln!(
            f,
            "{:<30} {:>20}",
            "Allocated Memory",
            format_size(self.allocated_memory)
        )?;
        if self.max_memory != usize::MAX {
            writeln!(
                f,
                "{:<30} {:>20}",
                "Max Memory",
                format_size(self.max_memory)
            )?;
        }
        writeln!(f, "{:<30} {:>20}", "Reads", self.reads)?;
        writeln!(f, "{:<30} {:>20}", "Cache Hits", self.hits)?;
        writeln!(f, "{:<30} {:>20}", "Coalesced Reads", self.coalesced_reads)?;
        writeln!(f, "{:<30} {:>18.2} %", "Hit Rate", self.hit_rate())?;
        writeln!(f, "{:<30} {:>20}", "Loads", self.loads)?;
        writeln!(
            f,
            "{:<30} {:>20}",
            "Avg Load Time",
            format_short_duration(self.avg_load_micros)
        )?;
        writeln!(f, "{:<30} {:>20}", "Evictions", self.evictions)
    }
}
