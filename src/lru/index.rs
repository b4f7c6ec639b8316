//! Provides the bookkeeping structure which backs the cache.
//!
//! An [LRUIndex](LRUIndex) stores the cached entries themselves along with the recency
//! sequence which determines the next eviction victim. It is a plain single writer
//! data structure. The surrounding [LoadingCache](crate::lru::LoadingCache) wraps it
//! into a reader/writer lock and adds the locking discipline as well as the actual
//! loading of values.
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Marks the end of the recency sequence as well as unused link slots.
const NIL: usize = usize::MAX;

/// Determines the memory consumption of cached values.
///
/// When inserting an entry, the index records its memory footprint as the length of the
/// key plus the allocated size reported by the value. This powers the statistics output
/// of the cache and the optional memory bound which can be set via
/// [CacheBuilder](crate::lru::CacheBuilder).
pub trait ByteSize {
    /// Returns the allocated memory in bytes.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

impl ByteSize for Vec<u8> {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

impl<T: ByteSize> ByteSize for Arc<T> {
    fn allocated_size(&self) -> usize {
        self.as_ref().allocated_size()
    }
}

/// An entry which occupies a slot of the index.
struct Entry<V> {
    key: String,
    mem_size: usize,
    value: V,
}

/// A node of the doubly linked recency sequence.
///
/// Links address their neighbours by slot number, hence entries never move once
/// inserted and no pointers are required.
#[derive(Copy, Clone)]
struct Link {
    prev: usize,
    next: usize,
}

/// The recency sequence of all occupied slots, ordered from most recently used
/// (head) to least recently used (tail).
struct LinkTable {
    links: Vec<Link>,
    head: usize,
    tail: usize,
}

impl LinkTable {
    fn with_capacity(capacity: usize) -> Self {
        LinkTable {
            links: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
        }
    }

    /// Grows the table so that the given slot can be linked.
    fn ensure_slot(&mut self, slot: usize) {
        while self.links.len() <= slot {
            self.links.push(Link {
                prev: NIL,
                next: NIL,
            });
        }
    }

    /// Links the given slot in front of the sequence.
    ///
    /// The slot must currently be detached.
    fn attach_front(&mut self, slot: usize) {
        self.links[slot] = Link {
            prev: NIL,
            next: self.head,
        };

        if self.head != NIL {
            self.links[self.head].prev = slot;
        }
        self.head = slot;

        if self.tail == NIL {
            self.tail = slot;
        }
    }

    /// Unlinks the given slot from the sequence.
    ///
    /// The slot must currently be attached.
    fn detach(&mut self, slot: usize) {
        let Link { prev, next } = self.links[slot];

        if prev != NIL {
            self.links[prev].next = next;
        } else {
            self.head = next;
        }

        if next != NIL {
            self.links[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.links[slot] = Link {
            prev: NIL,
            next: NIL,
        };
    }

    /// Moves the given slot to the front of the sequence.
    fn move_to_front(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }

        self.detach(slot);
        self.attach_front(slot);
    }

    /// Returns the least recently used slot.
    fn back(&self) -> Option<usize> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail)
        }
    }
}

/// Maintains the key to value mapping and the recency order of a LRU cache.
///
/// The index combines three parts:
/// * a hash map which translates each key into a stable slot number
/// * an arena of entries, addressed by slot, which owns the keys and values
/// * a doubly linked recency sequence, also addressed by slot, which orders all
///   occupied slots from most recently used to least recently used
///
/// Lookups ([lookup](LRUIndex::lookup), [value](LRUIndex::value)) and recency
/// promotions ([touch](LRUIndex::touch)) only require a shared reference. The recency
/// links reside behind their own mutex, hence an entry can be promoted while other
/// readers are active. Structural changes, namely [insert_front](LRUIndex::insert_front)
/// and [evict_back](LRUIndex::evict_back), require exclusive access.
///
/// Note that the index itself is not a concurrent container. The
/// [LoadingCache](crate::lru::LoadingCache) wraps it into a reader/writer lock and
/// implements the actual cache discipline on top of these primitives.
///
/// # Example
///
/// ```
/// use ganymede::lru::LRUIndex;
///
/// let mut index = LRUIndex::new();
/// let _ = index.insert_front("earth".to_owned(), "planet".to_owned());
/// let _ = index.insert_front("ganymede".to_owned(), "moon".to_owned());
///
/// // Promote "earth" to the most recently used position...
/// let slot = index.lookup("earth").unwrap();
/// index.touch(slot);
/// assert_eq!(index.value(slot).as_str(), "planet");
///
/// // ...therefore "ganymede" is now the eviction victim.
/// assert_eq!(index.evict_back(), Some(("ganymede".to_owned(), "moon".to_owned())));
/// assert_eq!(index.len(), 1);
/// ```
pub struct LRUIndex<V: ByteSize> {
    map: FnvHashMap<String, usize>,
    entries: Vec<Option<Entry<V>>>,
    free: Vec<usize>,
    links: Mutex<LinkTable>,
    allocated: usize,
}

impl<V: ByteSize> LRUIndex<V> {
    /// Creates a new and empty index.
    pub fn new() -> Self {
        LRUIndex::with_capacity(0)
    }

    /// Creates a new index which preallocates room for the given number of entries.
    pub fn with_capacity(capacity: usize) -> Self {
        LRUIndex {
            map: FnvHashMap::with_capacity_and_hasher(capacity, Default::default()),
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            links: Mutex::new(LinkTable::with_capacity(capacity)),
            allocated: 0,
        }
    }

    /// Determines the slot occupied by the given key.
    pub fn lookup(&self, key: &str) -> Option<usize> {
        self.map.get(key).copied()
    }

    /// Marks the given slot as the most recently used one.
    ///
    /// The slot must be occupied, as reported by a previous
    /// [lookup](LRUIndex::lookup).
    pub fn touch(&self, slot: usize) {
        debug_assert!(
            self.entries.get(slot).is_some_and(|entry| entry.is_some()),
            "touched the vacant slot {}",
            slot
        );

        self.links.lock().move_to_front(slot);
    }

    /// Provides access to the value stored in the given slot.
    ///
    /// The slot must be occupied, as reported by a previous
    /// [lookup](LRUIndex::lookup).
    pub fn value(&self, slot: usize) -> &V {
        match self.entries[slot].as_ref() {
            Some(entry) => &entry.value,
            None => unreachable!("read from the vacant slot {}", slot),
        }
    }

    /// Inserts the given key and value as the most recently used entry.
    ///
    /// Returns the slot which now holds the entry. Vacated slots are reused before
    /// the arena grows. Inserting a key which is already present discards the
    /// previous entry.
    pub fn insert_front(&mut self, key: String, value: V) -> usize {
        let mem_size = key.len() + value.allocated_size();

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };

        if let Some(stale) = self.map.insert(key.clone(), slot) {
            self.discard(stale);
        }

        self.entries[slot] = Some(Entry {
            key,
            mem_size,
            value,
        });
        self.allocated += mem_size;

        let links = self.links.get_mut();
        links.ensure_slot(slot);
        links.attach_front(slot);

        self.debug_validate();

        slot
    }

    /// Removes and returns the least recently used entry.
    ///
    /// Returns `None` if the index is empty.
    pub fn evict_back(&mut self) -> Option<(String, V)> {
        let links = self.links.get_mut();
        let slot = links.back()?;
        links.detach(slot);

        let entry = match self.entries[slot].take() {
            Some(entry) => entry,
            None => unreachable!("the recency sequence referenced the vacant slot {}", slot),
        };

        let removed = self.map.remove(&entry.key);
        debug_assert_eq!(
            removed,
            Some(slot),
            "the key '{}' was not mapped to the evicted slot",
            entry.key
        );

        self.free.push(slot);
        self.allocated -= entry.mem_size;

        self.debug_validate();

        Some((entry.key, entry.value))
    }

    /// Returns the number of entries in the index.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the total memory footprint of all entries.
    ///
    /// This is the sum of the key lengths and the allocated sizes reported by the
    /// stored values via [ByteSize](ByteSize).
    pub fn allocated_memory(&self) -> usize {
        self.allocated
    }

    /// Withdraws the entry in the given slot after its key was remapped.
    fn discard(&mut self, slot: usize) {
        self.links.get_mut().detach(slot);

        if let Some(entry) = self.entries[slot].take() {
            self.allocated -= entry.mem_size;
            self.free.push(slot);
        }
    }

    /// Verifies the key/slot bijection and the recency sequence in debug builds.
    fn debug_validate(&mut self) {
        #[cfg(debug_assertions)]
        {
            let occupied = self.entries.iter().filter(|slot| slot.is_some()).count();
            debug_assert_eq!(
                self.map.len(),
                occupied,
                "the key map and the entry arena disagree about the number of entries"
            );

            for (key, slot) in &self.map {
                match self.entries.get(*slot).and_then(|entry| entry.as_ref()) {
                    Some(entry) => debug_assert_eq!(
                        &entry.key, key,
                        "the slot {} is occupied by a foreign key",
                        slot
                    ),
                    None => debug_assert!(false, "the key '{}' points at a vacant slot", key),
                }
            }

            let links = self.links.get_mut();
            let mut walked = 0;
            let mut previous = NIL;
            let mut slot = links.head;
            while slot != NIL {
                debug_assert_eq!(
                    links.links[slot].prev, previous,
                    "the recency sequence is not properly back linked at slot {}",
                    slot
                );
                debug_assert!(
                    self.entries[slot].is_some(),
                    "the recency sequence contains the vacant slot {}",
                    slot
                );

                walked += 1;
                debug_assert!(walked <= self.map.len(), "the recency sequence has a cycle");

                previous = slot;
                slot = links.links[slot].next;
            }

            debug_assert_eq!(
                walked,
                self.map.len(),
                "the recency sequence misses entries"
            );
            debug_assert_eq!(links.tail, previous, "the tail link is out of date");
        }
    }

    /// Lists all keys ordered from most recently to least recently used.
    #[cfg(test)]
    pub(crate) fn keys_by_recency(&self) -> Vec<String> {
        let links = self.links.lock();
        let mut keys = Vec::new();

        let mut slot = links.head;
        while slot != NIL {
            if let Some(entry) = self.entries[slot].as_ref() {
                keys.push(entry.key.clone());
            }
            slot = links.links[slot].next;
        }

        keys
    }
}

impl<V: ByteSize> Default for LRUIndex<V> {
    fn default() -> Self {
        LRUIndex::new()
    }
}
