//! Provides a size constrained LRU cache which fills itself from a backing store.
//!
//! An LRU cache drops the least recently used entry if it is about to grow beyond its
//! limits. This implementation is read-through: rather than combining a plain lookup
//! table with a separate put operation, a [LoadingCache](LoadingCache) owns a
//! [Loader](crate::loader::Loader) and obtains missing values itself. This closes the
//! classic gap between "checked the cache" and "stored the computed value", in which
//! racing threads of a lookaside cache all observe a miss and hammer the backing store
//! with the same request.
//!
//! The cache internally uses a reader/writer lock around an [LRUIndex](LRUIndex). Hits
//! only take the shared lock, hence parallel readers never line up behind each other.
//! The recency order is maintained behind a dedicated mutex inside the index, so even
//! a hit, which promotes the touched entry, gets away with the shared lock. A miss
//! acquires the exclusive lock and re-checks before loading, which bounds the work
//! per missing key to a single load no matter how many threads requested it at once.
//!
//! For slow backing stores, the [CacheBuilder](CacheBuilder) can additionally enable
//! load coalescing. A [FlightGroup](FlightGroup) then tracks the loads which are in
//! progress per key, so that distinct keys are loaded in parallel while a miss storm
//! on one key is still answered by a single access of the backing store.
mod cache;
mod flight;
mod index;

pub use cache::CacheBuilder;
pub use cache::CacheStats;
pub use cache::LoadingCache;
pub use cache::DEFAULT_CAPACITY;
pub use flight::FlightGroup;
pub use index::ByteSize;
pub use index::LRUIndex;
