//! Ganymede is a library providing a bounded, thread safe LRU cache which loads
//! missing values from a slow backing store.
//!
//! # Introduction
//! **Ganymede** wraps a **slow** or **compute intense** source of values (a database,
//! a remote service, a costly computation) into an in-memory cache with a fixed
//! capacity. Reading is the only operation: a value which is present is delivered
//! immediately, a value which is absent is obtained from the backing store exactly
//! once and then kept, evicting the least recently used entry when the cache is full.
//!
//! Getting this right under concurrency is surprisingly subtle. The naive approach,
//! checking the cache and then loading on a miss, silently degrades into a stampede:
//! every thread which observes the miss performs the expensive load, the backing
//! store is hammered with identical requests and the cache is written over and over.
//! **Ganymede** therefore implements the double-checked locking discipline around a
//! reader/writer lock: hits share the lock, a miss re-checks under the exclusive lock
//! before it finally loads. For slow backing stores it optionally tracks loads per key
//! so that distinct keys load in parallel while each key is still loaded only once.
//!
//! # SIRIUS / Java
//! We at [scireum](https://www.scireum.de) run caches of this kind in front of the
//! search metadata and masterdata lookups of our open source Java framework
//! [SIRIUS](https://github.com/scireum/sirius-kernel). This crate provides the same
//! discipline as an embeddable Rust library, so that native services can shield their
//! backing stores without carrying a whole server runtime around.
//!
//! # Features
//! * **Read-through semantics**: The cache owns a [Loader](crate::loader::Loader) and
//!   fills itself. There is no put, therefore the content always reflects what the
//!   backing store delivered.
//! * **Strict bounds**: A maximal number of entries (100 by default) and an optional
//!   memory limit based on the [ByteSize](crate::lru::ByteSize) of the cached values.
//!   Eviction is strictly least recently used, maintained in O(1) via an index which
//!   links its entries through an arena instead of juggling pointers.
//! * **Parallel hits**: Lookups only take the shared lock and still promote the entry,
//!   as the recency order lives behind its own small mutex. Readers never queue up
//!   behind each other.
//! * **One load per key**: Concurrent misses for the same key result in a single
//!   access of the backing store, either via the exclusive lock re-check or, if
//!   enabled, via per key load coalescing which also lets distinct keys load in
//!   parallel.
//! * **Metrics included**: Reads, hits, loads, evictions and a sliding average of the
//!   load durations are recorded and can be rendered as a small report.
//!
//! # Modules
//! * **lru**: The cache itself along with its builder and statistics. See
//!   [LoadingCache](crate::lru::LoadingCache).
//! * **loader**: The connection to the backing store. Any suitable closure works. See
//!   [Loader](crate::loader::Loader).
//! * **average**: A sliding average over the last 100 recorded durations. See
//!   [Average](crate::average::Average).
//! * **fmt**: Renders durations and byte sizes for the statistics output.
//!
//! # Example
//! ```
//! use ganymede::lru::LoadingCache;
//!
//! let cache = LoadingCache::new(|key: &str| anyhow::Ok(format!("value-{}", key)));
//!
//! // The first read loads, the second one is served from memory...
//! assert_eq!(cache.get("answer").unwrap(), "value-answer");
//! assert_eq!(cache.get("answer").unwrap(), "value-answer");
//! assert_eq!(cache.loads(), 1);
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod fmt;
pub mod loader;
pub mod lru;

/// Initializes the logging system.
///
/// The cache reports loads and evictions at debug level and failed loads at error
/// level via the [log](https://crates.io/crates/log) facade. Embedding applications
/// which already initialize a logger should keep doing so, this helper is for
/// binaries and tests which have no own setup.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}
