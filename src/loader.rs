//! Connects a cache to the backing store which it shields.
//!
//! A [Loader](Loader) is the single capability a [LoadingCache](crate::lru::LoadingCache)
//! demands from the underlying store: given a key, either produce the matching value or
//! report an error. The cache itself decides when the loader is invoked, namely once per
//! missing key, and guarantees that a result for an already cached key is never requested
//! again as long as the entry remains in the cache.
//!
//! Any `Fn(&str) -> anyhow::Result<V>` closure can directly serve as a loader, therefore
//! simple caches can be built without declaring a dedicated type:
//!
//! ```
//! use ganymede::loader::Loader;
//!
//! let loader = |key: &str| anyhow::Ok(key.to_uppercase());
//!
//! assert_eq!(loader.load("ganymede").unwrap(), "GANYMEDE");
//! ```

/// Loads the value for a given key from the backing store.
///
/// Implementations are invoked by the cache whenever a requested key is not present.
/// A loader has to be both, [Send](Send) and [Sync](Sync), as the owning cache is
/// shared across threads and several loads for distinct keys may run at once.
///
/// # Example
///
/// ```
/// use anyhow::Context;
/// use ganymede::loader::Loader;
/// use std::collections::HashMap;
///
/// struct Directory {
///     numbers: HashMap<String, String>,
/// }
///
/// impl Loader for Directory {
///     type Value = String;
///
///     fn load(&self, key: &str) -> anyhow::Result<String> {
///         self.numbers
///             .get(key)
///             .cloned()
///             .with_context(|| format!("Unknown entry: '{}'", key))
///     }
/// }
///
/// let mut numbers = HashMap::new();
/// numbers.insert("fire".to_owned(), "112".to_owned());
/// let directory = Directory { numbers };
///
/// assert_eq!(directory.load("fire").unwrap(), "112");
/// assert!(directory.load("police").is_err());
/// ```
pub trait Loader: Send + Sync {
    /// Specifies the type of values produced by this loader.
    type Value;

    /// Retrieves the value for the given key from the underlying store.
    ///
    /// Returning an error signals that the value cannot be provided right now. The
    /// cache will not record anything for the key in this case, therefore a later
    /// lookup will consult the loader again.
    fn load(&self, key: &str) -> anyhow::Result<Self::Value>;
}

impl<V, F> Loader for F
where
    F: Fn(&str) -> anyhow::Result<V> + Send + Sync,
{
    type Value = V;

    fn load(&self, key: &str) -> anyhow::Result<V> {
        self(key)
    }
}

#[cfg(test)]
mod tests {
    use crate::loader::Loader;
    use anyhow::bail;

    #[test]
    fn closures_act_as_loaders() {
        let loader = |key: &str| anyhow::Ok(format!("value-{}", key));

        assert_eq!(loader.load("zeus").unwrap(), "value-zeus");
    }

    #[test]
    fn errors_are_passed_through() {
        let loader = |key: &str| -> anyhow::Result<String> { bail!("no value for '{}'", key) };

        let error = loader.load("zeus").unwrap_err();
        assert!(error.to_string().contains("zeus"));
    }
}
