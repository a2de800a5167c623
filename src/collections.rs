//! Hash map and set aliases keyed by path strings, GUIDs and stream ids.
//!
//! With the `gxhash` feature the maps use gxhash's build hasher; without it
//! (machines lacking AES-NI/SSE2) they fall back to std's `RandomState`.
//! Construct with `FastMap::default()` / `FastSet::default()`.

/// Build hasher used by [`FastMap`] and [`FastSet`]
#[cfg(feature = "gxhash")]
pub type FastHasher = gxhash::GxBuildHasher;

/// Build hasher used by [`FastMap`] and [`FastSet`]
#[cfg(not(feature = "gxhash"))]
pub type FastHasher = std::hash::RandomState;

/// HashMap with the crate's preferred hasher
pub type FastMap<K, V> = std::collections::HashMap<K, V, FastHasher>;

/// HashSet with the crate's preferred hasher
pub type FastSet<T> = std::collections::HashSet<T, FastHasher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_construction() {
        let mut map: FastMap<u64, &str> = FastMap::default();
        map.insert(7, "seven");
        assert_eq!(map.get(&7), Some(&"seven"));

        let mut set: FastSet<String> = FastSet::default();
        assert!(set.insert("a".to_string()));
        assert!(!set.insert("a".to_string()));
    }
}
