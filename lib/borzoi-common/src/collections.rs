//! Hash-based collections backed by a fast, non-cryptographic hasher.

/// A fast, non-cryptographic hash implementation that is optimized for quality.
///
/// Suitable for hash tables and other structures that want fast hashing with a reasonable degree of collision
/// resistance. Not suitable where an attacker controls the keys and a cryptographic guarantee is required.
///
/// Currently backed by [`foldhash`](https://github.com/orlp/foldhash).
pub type FastHasher = foldhash::quality::FoldHasher;

/// [`BuildHasher`][std::hash::BuildHasher] implementation for [`FastHasher`].
pub type FastBuildHasher = foldhash::quality::RandomState;

/// A hash set based on `hashbrown` ([`HashSet`][hashbrown::HashSet]) using [`FastHasher`].
pub type FastHashSet<T> = hashbrown::HashSet<T, FastBuildHasher>;

/// A hash map based on `hashbrown` ([`HashMap`][hashbrown::HashMap]) using [`FastHasher`].
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;
