//! Hashing and fingerprint derivation.

use std::hash::{BuildHasher, Hash, Hasher};

/// Default hasher for both map variants.
///
/// This is the hashing algorithm used by `std::collections::HashMap`, which
/// is selected to provide resistance against HashDoS attacks. Faster
/// algorithms such as the [`aHash`] crate can be swapped in through the
/// `with_hasher` constructor family.
///
/// [`aHash`]: https://crates.io/crates/ahash
pub type DefaultHashBuilder = std::collections::hash_map::RandomState;

#[inline]
pub(crate) fn hash<Q, S>(build_hasher: &S, key: &Q) -> u64
where
    Q: Hash + ?Sized,
    S: BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Secondary avalanche applied to hashes whose low byte is zero.
pub(crate) fn mix(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}

/// Derives the fingerprint for `hash`, re-mixing the hash once when its low
/// byte is zero. A zero fingerprint in an occupied bucket would look like an
/// unset marker, and low-quality hashers emit zero low bytes often enough to
/// matter. Every operation must route its hash through here before probing,
/// so insert, find and erase agree on both the fingerprint and the probe
/// start position.
#[inline]
pub(crate) fn adjust(hash: u64) -> (u64, u8) {
    let fingerprint = hash as u8;
    if fingerprint == 0 {
        let mixed = mix(hash);
        (mixed, mixed as u8)
    } else {
        (hash, fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::{adjust, hash, mix, DefaultHashBuilder};

    #[test]
    fn hashes_are_deterministic_per_builder() {
        let build_hasher = DefaultHashBuilder::default();
        assert_eq!(hash(&build_hasher, "key"), hash(&build_hasher, "key"));
    }

    #[test]
    fn nonzero_fingerprints_pass_through() {
        let (h, fingerprint) = adjust(0x1234_5601);
        assert_eq!(h, 0x1234_5601);
        assert_eq!(fingerprint, 0x01);
    }

    #[test]
    fn zero_fingerprints_are_remixed() {
        let raw = 0xDEAD_BEEF_0000_FF00u64;
        let (h, fingerprint) = adjust(raw);
        assert_ne!(h, raw);
        assert_eq!(h, mix(raw));
        assert_eq!(fingerprint, h as u8);
    }

    #[test]
    fn remix_is_stable() {
        assert_eq!(adjust(0x100), adjust(0x100));
    }
}
