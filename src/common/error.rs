/// The error type for the [`SegmentedMap::try_insert`][try-insert] method,
/// distinguishing the reasons a key-value pair was not inserted. The
/// rejected pair is dropped in both cases.
///
/// [try-insert]: crate::sync::SegmentedMap::try_insert
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryInsertError {
    /// The key is already present in the map. Existing values are never
    /// overwritten.
    #[error("the key is already present in the map")]
    AlreadyPresent,

    /// The segment exhausted its probe bound or its entry store before a
    /// slot could be claimed. The map does not resize on this path; the
    /// caller may retry, typically after concurrent erases or a
    /// load-factor-driven resize have made room.
    #[error("the segment's probe bound or entry store is exhausted")]
    CapacityExhausted,
}

#[cfg(test)]
mod tests {
    use super::TryInsertError;

    #[test]
    fn display_messages() {
        assert_eq!(
            TryInsertError::AlreadyPresent.to_string(),
            "the key is already present in the map"
        );
        assert_eq!(
            TryInsertError::CapacityExhausted.to_string(),
            "the segment's probe bound or entry store is exhausted"
        );
    }
}
