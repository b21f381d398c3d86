//! Sequence-order release of concurrently completed records.

use std::collections::{BTreeMap, BTreeSet};

/// A reorder buffer for one partition.
///
/// Records are admitted in ascending sequence order before processing begins, complete in arbitrary order, and are
/// released strictly in admitted order: a completed record is held until no admitted record with a lower sequence
/// remains unemitted. Sequence numbers are externally assigned and may contain gaps; only the relative order of
/// admitted sequences matters.
pub struct ReorderBuffer<T> {
    admitted: BTreeSet<u64>,
    completed: BTreeMap<u64, T>,
    highest_admitted: Option<u64>,
}

impl<T> ReorderBuffer<T> {
    /// Creates an empty `ReorderBuffer`.
    pub fn new() -> Self {
        Self {
            admitted: BTreeSet::new(),
            completed: BTreeMap::new(),
            highest_admitted: None,
        }
    }

    /// Admits a sequence number.
    ///
    /// Returns `false`, without admitting, if the sequence does not advance past every previously admitted sequence:
    /// duplicates and regressions would otherwise stall or reorder the release stream.
    pub fn admit(&mut self, sequence: u64) -> bool {
        match self.highest_admitted {
            Some(highest) if sequence <= highest => false,
            _ => {
                self.highest_admitted = Some(sequence);
                self.admitted.insert(sequence);
                true
            }
        }
    }

    /// Records the completion of an admitted sequence and returns every record now releasable.
    ///
    /// The returned records are in ascending sequence order. Completions for sequences that were never admitted are
    /// ignored.
    pub fn complete(&mut self, sequence: u64, item: T) -> Vec<T> {
        if !self.admitted.contains(&sequence) {
            return Vec::new();
        }
        self.completed.insert(sequence, item);

        let mut released = Vec::new();
        while let Some(first_admitted) = self.admitted.first().copied() {
            match self.completed.remove(&first_admitted) {
                Some(item) => {
                    self.admitted.remove(&first_admitted);
                    released.push(item);
                }
                None => break,
            }
        }
        released
    }

    /// Returns the number of admitted sequences not yet released.
    pub fn pending(&self) -> usize {
        self.admitted.len()
    }

    /// Returns the number of completed records held back waiting on a lower sequence.
    pub fn held(&self) -> usize {
        self.completed.len()
    }

    /// Returns `true` if no admitted sequence is outstanding.
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn releases_in_admitted_order_despite_completion_order() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.admit(1));
        assert!(buffer.admit(2));
        assert!(buffer.admit(3));

        assert_eq!(buffer.complete(2, "two"), Vec::<&str>::new());
        assert_eq!(buffer.complete(3, "three"), Vec::<&str>::new());
        assert_eq!(buffer.held(), 2);

        assert_eq!(buffer.complete(1, "one"), vec!["one", "two", "three"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn in_order_completions_release_immediately() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.admit(1));
        assert_eq!(buffer.complete(1, "one"), vec!["one"]);
        assert!(buffer.admit(2));
        assert_eq!(buffer.complete(2, "two"), vec!["two"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn tolerates_gaps_in_sequence_numbers() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.admit(10));
        assert!(buffer.admit(20));
        assert!(buffer.admit(30));

        assert_eq!(buffer.complete(20, 20), Vec::<u64>::new());
        assert_eq!(buffer.complete(10, 10), vec![10, 20]);
        assert_eq!(buffer.complete(30, 30), vec![30]);
    }

    #[test]
    fn duplicates_and_regressions_are_rejected() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.admit(5));
        assert!(!buffer.admit(5));
        assert!(!buffer.admit(3));

        assert_eq!(buffer.complete(5, "five"), vec!["five"]);

        // Even once released, older sequences stay rejected.
        assert!(!buffer.admit(4));
        assert!(buffer.admit(6));
    }

    #[test]
    fn unadmitted_completions_are_ignored() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.admit(1));
        assert_eq!(buffer.complete(9, "nine"), Vec::<&str>::new());
        assert_eq!(buffer.pending(), 1);
        assert_eq!(buffer.held(), 0);
    }

    fn completion_plan() -> impl Strategy<Value = (Vec<u64>, Vec<usize>)> {
        proptest::collection::btree_set(0u64..1_000, 1..32).prop_flat_map(|sequences| {
            let sequences: Vec<u64> = sequences.into_iter().collect();
            let indices: Vec<usize> = (0..sequences.len()).collect();
            (Just(sequences), Just(indices).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn any_completion_order_releases_in_admitted_order((sequences, completion_order) in completion_plan()) {
            let mut buffer = ReorderBuffer::new();
            for &sequence in &sequences {
                prop_assert!(buffer.admit(sequence));
            }

            let mut released = Vec::new();
            for index in completion_order {
                let sequence = sequences[index];
                released.extend(buffer.complete(sequence, sequence));
            }

            prop_assert_eq!(released, sequences);
            prop_assert!(buffer.is_empty());
        }
    }
}
