// Property tests for time-vector ordering: the commit heap relies on
// `lte` being total and internally consistent, and on adjacency implying
// order.

use proptest::prelude::*;
use specloom_runtime::txio::TimeVector;

fn tv_strategy() -> impl Strategy<Value = TimeVector> {
    prop::collection::vec(0u32..6, 1..5).prop_map(TimeVector::new)
}

proptest! {
    // Totality: any two vectors are comparable.
    #[test]
    fn lte_total(a in tv_strategy(), b in tv_strategy()) {
        prop_assert!(a.lte(&b) || b.lte(&a));
    }

    // Consistency: mutual lte means the heap treats them as tied, which
    // must be stable under repetition.
    #[test]
    fn lte_reflexive(a in tv_strategy()) {
        prop_assert!(a.lte(&a));
    }

    #[test]
    fn lte_transitive(a in tv_strategy(), b in tv_strategy(), c in tv_strategy()) {
        if a.lte(&b) && b.lte(&c) {
            prop_assert!(a.lte(&c));
        }
    }

    // The successor at the last level is always adjacent.
    #[test]
    fn increment_is_adjacent(a in tv_strategy()) {
        let mut next = a.indices().to_vec();
        *next.last_mut().unwrap() += 1;
        prop_assert!(TimeVector::adjacent(Some(&a), &TimeVector::new(next)));
    }

    // Descending below the watermark with zeros is adjacent (the first
    // sub-event of the transaction the watermark names).
    #[test]
    fn zero_extension_is_adjacent(a in tv_strategy(), depth in 1usize..3) {
        let mut next = a.indices().to_vec();
        next.extend(std::iter::repeat(0).take(depth));
        prop_assert!(TimeVector::adjacent(Some(&a), &TimeVector::new(next)));
    }

    // Skipping an index is never adjacent: a hole in time blocks commit.
    #[test]
    fn skip_is_not_adjacent(a in tv_strategy()) {
        let mut next = a.indices().to_vec();
        *next.last_mut().unwrap() += 2;
        prop_assert!(!TimeVector::adjacent(Some(&a), &TimeVector::new(next)));
    }
}
