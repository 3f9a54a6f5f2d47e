//! Heap assignment: which family of versioned heap each AU lives in.
//!
//! Built once per selected loop from the profile's escape, lifetime and
//! reduction evidence; immutable thereafter. Every AU appears in exactly one
//! family; the sub-heap id further partitions a family into allocation
//! namespaces whose disjointness the locality remedies exploit.

use crate::features::context::{AuId, Ptr};
use crate::shared::models::BlockId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Number of sub-heaps per heap family. Must agree with the runtime layout.
pub const NUM_SUBHEAPS: u8 = 8;

/// Reduction operator carried by a Redux assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduxKind {
    AddI32,
    AddI64,
    AddF32,
    AddF64,
    Max,
    Min,
}

/// Heap family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapKind {
    Shared,
    Local,
    Private,
    ReadOnly,
    Redux,
    KillPrivate,
    SharePrivate,
    Unclassified,
}

impl HeapKind {
    pub fn name(&self) -> &'static str {
        match self {
            HeapKind::Shared => "shared",
            HeapKind::Local => "local",
            HeapKind::Private => "priv",
            HeapKind::ReadOnly => "ro",
            HeapKind::Redux => "redux",
            HeapKind::KillPrivate => "killpriv",
            HeapKind::SharePrivate => "sharepriv",
            HeapKind::Unclassified => "unclassified",
        }
    }

    /// Families whose per-worker views are iteration-private: cross
    /// iteration flows through them are impossible.
    pub fn is_iteration_private(&self) -> bool {
        matches!(
            self,
            HeapKind::Local | HeapKind::Redux | HeapKind::KillPrivate | HeapKind::SharePrivate
        )
    }
}

/// The assignment AU -> (family, sub-heap), plus reduction operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeapAssignment {
    kinds: FxHashMap<AuId, HeapKind>,
    subheaps: FxHashMap<AuId, u8>,
    redux: FxHashMap<AuId, ReduxKind>,
    /// Loop header this assignment was computed for.
    valid_for: Option<BlockId>,
}

impl HeapAssignment {
    pub fn new(valid_for: BlockId) -> Self {
        HeapAssignment { valid_for: Some(valid_for), ..Default::default() }
    }

    pub fn is_valid_for(&self, header: BlockId) -> bool {
        self.valid_for == Some(header)
    }

    /// Assign an AU to a family. An AU can be assigned only once.
    pub fn assign(&mut self, au: AuId, kind: HeapKind, subheap: u8) {
        debug_assert!(
            !self.kinds.contains_key(&au),
            "AU assigned to two heap families"
        );
        debug_assert!(subheap < NUM_SUBHEAPS);
        self.kinds.insert(au, kind);
        self.subheaps.insert(au, subheap);
    }

    pub fn assign_redux(&mut self, au: AuId, op: ReduxKind, subheap: u8) {
        self.assign(au, HeapKind::Redux, subheap);
        self.redux.insert(au, op);
    }

    pub fn kind_of(&self, au: AuId) -> HeapKind {
        self.kinds.get(&au).copied().unwrap_or(HeapKind::Unclassified)
    }

    pub fn redux_kind(&self, au: AuId) -> Option<ReduxKind> {
        self.redux.get(&au).copied()
    }

    /// Sub-heap of an AU; 0 when unknown.
    pub fn subheap_of(&self, au: AuId) -> u8 {
        self.subheaps.get(&au).copied().unwrap_or(0)
    }

    /// Join the families of an underlying-AU set. Unclassified wins any
    /// conflict: the set is only as strong as its weakest member.
    pub fn classify(&self, aus: &[Ptr]) -> HeapKind {
        let mut result: Option<HeapKind> = None;
        for ptr in aus {
            let k = self.kind_of(ptr.au);
            if k == HeapKind::Unclassified {
                return HeapKind::Unclassified;
            }
            match result {
                None => result = Some(k),
                Some(prev) if prev == k => {}
                Some(_) => return HeapKind::Unclassified,
            }
        }
        result.unwrap_or(HeapKind::Unclassified)
    }

    /// The common sub-heap of a set, or None when members disagree or any
    /// member is unassigned.
    pub fn subheap(&self, aus: &[Ptr]) -> Option<u8> {
        let mut result: Option<u8> = None;
        for ptr in aus {
            let sh = *self.subheaps.get(&ptr.au)?;
            match result {
                None => result = Some(sh),
                Some(prev) if prev == sh => {}
                Some(_) => return None,
            }
        }
        result
    }

    /// All AUs assigned to a family, in id order.
    pub fn aus_of_kind(&self, kind: HeapKind) -> Vec<AuId> {
        let mut v: Vec<AuId> =
            self.kinds.iter().filter(|(_, &k)| k == kind).map(|(&au, _)| au).collect();
        v.sort();
        v
    }

    pub fn iter(&self) -> impl Iterator<Item = (AuId, HeapKind)> + '_ {
        self.kinds.iter().map(|(&au, &k)| (au, k))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(au: u32) -> Ptr {
        Ptr::new(AuId(au), 0, 1)
    }

    #[test]
    fn test_classify_uniform() {
        let mut asgn = HeapAssignment::new(BlockId(0));
        asgn.assign(AuId(1), HeapKind::Local, 0);
        asgn.assign(AuId(2), HeapKind::Local, 1);
        assert_eq!(asgn.classify(&[p(1), p(2)]), HeapKind::Local);
    }

    #[test]
    fn test_classify_conflict_is_unclassified() {
        let mut asgn = HeapAssignment::new(BlockId(0));
        asgn.assign(AuId(1), HeapKind::Local, 0);
        asgn.assign(AuId(2), HeapKind::Shared, 0);
        assert_eq!(asgn.classify(&[p(1), p(2)]), HeapKind::Unclassified);
    }

    #[test]
    fn test_classify_unknown_member_poisons() {
        let mut asgn = HeapAssignment::new(BlockId(0));
        asgn.assign(AuId(1), HeapKind::Private, 2);
        assert_eq!(asgn.classify(&[p(1), p(9)]), HeapKind::Unclassified);
    }

    #[test]
    fn test_subheap_agreement() {
        let mut asgn = HeapAssignment::new(BlockId(0));
        asgn.assign(AuId(1), HeapKind::Shared, 3);
        asgn.assign(AuId(2), HeapKind::Shared, 3);
        asgn.assign(AuId(3), HeapKind::Shared, 4);
        assert_eq!(asgn.subheap(&[p(1), p(2)]), Some(3));
        assert_eq!(asgn.subheap(&[p(1), p(3)]), None);
    }

    #[test]
    fn test_redux_carries_operator() {
        let mut asgn = HeapAssignment::new(BlockId(0));
        asgn.assign_redux(AuId(5), ReduxKind::AddF64, 0);
        assert_eq!(asgn.kind_of(AuId(5)), HeapKind::Redux);
        assert_eq!(asgn.redux_kind(AuId(5)), Some(ReduxKind::AddF64));
    }
}
