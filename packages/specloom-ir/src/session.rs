//! Per-run analysis state.
//!
//! Everything the original kept in file-scope globals lives here and is
//! threaded through the top-level calls: the canonical pools, the
//! exclusions registry, the parsed profile, and the configuration knobs.

use crate::features::classify::HeapAssignment;
use crate::features::context::FoldManager;
use crate::features::critic::CriticConfig;
use crate::features::profile::ProfileInfo;
use crate::shared::models::FcnId;
use rustc_hash::FxHashSet;

/// Functions excluded from transformation: runtime entry points, outlined
/// bodies produced by earlier invocations, and anything the multi-threaded
/// code generator synthesized.
#[derive(Debug, Default, Clone)]
pub struct Exclusions {
    set: FxHashSet<FcnId>,
}

impl Exclusions {
    pub fn insert(&mut self, f: FcnId) {
        self.set.insert(f);
    }

    pub fn exclude(&self, f: FcnId) -> bool {
        self.set.contains(&f)
    }

    pub fn reset(&mut self) {
        self.set.clear();
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

pub struct Session {
    pub fold: FoldManager,
    pub exclusions: Exclusions,
    pub profile: ProfileInfo,
    pub heap_assignment: Option<HeapAssignment>,
    pub critic_config: CriticConfig,
    pub thread_budget: u32,
}

impl Session {
    pub fn new() -> Self {
        Session {
            fold: FoldManager::new(),
            exclusions: Exclusions::default(),
            profile: ProfileInfo::default(),
            heap_assignment: None,
            critic_config: CriticConfig::default(),
            thread_budget: num_cpus::get() as u32,
        }
    }

    pub fn with_thread_budget(mut self, budget: u32) -> Self {
        self.thread_budget = budget.max(1);
        self
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusions() {
        let mut ex = Exclusions::default();
        ex.insert(FcnId(3));
        assert!(ex.exclude(FcnId(3)));
        assert!(!ex.exclude(FcnId(4)));
        ex.reset();
        assert!(ex.is_empty());
    }

    #[test]
    fn test_session_budget_floor() {
        let s = Session::new().with_thread_budget(0);
        assert_eq!(s.thread_budget, 1);
    }
}
