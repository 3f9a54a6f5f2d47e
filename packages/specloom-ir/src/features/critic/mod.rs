//! Critics: turn an annotated PDG into a parallelization plan plus the
//! criticisms (edges that must be discharged) the plan depends on.

pub mod doall;
pub mod min_cut;
pub mod perf;
pub mod pipeline;
pub mod psdswp;

use crate::features::pdg::EdgeId;
use std::collections::BTreeSet;

pub use doall::DoallCritic;
pub use perf::{PerformanceEstimator, ProfileWeights, FIXED_POINT};
pub use pipeline::{CrossStageDependence, PipelineStage, PipelineStrategy, StageType};
pub use psdswp::{CriticConfig, PsDswpCritic};

/// Edges the critic believes must be removed for its plan to be legal.
/// Ordered so iteration (and therefore test output) is deterministic.
pub type Criticisms = BTreeSet<EdgeId>;

/// Sentinel expected speedup for an infeasible parallelization.
pub const INFEASIBLE_SPEEDUP: i64 = -1;

/// Loop facts the critics need beyond the PDG; produced by the host
/// toolkit's induction-variable and loop analyses.
#[derive(Debug, Clone)]
pub struct LoopDependenceInfo {
    /// The loop is governed by a bounded induction variable, so the header
    /// SCC's internal loop-carried edges disappear under chunked iteration
    /// distribution.
    pub governed_by_bounded_iv: bool,
    /// Preferred chunk size for iteration distribution.
    pub chunk_size: u64,
}

impl Default for LoopDependenceInfo {
    fn default() -> Self {
        LoopDependenceInfo { governed_by_bounded_iv: false, chunk_size: 1 }
    }
}

/// The result of a critic run.
#[derive(Debug)]
pub struct CriticRes {
    pub criticisms: Criticisms,
    pub exp_speedup: i64,
    pub strategy: Option<PipelineStrategy>,
}

impl CriticRes {
    pub fn infeasible() -> Self {
        CriticRes { criticisms: Criticisms::new(), exp_speedup: INFEASIBLE_SPEEDUP, strategy: None }
    }
}
