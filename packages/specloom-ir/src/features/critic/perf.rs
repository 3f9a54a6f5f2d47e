//! Performance estimation.
//!
//! Weights come from the timing profile; arithmetic is fixed-point so plan
//! comparisons are exact and repeatable.

use super::pipeline::{PipelineStrategy, StageType};
use crate::shared::models::{InstrId, LoopRef, ModuleIr};
use rustc_hash::FxHashMap;

/// Fixed-point scale for weight arithmetic.
pub const FIXED_POINT: u64 = 1000;

/// Tie-break penalty per level of loop nesting: prefer outer loops.
pub const PENALIZE_LOOP_NEST: u64 = 10;

pub trait PerformanceEstimator {
    /// Relative execution weight of one instruction.
    fn estimate_weight(&self, instr: InstrId) -> f64;

    /// Total weight of a loop body.
    fn estimate_loop_weight(&self, ir: &ModuleIr, lp: &LoopRef) -> f64 {
        let mut sum = 0.0;
        for &b in &lp.blocks {
            for &i in &ir.block(b).instrs {
                sum += self.estimate_weight(i);
            }
        }
        sum
    }

    fn estimate_weight_of_instrs(&self, instrs: &[InstrId]) -> f64 {
        instrs.iter().map(|&i| self.estimate_weight(i)).sum()
    }

    /// Pipeline throughput is limited by the heaviest stage; a parallel
    /// stage's weight is divided by its worker count.
    fn estimate_pipeline_weight(&self, ps: &PipelineStrategy) -> f64 {
        let mut worst: f64 = 0.0;
        for stage in &ps.stages {
            let instrs: Vec<InstrId> = stage.instructions.iter().copied().collect();
            let mut w = self.estimate_weight_of_instrs(&instrs);
            if stage.ty == StageType::Parallel && stage.parallel_factor > 1 {
                w /= stage.parallel_factor as f64;
            }
            if w > worst {
                worst = w;
            }
        }
        worst
    }
}

/// Instruction weights read from the timing profile; unprofiled
/// instructions get a unit weight.
pub struct ProfileWeights {
    weights: FxHashMap<InstrId, f64>,
    default_weight: f64,
}

impl ProfileWeights {
    pub fn new(weights: FxHashMap<InstrId, f64>) -> Self {
        ProfileWeights { weights, default_weight: 1.0 }
    }

    pub fn uniform() -> Self {
        ProfileWeights { weights: FxHashMap::default(), default_weight: 1.0 }
    }

    pub fn set(&mut self, instr: InstrId, weight: f64) {
        self.weights.insert(instr, weight);
    }
}

/// Below this many instructions the rayon split costs more than it saves.
#[cfg(feature = "parallel")]
const PARALLEL_WEIGHT_THRESHOLD: usize = 4096;

impl PerformanceEstimator for ProfileWeights {
    fn estimate_weight(&self, instr: InstrId) -> f64 {
        self.weights.get(&instr).copied().unwrap_or(self.default_weight)
    }

    fn estimate_weight_of_instrs(&self, instrs: &[InstrId]) -> f64 {
        #[cfg(feature = "parallel")]
        if instrs.len() >= PARALLEL_WEIGHT_THRESHOLD {
            use rayon::prelude::*;
            return instrs.par_iter().map(|&i| self.estimate_weight(i)).sum();
        }
        instrs.iter().map(|&i| self.estimate_weight(i)).sum()
    }
}

/// Expected speedup of a plan relative to the sequential loop, in
/// fixed-point units. Negative means the plan loses.
pub fn exp_pipeline_speedup(
    perf: &dyn PerformanceEstimator,
    ps: &PipelineStrategy,
    ir: &ModuleIr,
    lp: &LoopRef,
) -> i64 {
    let loop_time = perf.estimate_loop_weight(ir, lp);
    let scaled_loop_time = (FIXED_POINT as f64 * loop_time) as i64;
    let depth_penalty = (PENALIZE_LOOP_NEST * lp.depth as u64) as i64;
    let adj_loop_time =
        if scaled_loop_time > depth_penalty { scaled_loop_time - depth_penalty } else { scaled_loop_time };

    let pipeline_weight = (FIXED_POINT as f64 * perf.estimate_pipeline_weight(ps)) as i64;
    adj_loop_time - pipeline_weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::InstrId;
    use std::collections::BTreeSet;

    fn stage(ty: StageType, instrs: &[u32], factor: u32) -> crate::features::critic::PipelineStage {
        crate::features::critic::PipelineStage {
            ty,
            instructions: instrs.iter().map(|&i| InstrId(i)).collect::<BTreeSet<_>>(),
            replicated: BTreeSet::new(),
            parallel_factor: factor,
        }
    }

    #[test]
    fn test_pipeline_weight_is_bottleneck() {
        let mut pw = ProfileWeights::uniform();
        for i in 0..10 {
            pw.set(InstrId(i), 10.0);
        }
        let ps = PipelineStrategy {
            stages: vec![
                stage(StageType::Sequential, &[0], 1),
                stage(StageType::Parallel, &[1, 2, 3, 4, 5, 6, 7], 7),
                stage(StageType::Sequential, &[8], 1),
            ],
            ..Default::default()
        };
        // Sequential stages weigh 10; the parallel stage weighs 70/7 = 10.
        assert!((pw.estimate_pipeline_weight(&ps) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_speedup_positive_for_good_plan() {
        let mut ir = ModuleIr::new();
        let f = ir.add_function("main", 0);
        let b = ir.add_block(f, "body");
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(ir.append_instr(b, format!("i{}", i), crate::shared::models::Opcode::Alloca { size: 8 }));
        }
        let lp = LoopRef {
            function: f,
            header: b,
            preheader: None,
            blocks: [b].into_iter().collect(),
            depth: 1,
            exit_edges: vec![],
        };
        let pw = ProfileWeights::uniform();
        let ps = PipelineStrategy {
            stages: vec![crate::features::critic::PipelineStage {
                ty: StageType::Parallel,
                instructions: ids.iter().map(|i| *i).collect(),
                replicated: BTreeSet::new(),
                parallel_factor: 4,
            }],
            ..Default::default()
        };
        // 8 units sequential vs 2 units parallel.
        assert!(exp_pipeline_speedup(&pw, &ps, &ir, &lp) > 0);
    }
}
