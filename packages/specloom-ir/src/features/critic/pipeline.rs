//! Pipeline strategies: ordered stages plus the dependences that cross
//! them.

use crate::features::pdg::{DepGraph, EdgeId, Scc, SccDag, SccId};
use crate::shared::models::{BlockId, InstrId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageType {
    Sequential,
    Replicable,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub ty: StageType,
    pub instructions: BTreeSet<InstrId>,
    /// Prefix re-executed by every worker of a parallel stage.
    pub replicated: BTreeSet<InstrId>,
    pub parallel_factor: u32,
}

impl PipelineStage {
    pub fn from_sccs(ty: StageType, sccdag: &SccDag, sccs: &[SccId]) -> Self {
        let mut instructions = BTreeSet::new();
        for &id in sccs {
            instructions.extend(sccdag.scc(id).members.iter().copied());
        }
        PipelineStage { ty, instructions, replicated: BTreeSet::new(), parallel_factor: 1 }
    }

    pub fn from_instrs(ty: StageType, instrs: impl IntoIterator<Item = InstrId>) -> Self {
        PipelineStage {
            ty,
            instructions: instrs.into_iter().collect(),
            replicated: BTreeSet::new(),
            parallel_factor: 1,
        }
    }

    /// Instructions plus the replicated prefix.
    pub fn all_instrs(&self) -> BTreeSet<InstrId> {
        self.instructions.union(&self.replicated).copied().collect()
    }

    pub fn contains(&self, i: InstrId) -> bool {
        self.instructions.contains(&i) || self.replicated.contains(&i)
    }
}

/// A dependence between instructions in different pipeline stages, routed
/// through an inter-stage queue by the code generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossStageDependence {
    pub src: InstrId,
    pub dst: InstrId,
    #[serde(skip)]
    pub edge: EdgeId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStrategy {
    pub stages: Vec<PipelineStage>,
    /// Control deps the workers must receive to follow the leader's path.
    pub cross_stage_deps: Vec<CrossStageDependence>,
    /// Forward memory flows communicated between stages.
    pub cross_stage_mem_flows: Vec<CrossStageDependence>,
    /// Loop header this strategy was computed for; None once invalidated.
    pub header: Option<BlockId>,
}

impl PipelineStrategy {
    pub fn set_valid_for(&mut self, header: BlockId) {
        self.header = Some(header);
    }

    pub fn is_valid(&self) -> bool {
        self.header.is_some()
    }

    /// Short summary such as `DSWP[S-P4-S]` or `DOALL[P8]`.
    pub fn summary(&self) -> String {
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|s| match s.ty {
                StageType::Sequential => "S".to_string(),
                StageType::Replicable => "R".to_string(),
                StageType::Parallel => format!("P{}", s.parallel_factor),
            })
            .collect();
        if self.stages.len() == 1 && self.stages[0].ty == StageType::Parallel {
            format!("DOALL[{}]", stages[0])
        } else {
            format!("DSWP[{}]", stages.join("-"))
        }
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// The stages an instruction executes in.
    pub fn executing_stages(&self, i: InstrId) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.contains(i))
            .map(|(ix, _)| ix)
            .collect()
    }

    pub fn may_execute_in_stage(&self, i: InstrId, stage: usize) -> bool {
        self.stages.get(stage).map(|s| s.contains(i)).unwrap_or(false)
    }

    pub fn may_execute_in_parallel_stage(&self, i: InstrId) -> bool {
        self.stages.iter().any(|s| s.ty == StageType::Parallel && s.contains(i))
    }

    /// Would the dependence src -> dst run backwards through the pipeline?
    pub fn maybe_anti_pipeline_dependence(&self, src: InstrId, dst: InstrId) -> bool {
        let src_stages = self.executing_stages(src);
        let dst_stages = self.executing_stages(dst);
        match (src_stages.iter().min(), dst_stages.iter().max()) {
            (Some(&s), Some(&d)) => d < s,
            _ => false,
        }
    }

    /// Would a loop-carried dependence src -> dst land inside a parallel
    /// stage?
    pub fn maybe_anti_parallel_stage_dependence(&self, src: InstrId, dst: InstrId) -> bool {
        self.stages.iter().any(|s| {
            s.ty == StageType::Parallel && s.contains(src) && s.contains(dst)
        })
    }

    /// Dissolve Replicable stages: their instructions become the
    /// replicated prefix of every later stage. Returns true if anything
    /// changed.
    pub fn expand_replicated_stages(&mut self) -> bool {
        let mut changed = false;
        let mut ix = 0;
        while ix < self.stages.len() {
            if self.stages[ix].ty != StageType::Replicable {
                ix += 1;
                continue;
            }
            let insts: Vec<InstrId> = self.stages[ix].instructions.iter().copied().collect();
            for later in self.stages[ix + 1..].iter_mut() {
                later.replicated.extend(insts.iter().copied());
            }
            self.stages.remove(ix);
            changed = true;
        }
        changed
    }

    /// Gravity placement: a new instruction joins the stages of the
    /// instruction it was derived from.
    pub fn add_instruction(&mut self, new: InstrId, gravity: InstrId, force_replication: bool) {
        for stage in &mut self.stages {
            if stage.instructions.contains(&gravity) {
                if force_replication {
                    stage.replicated.insert(new);
                } else {
                    stage.instructions.insert(new);
                }
            } else if stage.replicated.contains(&gravity) {
                stage.replicated.insert(new);
            }
        }
    }

    pub fn replace_instruction(&mut self, new: InstrId, old: InstrId) {
        for stage in &mut self.stages {
            if stage.instructions.remove(&old) {
                stage.instructions.insert(new);
            }
            if stage.replicated.remove(&old) {
                stage.replicated.insert(new);
            }
        }
    }

    pub fn delete_instruction(&mut self, i: InstrId) {
        for stage in &mut self.stages {
            stage.instructions.remove(&i);
            stage.replicated.remove(&i);
        }
    }

    /// Total workers the strategy consumes.
    pub fn total_workers(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| if s.ty == StageType::Parallel { s.parallel_factor } else { 1 })
            .sum()
    }

    /// Serialize the plan for dumping next to the other analysis
    /// artifacts.
    pub fn to_json(&self) -> crate::errors::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::errors::SpecloomError::Analysis(e.to_string()))
    }
}

/// All SCCs of a DAG, in id order.
pub fn all_scc_ids(sccdag: &SccDag) -> Vec<SccId> {
    sccdag.sccs().iter().map(|s: &Scc| s.id).collect()
}

/// Partition `all` around `pivots`: SCCs that must precede any pivot,
/// those that must follow, and the flexible rest.
pub fn pivot3(
    sccdag: &SccDag,
    all: &[SccId],
    pivots: &[SccId],
) -> (Vec<SccId>, Vec<SccId>, Vec<SccId>) {
    let mut before = Vec::new();
    let mut after = Vec::new();
    let mut flexible = Vec::new();
    for &scc in all {
        if sccdag.ordered_before_any(scc, pivots) {
            before.push(scc);
        } else if sccdag.ordered_after_any(scc, pivots) {
            after.push(scc);
        } else {
            flexible.push(scc);
        }
    }
    (before, after, flexible)
}

/// Two-way pivot; flexible SCCs favor shorter pipelines.
pub fn pivot2(sccdag: &SccDag, all: &[SccId], pivots: &[SccId]) -> (Vec<SccId>, Vec<SccId>) {
    let (mut before, mut after, flexible) = pivot3(sccdag, all, pivots);
    if after.is_empty() {
        before.extend(flexible);
    } else {
        after.extend(flexible);
    }
    (before, after)
}

/// Sanity checks used by tests: no backward edge through the pipeline and
/// no loop-carried edge inside a parallel stage, except through criticisms.
pub fn assert_pipeline_properties(
    ps: &PipelineStrategy,
    pdg: &DepGraph,
    criticisms: &super::Criticisms,
) {
    for e in pdg.edges() {
        if criticisms.contains(&e) {
            continue;
        }
        let (src, dst) = pdg.endpoints(e);
        assert!(
            !ps.maybe_anti_pipeline_dependence(src, dst),
            "backward dependence {:?} -> {:?} violates pipeline order",
            src,
            dst
        );
        if pdg.edge(e).loop_carried {
            assert!(
                !ps.maybe_anti_parallel_stage_dependence(src, dst),
                "loop-carried dependence {:?} -> {:?} inside parallel stage",
                src,
                dst
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(n: u32) -> InstrId {
        InstrId(n)
    }

    #[test]
    fn test_summary() {
        let ps = PipelineStrategy {
            stages: vec![
                PipelineStage::from_instrs(StageType::Sequential, [i(0)]),
                PipelineStage {
                    ty: StageType::Parallel,
                    instructions: [i(1)].into_iter().collect(),
                    replicated: BTreeSet::new(),
                    parallel_factor: 2,
                },
                PipelineStage::from_instrs(StageType::Sequential, [i(2)]),
            ],
            ..Default::default()
        };
        assert_eq!(ps.summary(), "DSWP[S-P2-S]");
    }

    #[test]
    fn test_expand_replicated() {
        let mut ps = PipelineStrategy {
            stages: vec![
                PipelineStage::from_instrs(StageType::Replicable, [i(0), i(1)]),
                PipelineStage::from_instrs(StageType::Parallel, [i(2)]),
                PipelineStage::from_instrs(StageType::Sequential, [i(3)]),
            ],
            ..Default::default()
        };
        assert!(ps.expand_replicated_stages());
        assert_eq!(ps.stages.len(), 2);
        assert!(ps.stages[0].replicated.contains(&i(0)));
        assert!(ps.stages[1].replicated.contains(&i(1)));
    }

    #[test]
    fn test_anti_pipeline_dependence() {
        let ps = PipelineStrategy {
            stages: vec![
                PipelineStage::from_instrs(StageType::Sequential, [i(0)]),
                PipelineStage::from_instrs(StageType::Parallel, [i(1)]),
            ],
            ..Default::default()
        };
        assert!(ps.maybe_anti_pipeline_dependence(i(1), i(0)));
        assert!(!ps.maybe_anti_pipeline_dependence(i(0), i(1)));
    }

    #[test]
    fn test_plan_serializes() {
        let ps = PipelineStrategy {
            stages: vec![PipelineStage::from_instrs(StageType::Parallel, [i(1)])],
            ..Default::default()
        };
        let json = ps.to_json().unwrap();
        assert!(json.contains("Parallel"));
        let back: PipelineStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stages.len(), 1);
    }

    #[test]
    fn test_gravity_placement() {
        let mut ps = PipelineStrategy {
            stages: vec![PipelineStage::from_instrs(StageType::Parallel, [i(1)])],
            ..Default::default()
        };
        ps.add_instruction(i(9), i(1), false);
        assert!(ps.stages[0].instructions.contains(&i(9)));
        ps.add_instruction(i(10), i(1), true);
        assert!(ps.stages[0].replicated.contains(&i(10)));
    }
}
