//! The remediator interface.

use super::remedy::Remedy;
use crate::features::pdg::{DepDir, DepKind};
use crate::shared::models::{InstrId, LoopRef, ModuleIr};

/// Conservative answer is `Dep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepResult {
    NoDep,
    Dep,
}

#[derive(Debug, Clone)]
pub struct RemedResp {
    pub result: DepResult,
    pub remedy: Option<Remedy>,
}

impl RemedResp {
    pub fn dep() -> Self {
        RemedResp { result: DepResult::Dep, remedy: None }
    }

    pub fn no_dep(remedy: Remedy) -> Self {
        RemedResp { result: DepResult::NoDep, remedy: Some(remedy) }
    }
}

/// A dependence-removal oracle. Each method asks: can the dependence from
/// `src` to `dst` be removed, and under what validation burden?
pub trait Remediator {
    fn name(&self) -> &'static str;

    fn memdep(
        &mut self,
        _ir: &ModuleIr,
        _src: InstrId,
        _dst: InstrId,
        _loop_carried: bool,
        _dir: DepDir,
        _lp: &LoopRef,
    ) -> RemedResp {
        RemedResp::dep()
    }

    fn regdep(
        &mut self,
        _ir: &ModuleIr,
        _src: InstrId,
        _dst: InstrId,
        _loop_carried: bool,
        _lp: &LoopRef,
    ) -> RemedResp {
        RemedResp::dep()
    }

    fn ctrldep(
        &mut self,
        _ir: &ModuleIr,
        _src: InstrId,
        _dst: InstrId,
        _loop_carried: bool,
        _lp: &LoopRef,
    ) -> RemedResp {
        RemedResp::dep()
    }

    /// Route a query by edge kind.
    fn query(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        kind: DepKind,
        dir: DepDir,
        loop_carried: bool,
        lp: &LoopRef,
    ) -> RemedResp {
        match kind {
            DepKind::Memory => self.memdep(ir, src, dst, loop_carried, dir, lp),
            DepKind::Register => self.regdep(ir, src, dst, loop_carried, lp),
            DepKind::Control => self.ctrldep(ir, src, dst, loop_carried, lp),
        }
    }
}
