//! Deferred terminal output: calls whose only side effect is writing to a
//! stream can be suspended and replayed in commit order, so loop-carried
//! dependences against them vanish.

use super::remediator::{RemedResp, Remediator};
use super::remedy::Remedy;
use crate::features::pdg::DepDir;
use crate::shared::models::{InstrId, LoopRef, ModuleIr};
use tracing::debug;

/// Output calls the TXIO runtime knows how to defer.
pub fn is_txio_fcn(ir: &ModuleIr, instr: InstrId) -> bool {
    match ir.instr(instr).callee() {
        Some(name) => matches!(
            name,
            "vfprintf"
                | "vprintf"
                | "fprintf"
                | "printf"
                | "fputs"
                | "puts"
                | "fputc"
                | "putc"
                | "putchar"
                | "fflush"
        ),
        None => false,
    }
}

#[derive(Default)]
pub struct TxIoRemediator {
    pub num_removed: u64,
}

impl TxIoRemediator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Remediator for TxIoRemediator {
    fn name(&self) -> &'static str {
        "txio-remediator"
    }

    fn memdep(
        &mut self,
        ir: &ModuleIr,
        src: InstrId,
        dst: InstrId,
        loop_carried: bool,
        _dir: DepDir,
        _lp: &LoopRef,
    ) -> RemedResp {
        // Intra-iteration ordering against output calls is preserved by the
        // runtime; only cross-iteration edges can be discharged.
        if !loop_carried {
            return RemedResp::dep();
        }

        if is_txio_fcn(ir, src) {
            self.num_removed += 1;
            debug!(?src, "deferred-output call sources no cross-iteration dependence");
            return RemedResp::no_dep(Remedy::TxIo { print_instr: src });
        }
        if is_txio_fcn(ir, dst) {
            self.num_removed += 1;
            debug!(?dst, "deferred-output call sinks no cross-iteration dependence");
            return RemedResp::no_dep(Remedy::TxIo { print_instr: dst });
        }

        RemedResp::dep()
    }
}
