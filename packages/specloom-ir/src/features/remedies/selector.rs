//! Remedy selection: annotate every PDG edge with the remedies that
//! discharge it, cheapest first.
//!
//! The sweep runs in ascending edge-id order so that stateful oracles
//! (private-access reuse in the locality remediator) see a deterministic
//! sequence; the chosen remedy per edge is then a pure function of the
//! PDG and the profile.

use super::remediator::{DepResult, Remediator};
use super::remedy::Remedy;
use crate::features::pdg::DepGraph;
use crate::shared::models::{LoopRef, ModuleIr};
use tracing::debug;

/// Query every remediator about every edge; store the surviving remedies
/// sorted by (cost, total order). Returns the number of removable edges.
pub fn annotate_pdg(
    pdg: &mut DepGraph,
    remediators: &mut [&mut dyn Remediator],
    ir: &ModuleIr,
    lp: &LoopRef,
) -> usize {
    let mut num_removable = 0;
    for edge_id in pdg.edges() {
        let (src, dst) = pdg.endpoints(edge_id);
        let (kind, dir, loop_carried) = {
            let e = pdg.edge(edge_id);
            (e.kind, e.dir, e.loop_carried)
        };

        let mut remedies: Vec<Remedy> = Vec::new();
        for r in remediators.iter_mut() {
            let resp = r.query(ir, src, dst, kind, dir, loop_carried, lp);
            if resp.result == DepResult::NoDep {
                if let Some(remedy) = resp.remedy {
                    debug!(
                        remediator = r.name(),
                        remedy = remedy.name(),
                        cost = remedy.cost(),
                        ?src,
                        ?dst,
                        "edge removable"
                    );
                    remedies.push(remedy);
                }
            }
        }

        remedies.sort_by(|a, b| a.cost().cmp(&b.cost()).then_with(|| a.compare(b)));
        remedies.dedup();
        if !remedies.is_empty() {
            num_removable += 1;
        }
        pdg.edge_mut(edge_id).remedies = remedies;
    }
    num_removable
}
