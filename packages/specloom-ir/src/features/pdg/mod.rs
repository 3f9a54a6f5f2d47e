//! Program dependence graph and its SCC DAG.
//!
//! The PDG arrives already built (construction belongs to the host
//! toolkit); this module is its queryable, annotatable form. Edges carry
//! the dependence classification plus the remedies that can discharge
//! them; the SCC DAG is derived on demand from whichever version of the
//! graph (pessimistic or optimistic) the critic is working with.

pub mod graph;
pub mod sccdag;

pub use graph::{DepDir, DepEdge, DepGraph, DepKind, EdgeId};
pub use sccdag::{Scc, SccDag, SccId};
