//! Dependence-removal oracles.
//!
//! Each remediator answers "can this edge be discharged, and at what
//! validation burden?" producing a `Remedy`. Selection keeps the cheapest
//! remedy per edge, ties broken by the remedy total order, so the outcome
//! is a pure function of the PDG and the profile.

pub mod comm_libs;
pub mod ctrl_spec;
pub mod locality;
pub mod ptr_residue;
pub mod redux;
pub mod remediator;
pub mod remedy;
pub mod selector;
pub mod short_lived;
pub mod txio;

pub use comm_libs::CommutativeLibsRemediator;
pub use ctrl_spec::{ControlSpecInfo, ControlSpecRemediator};
pub use locality::LocalityRemediator;
pub use ptr_residue::PtrResidueRemediator;
pub use redux::ReduxRemediator;
pub use remediator::{DepResult, RemedResp, Remediator};
pub use remedy::{LocalityKind, Remedy};
pub use selector::annotate_pdg;
pub use short_lived::ShortLivedRemediator;
pub use txio::TxIoRemediator;
