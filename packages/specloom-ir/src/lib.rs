/*
 * Specloom IR - speculative parallelization planner
 *
 * Feature-First Architecture:
 * - shared/      : Common models (module IR, loops, values)
 * - features/    : Vertical slices (context -> profile -> classify -> pdg
 *                  -> remedies -> critic -> transform)
 * - session      : Explicit carrier for state the analyses share
 *
 * Given a program dependence graph for a hot loop, the crate selects and
 * combines speculative remedies that discharge dependence edges, derives a
 * DOALL or PS-DSWP plan that respects the surviving edges, and rewrites the
 * module so the loop runs under the specloom runtime.
 */

#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::new_without_default)]
#![allow(clippy::module_inception)]

/// Shared models and utilities
pub mod shared;

/// Feature modules
pub mod features;

/// Error types
pub mod errors;

/// Per-run analysis state (canonical pools, exclusions, knobs)
pub mod session;

pub use errors::{Result, SpecloomError};
pub use session::Session;
