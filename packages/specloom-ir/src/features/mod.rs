/// Canonical contexts and allocation units (fold manager)
pub mod context;

/// Heap assignment: AU -> heap family + sub-heap
pub mod classify;

/// Points-to / object-lifetime profiler and the persisted profile
pub mod profile;

/// Program dependence graph and its SCC DAG
pub mod pdg;

/// Dependence-removal oracles and their remedies
pub mod remedies;

/// DOALL and PS-DSWP critics
pub mod critic;

/// Plan application: heap relocation, spawn sites, iteration boundaries
pub mod transform;
