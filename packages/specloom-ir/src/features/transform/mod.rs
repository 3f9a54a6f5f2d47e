//! Plan application.
//!
//! Rewrites the module for the winning loop/plan pair: relocates classified
//! allocation units into the versioned heaps, swaps frees for their
//! kind-specific runtime twins, inserts the worker spawn/join protocol
//! around the loop, marks iteration boundaries inside the outlined body,
//! and materializes the validation checks the chosen remedies demand.

pub mod api;
pub mod checks;
pub mod heaps;
pub mod iter_bounds;
pub mod spawn;
pub mod task;

pub use api::Api;
pub use checks::{apply_remedies, CheckStats};
pub use heaps::HeapRelocator;
pub use iter_bounds::mark_iteration_boundaries;
pub use spawn::insert_invocation;
pub use task::Task;
