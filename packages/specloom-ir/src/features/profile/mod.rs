//! Points-to / object-lifetime profiling.
//!
//! The profiler consumes the event stream of an instrumented run (allocation
//! lifecycle, context entry/exit, pointer observations, loaded values) and
//! emits the textual profile; the parser reads that profile back into
//! fold-manager terms through a semantic-action trait, so the planner both
//! produces and consumes the same artifact.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod ports;

pub use application::profiler::{Profiler, MAGIC_INVALID};
pub use domain::samples::{PtrResidueSet, SampleSet, MAX_INT_OBS, MAX_OBJ_OBS, MAX_PTR_OBS};
pub use infrastructure::parser::ProfileParser;
pub use infrastructure::writer::write_profile;
pub use ports::{ProfileInfo, ProfileInfoBuilder, SemanticAction};
