//! Execution control
//!
//! Orchestrates kernel primitives into one supervised run with type-state
//! enforcement of the pre-exec sequence.

pub mod executor;
pub mod preexec;

pub use executor::{ProcessExecutor, RunOutcome};
