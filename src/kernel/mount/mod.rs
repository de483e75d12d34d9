//! Filesystem isolation and mount management
//!
//! `plan` is decided at config time, `filesystem` executes it inside the
//! sandbox mount namespace.

pub mod filesystem;
pub mod plan;

pub use filesystem::MountAssembler;
pub use plan::{MountPlan, MountStep};
