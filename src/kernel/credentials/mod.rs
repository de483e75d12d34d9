//! UID/GID transitions for the payload identity.
//!
//! setresgid is always called before setresuid.

mod transition;
mod validation;

pub use transition::{become_namespace_root, transition_to_unprivileged};
pub use validation::validate_ids;
