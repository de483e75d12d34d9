//! Configuration and policy
//!
//! Wire schema, validation into an immutable execution plan, and the
//! namespace policy derived from it.

pub mod policy;
pub mod schema;
pub mod types;
pub mod validator;

pub use validator::parse_config;
