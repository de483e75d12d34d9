//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here.
//! Dependency direction: signal -> namespace -> capabilities -> credentials -> mount -> cgroup -> rlimit

pub mod capabilities;
pub mod credentials;
pub mod cgroup;
pub mod mount;
pub mod namespace;
pub mod rlimit;
pub mod signal;
