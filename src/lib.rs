//! runbox: run one untrusted command in a throwaway sandbox and classify how it ended
//!
//! A JSON run configuration goes in, one JSON report comes out. The command runs
//! inside fresh namespaces on an overlay or read-only root, under rlimits and a
//! per-run cgroup, watched by a wall/user time watchdog.
//!
//! # Architecture
//!
//! ## Configuration ([`config`])
//! - [`config::schema`]: Versioned wire document, legacy shapes as explicit variants
//! - [`config::validator`]: Validation into an immutable [`ExecutionConfig`]
//! - [`config::policy`]: User namespace policy and id map rendering
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: Namespace flags, capability gate, id maps
//! - [`kernel::mount`]: Mount plan and in-namespace root assembly
//! - [`kernel::cgroup`]: v2/v1 backends and the owned run cgroup
//! - [`kernel::rlimit`]: Per-process resource limits
//! - [`kernel::capabilities`], [`kernel::credentials`]: Privilege drop
//! - [`kernel::signal`]: Runner-side cancellation
//!
//! ## Process Model ([`core`])
//! - [`core::supervisor`]: supervisor -> init (PID 1) -> payload launch
//! - [`core::proxy`]: The init process that assembles the root and reaps everything
//! - [`core::run_group`]: Owned kill-once/reap-once handle for the run
//! - [`core::watchdog`]: Wall/user time and pids polling
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: Type-state enforced pre-exec ordering
//! - [`exec::executor`]: One run from config to report
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::verdict`]: Evidence-backed classification with fixed precedence
//! - [`verdict::report`]: The JSON report

// Configuration & Policy
pub mod config;

// Kernel Primitives
pub mod kernel;

// Process model
pub mod core;

// Execution Control
pub mod exec;

// Evidence & Verdict
pub mod verdict;

// Utilities
pub mod utils;

// CLI entrypoint for the runbox binary
pub mod cli;

pub use config::types::*;
pub use exec::preexec;
