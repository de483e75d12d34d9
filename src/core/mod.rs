//! Process model of one run.
//!
//! The supervisor clones the sandbox init process (`proxy`), which forks
//! and execs the payload. `run_group` owns the init process, `watchdog`
//! enforces the time and process bounds while the supervisor waits.

pub mod proxy;
pub mod run_group;
pub mod supervisor;
pub mod types;
pub mod watchdog;
