//! Utilities
//!
//! File descriptor hygiene for the payload.

pub mod fd_closure;
