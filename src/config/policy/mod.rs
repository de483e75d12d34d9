//! Policy modules
//!
//! User namespace selection and id-range resolution.

pub mod userns;

pub use userns::*;
