//! Evidence-backed verdict classification and the report it produces.

pub mod report;
pub mod verdict;

pub use report::{ExecutionReport, ReportEmitter};
pub use verdict::{classify, Verdict, VerdictCause, VerdictClassifier};
