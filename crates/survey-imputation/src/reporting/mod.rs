//! Report generation module.
//!
//! Writes the imputed table and QA tables as CSV, and summarises a run as a
//! [`RunSummary`] for JSON output (`--json`) or a report file
//! (`--emit-report`).

mod generator;

pub use generator::{ReportGenerator, RunSummary};
