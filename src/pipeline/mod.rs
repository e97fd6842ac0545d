//! Building blocks the orchestrator composes into jobs.
//!
//! Each submodule owns one concern and is tested on its own.
//!
//! ## Data Flow
//!
//! ```text
//! spool bytes ──▶ spool ──▶ artifacts ──▶ tools + runner ──▶ artifacts
//!                (records)  (scratch files) (argv, process)   (page outputs)
//! ```
//!
//! 1. [`spool`]      split a spool buffer into records; pure, never writes
//! 2. [`artifacts`]  per-job scratch directory, removed when the job ends
//! 3. [`tools`]      expand converter argument templates, find numbered outputs
//! 4. [`runner`]     run one converter process under a timeout

pub mod artifacts;
pub mod runner;
pub mod spool;
pub mod tools;
