//! Command-line entry points.

pub mod benchmark;
pub mod run;
