//! Replicar — declarative SQL replication topology deployment.
//!
//! Compiles a topology manifest into an ordered execution plan and runs it
//! against live servers with single-flight deduplication, named mutual
//! exclusion, and cross-process advisory locking.

pub mod actions;
pub mod cli;
pub mod core;
pub mod error;
pub mod sql;
pub mod sync;
