//! Kiln Core
//!
//! Core types and abstractions for the Kiln build-matrix orchestrator.
//!
//! This crate contains:
//! - Domain types: targets, stage definitions and results, pipeline runs,
//!   publication records
//! - Error kinds shared by the runner and the CLI
//! - Command template expansion
//!
//! Nothing in here performs I/O. Execution lives in `kiln-runner`.

pub mod domain;
pub mod error;
pub mod template;
