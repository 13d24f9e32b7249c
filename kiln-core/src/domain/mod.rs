//! Core domain types
//!
//! These types describe one matrix invocation: the declared targets, the
//! stages each target runs, and what came out of running them.

pub mod log;
pub mod publication;
pub mod run;
pub mod stage;
pub mod target;
