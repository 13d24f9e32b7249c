//! Kiln Lua Infrastructure
//!
//! Evaluates the declarative build matrix (`matrix.lua`) in a restricted
//! sandbox and turns it into validated [`Target`] values:
//! - Sandbox with the `matrix` helper module
//! - Matrix parsing into domain targets
//! - Validation of tags, stages, templates and the dependency graph

pub mod parser;
pub mod sandbox;
pub mod validate;

pub use kiln_core::domain::target::Target;
pub use parser::{parse_matrix, parse_matrix_file};
pub use sandbox::create_sandbox;
pub use validate::validate_matrix;
