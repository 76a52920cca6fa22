//! OSSA lowering library
//!
//! Lowers a resolved, type-checked declaration graph into an ownership-SSA
//! intermediate representation with explicit reference counting, access
//! scopes and dispatch tables.

pub mod ast;
pub mod config;
pub mod driver;
pub mod error;
pub mod filecheck;
pub mod interp;
pub mod lower;
pub mod mir;
pub mod tables;
pub mod types;

pub use ast::Span;
pub use config::LoweringConfig;
pub use driver::{ModuleStats, load_module, lower_module, parse_module};
pub use error::{CompileError, Result};
pub use mir::{MirModule, format_module};
