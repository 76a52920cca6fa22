//! Reference interpreter for lowered IR
//!
//! Runs functions of a [`MirModule`](crate::mir::MirModule) with explicit
//! reference counts, dynamic exclusivity enforcement and one-time global
//! initialization, then reports storage that was never released.

mod error;
mod eval;
mod heap;
mod once;
mod value;

pub use error::{InterpResult, RuntimeError, TrapKind};
pub use eval::{Interpreter, Outcome};
pub use heap::{HeapStats, LeakReport, ObjectKind};
pub use once::{OnceClaim, OnceFlag};
pub use value::{Addr, CellId, ObjectId, Proj, RtValue};
