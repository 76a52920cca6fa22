//! Runtime errors for the interpreter

use std::fmt;

/// Runtime error during interpretation
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: TrapKind,
    pub message: String,
}

/// Kinds of runtime errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Callee not present in the module
    UndefinedFunction,
    /// Global without storage
    UndefinedGlobal,
    /// Value used before definition, or of the wrong shape
    TypeError,
    /// Argument count mismatch
    ArityMismatch,
    /// Read of uninitialized or freed memory
    InvalidMemory,
    /// Reference count fell below zero, or a dead object was touched
    RefcountUnderflow,
    /// `cond_fail` fired (arithmetic overflow and friends)
    ConditionFailed,
    /// Conflicting accesses to the same storage
    ExclusivityViolation,
    /// `try!` or `!` found an error or nil
    UnexpectedError,
    UnexpectedNil,
    /// `unreachable` executed
    Unreachable,
    /// No vtable or witness table entry
    DispatchFailure,
    /// A global initializer re-entered itself
    RecursiveInitialization,
    /// Error escaped the entry function
    UncaughtError,
    /// Too many nested calls
    StackOverflow,
}

impl RuntimeError {
    pub fn new(kind: TrapKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
        }
    }

    pub fn undefined_function(name: &str) -> Self {
        RuntimeError::new(TrapKind::UndefinedFunction, format!("undefined function: {name}"))
    }

    pub fn undefined_global(name: &str) -> Self {
        RuntimeError::new(TrapKind::UndefinedGlobal, format!("undefined global: {name}"))
    }

    pub fn type_error(expected: &str, got: &str) -> Self {
        RuntimeError::new(
            TrapKind::TypeError,
            format!("type error: expected {expected}, got {got}"),
        )
    }

    pub fn arity_mismatch(name: &str, expected: usize, got: usize) -> Self {
        RuntimeError::new(
            TrapKind::ArityMismatch,
            format!("{name}: expected {expected} arguments, got {got}"),
        )
    }

    pub fn invalid_memory(what: impl fmt::Display) -> Self {
        RuntimeError::new(TrapKind::InvalidMemory, format!("invalid memory access: {what}"))
    }

    pub fn refcount(what: impl fmt::Display) -> Self {
        RuntimeError::new(TrapKind::RefcountUnderflow, format!("reference counting error: {what}"))
    }

    pub fn condition_failed(message: &str) -> Self {
        RuntimeError::new(TrapKind::ConditionFailed, format!("fatal error: {message}"))
    }

    pub fn exclusivity(existing: impl fmt::Display, requested: impl fmt::Display) -> Self {
        RuntimeError::new(
            TrapKind::ExclusivityViolation,
            format!("simultaneous accesses: {requested} conflicts with an active {existing} access"),
        )
    }

    pub fn dispatch(what: impl fmt::Display) -> Self {
        RuntimeError::new(TrapKind::DispatchFailure, format!("no implementation for {what}"))
    }

    pub fn stack_overflow() -> Self {
        RuntimeError::new(TrapKind::StackOverflow, "stack overflow: call depth exceeded")
    }

    /// Whether this is a program trap rather than a malformed-module error
    pub fn is_trap(&self) -> bool {
        matches!(
            self.kind,
            TrapKind::ConditionFailed
                | TrapKind::ExclusivityViolation
                | TrapKind::UnexpectedError
                | TrapKind::UnexpectedNil
                | TrapKind::Unreachable
                | TrapKind::RecursiveInitialization
                | TrapKind::UncaughtError
                | TrapKind::StackOverflow
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for interpreter operations
pub type InterpResult<T> = Result<T, RuntimeError>;
