//! Access scope tracking
//!
//! Every read or write through a mutable location is bracketed by
//! `begin_access`/`end_access`. The tracker mirrors the open scopes while a
//! function is lowered so that statically enforced conflicts are rejected
//! here, and hands out the enforcement mode for each kind of storage.

use super::FunctionLowering;
use crate::ast::{Span, Type};
use crate::error::{CompileError, Result};
use crate::mir::{AccessKind, Enforcement, MirInst, MirType, Ownership, Value};

use super::cleanup::{CleanupDepth, CleanupKind};
use super::lvalue::LValue;

/// Identity of the storage an access covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum AccessBase {
    /// Local variable or parameter, by name
    Local(String),
    Global(String),
    /// Stored property reached through a class reference
    ClassProperty(String),
}

impl std::fmt::Display for AccessBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessBase::Local(name) | AccessBase::Global(name) | AccessBase::ClassProperty(name) => {
                write!(f, "{name}")
            }
        }
    }
}

/// Where a location lives, which decides how its accesses are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageClass {
    Stack,
    InOut,
    /// Box of a variable captured by an escaping closure
    Box,
    /// Variable captured by address in a non-escaping closure
    CapturedInOut,
    ClassProperty,
    Global,
}

#[derive(Debug, Clone)]
struct OpenAccess {
    token: Value,
    base: AccessBase,
    kind: AccessKind,
    enforcement: Enforcement,
}

/// Open access scopes of one function, innermost last
#[derive(Debug, Clone, Default)]
pub(crate) struct AccessTracker {
    open: Vec<OpenAccess>,
}

impl AccessTracker {
    pub(crate) fn begin(
        &mut self,
        token: Value,
        base: AccessBase,
        kind: AccessKind,
        enforcement: Enforcement,
        span: Span,
    ) -> Result<()> {
        if enforcement == Enforcement::Static {
            let conflict = self.open.iter().find(|open| {
                open.enforcement == Enforcement::Static
                    && open.base == base
                    && (open.kind.is_mutating() || kind.is_mutating())
            });
            if let Some(open) = conflict {
                return Err(CompileError::exclusivity(
                    format!(
                        "overlapping accesses to '{base}': {kind} access conflicts with an open {} access",
                        open.kind
                    ),
                    span,
                ));
            }
        }
        self.open.push(OpenAccess {
            token,
            base,
            kind,
            enforcement,
        });
        Ok(())
    }

    /// Scopes close innermost first
    pub(crate) fn end(&mut self, token: Value) -> Result<()> {
        match self.open.last() {
            Some(open) if open.token == token => {
                self.open.pop();
                Ok(())
            }
            _ => Err(CompileError::lowering(
                format!("access scope {token} ended out of order"),
                Span::default(),
            )),
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.len()
    }
}

impl<'a> FunctionLowering<'a> {
    pub(crate) fn enforcement(&self, storage: StorageClass) -> Enforcement {
        let checked = |e: Enforcement| if self.env.config.unchecked() { Enforcement::Unsafe } else { e };
        match storage {
            StorageClass::Stack if self.generic => checked(Enforcement::Unknown),
            StorageClass::Stack | StorageClass::InOut => Enforcement::Static,
            StorageClass::CapturedInOut => checked(Enforcement::Unknown),
            StorageClass::Box | StorageClass::ClassProperty | StorageClass::Global => {
                checked(Enforcement::Dynamic)
            }
        }
    }

    /// Open an access scope on `address`; it ends when the enclosing
    /// cleanup scope is left
    pub(crate) fn begin_access(
        &mut self,
        address: Value,
        ty: &Type,
        kind: AccessKind,
        storage: StorageClass,
        base: AccessBase,
        span: Span,
    ) -> Result<Value> {
        let enforcement = self.enforcement(storage);
        let dest = self.ctx.fresh_value(MirType::Address(ty.clone()), Ownership::Address);
        self.access.begin(dest, base, kind, enforcement, span)?;
        self.emit(MirInst::BeginAccess {
            dest,
            address,
            kind,
            enforcement,
        });
        self.push_cleanup(CleanupKind::EndAccess(dest));
        Ok(dest)
    }
}

/// An access opened and closed in separate steps, with other code emitted
/// in between
pub(crate) trait TwoPhaseAccess {
    /// Begin the access and return the address it covers
    fn open(&mut self, fl: &mut FunctionLowering<'_>) -> Result<Value>;

    /// End the access, running writebacks the open registered
    fn close(self, fl: &mut FunctionLowering<'_>) -> Result<()>;
}

/// In-place access to a formed lvalue. Opening may call
/// `materializeForSet` or a getter; closing writes the value back.
pub(crate) struct FormalAccess {
    lvalue: LValue,
    kind: AccessKind,
    depth: Option<CleanupDepth>,
}

impl FormalAccess {
    pub(crate) fn new(lvalue: LValue, kind: AccessKind) -> Self {
        FormalAccess {
            lvalue,
            kind,
            depth: None,
        }
    }
}

impl TwoPhaseAccess for FormalAccess {
    fn open(&mut self, fl: &mut FunctionLowering<'_>) -> Result<Value> {
        if self.depth.is_some() {
            return Err(CompileError::lowering("access opened twice", Span::default()));
        }
        self.depth = Some(fl.cleanup_depth());
        fl.lvalue_address(&self.lvalue, self.kind)
    }

    fn close(self, fl: &mut FunctionLowering<'_>) -> Result<()> {
        match self.depth {
            Some(depth) => fl.pop_cleanups(depth),
            None => Err(CompileError::lowering("access closed before it was opened", Span::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_modify_conflicts() {
        let mut tracker = AccessTracker::default();
        let base = AccessBase::Local("x".into());
        tracker
            .begin(Value(1), base.clone(), AccessKind::Modify, Enforcement::Static, Span::default())
            .unwrap();
        let err = tracker
            .begin(Value(2), base, AccessKind::Read, Enforcement::Static, Span::default())
            .unwrap_err();
        assert!(err.message().contains("overlapping accesses to 'x'"));
    }

    #[test]
    fn test_reads_and_dynamic_do_not_conflict() {
        let mut tracker = AccessTracker::default();
        let base = AccessBase::Local("x".into());
        tracker
            .begin(Value(1), base.clone(), AccessKind::Read, Enforcement::Static, Span::default())
            .unwrap();
        tracker
            .begin(Value(2), base.clone(), AccessKind::Read, Enforcement::Static, Span::default())
            .unwrap();
        let global = AccessBase::Global("g".into());
        tracker
            .begin(Value(3), global.clone(), AccessKind::Modify, Enforcement::Dynamic, Span::default())
            .unwrap();
        tracker
            .begin(Value(4), global, AccessKind::Modify, Enforcement::Dynamic, Span::default())
            .unwrap();
        assert_eq!(tracker.open_count(), 4);
    }

    #[test]
    fn test_end_out_of_order_rejected() {
        let mut tracker = AccessTracker::default();
        let base = AccessBase::Local("x".into());
        tracker
            .begin(Value(1), base.clone(), AccessKind::Read, Enforcement::Static, Span::default())
            .unwrap();
        tracker
            .begin(Value(2), base, AccessKind::Read, Enforcement::Static, Span::default())
            .unwrap();
        assert!(tracker.end(Value(1)).is_err());
        assert!(tracker.end(Value(2)).is_ok());
        assert!(tracker.end(Value(1)).is_ok());
    }
}
