//! Cleanup stack
//!
//! Everything that must be ended when a scope exits registers a cleanup:
//! owned temporaries, stack slots, access scopes, borrows, pins and
//! writebacks. Leaving a scope normally pops its cleanups. Branching out of
//! a scope (a throw edge, a `return`) emits them without popping, so one
//! cleanup can run on several exit edges.

use super::lvalue::Writeback;
use super::FunctionLowering;
use crate::error::Result;
use crate::mir::{MirInst, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CleanupDepth(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CleanupHandle(usize);

#[derive(Debug, Clone)]
pub(crate) enum CleanupKind {
    DestroyValue(Value),
    DestroyAddr(Value),
    DeallocStack(Value),
    EndAccess(Value),
    EndBorrow { borrowed: Value, original: Value },
    Unpin(Value),
    Writeback(Box<Writeback>),
}

#[derive(Debug, Clone)]
struct Entry {
    kind: CleanupKind,
    active: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CleanupStack {
    entries: Vec<Entry>,
}

impl CleanupStack {
    pub(crate) fn depth(&self) -> CleanupDepth {
        CleanupDepth(self.entries.len())
    }

    fn push(&mut self, kind: CleanupKind) -> CleanupHandle {
        self.entries.push(Entry { kind, active: true });
        CleanupHandle(self.entries.len() - 1)
    }

    /// Ownership moved elsewhere; the cleanup will not run
    fn forward(&mut self, handle: CleanupHandle) {
        if let Some(entry) = self.entries.get_mut(handle.0) {
            entry.active = false;
        }
    }

    fn is_active(&self, handle: CleanupHandle) -> bool {
        self.entries.get(handle.0).is_some_and(|e| e.active)
    }

    /// Active cleanups above `depth`, innermost first
    fn active_above(&self, depth: CleanupDepth) -> Vec<CleanupKind> {
        self.entries
            .iter()
            .skip(depth.0)
            .rev()
            .filter(|e| e.active)
            .map(|e| e.kind.clone())
            .collect()
    }

    fn truncate(&mut self, depth: CleanupDepth) {
        self.entries.truncate(depth.0);
    }
}

impl<'a> FunctionLowering<'a> {
    pub(crate) fn push_cleanup(&mut self, kind: CleanupKind) -> CleanupHandle {
        self.cleanups.push(kind)
    }

    pub(crate) fn forward_cleanup(&mut self, handle: CleanupHandle) {
        self.cleanups.forward(handle);
    }

    pub(crate) fn cleanup_is_active(&self, handle: CleanupHandle) -> bool {
        self.cleanups.is_active(handle)
    }

    pub(crate) fn cleanup_depth(&self) -> CleanupDepth {
        self.cleanups.depth()
    }

    /// Leave a scope normally: run and discard every cleanup above `depth`.
    ///
    /// In unreachable code the cleanups are discarded without emission.
    pub(crate) fn pop_cleanups(&mut self, depth: CleanupDepth) -> Result<()> {
        let pending = self.cleanups.active_above(depth);
        self.cleanups.truncate(depth);
        for kind in pending {
            if !self.ctx.is_terminated() {
                self.emit_cleanup(&kind)?;
            }
            if let CleanupKind::EndAccess(access) = kind {
                self.access.end(access)?;
            }
        }
        Ok(())
    }

    /// Run the cleanups above `depth` on an edge leaving the scope, keeping
    /// them registered for the remaining paths
    pub(crate) fn emit_branch_cleanups(&mut self, depth: CleanupDepth) -> Result<()> {
        for kind in self.cleanups.active_above(depth) {
            self.emit_cleanup(&kind)?;
        }
        Ok(())
    }

    fn emit_cleanup(&mut self, kind: &CleanupKind) -> Result<()> {
        match kind {
            CleanupKind::DestroyValue(operand) => self.emit(MirInst::DestroyValue { operand: *operand }),
            CleanupKind::DestroyAddr(address) => self.emit(MirInst::DestroyAddr { address: *address }),
            CleanupKind::DeallocStack(operand) => self.emit(MirInst::DeallocStack { operand: *operand }),
            CleanupKind::EndAccess(access) => self.emit(MirInst::EndAccess { access: *access }),
            CleanupKind::EndBorrow { borrowed, original } => self.emit(MirInst::EndBorrow {
                borrowed: *borrowed,
                original: *original,
            }),
            CleanupKind::Unpin(pin) => self.emit(MirInst::StrongUnpin { operand: *pin }),
            CleanupKind::Writeback(writeback) => return self.emit_writeback(writeback),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_above_is_innermost_first() {
        let mut stack = CleanupStack::default();
        let outer = stack.push(CleanupKind::DeallocStack(Value(0)));
        let depth = stack.depth();
        stack.push(CleanupKind::DestroyValue(Value(1)));
        let forwarded = stack.push(CleanupKind::DestroyValue(Value(2)));
        stack.push(CleanupKind::EndAccess(Value(3)));
        stack.forward(forwarded);

        let pending = stack.active_above(depth);
        assert_eq!(pending.len(), 2);
        assert!(matches!(pending[0], CleanupKind::EndAccess(Value(3))));
        assert!(matches!(pending[1], CleanupKind::DestroyValue(Value(1))));
        assert!(stack.is_active(outer));
        assert!(!stack.is_active(forwarded));

        stack.truncate(depth);
        assert_eq!(stack.depth(), CleanupDepth(1));
    }
}
