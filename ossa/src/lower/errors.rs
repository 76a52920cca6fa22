//! Error handling: `try`, `try?`, `try!` and `do`/`catch`
//!
//! A throwing call branches its error to the innermost [`ThrowDest`]. Each
//! handler records the cleanup depth it was installed at, so the error edge
//! destroys exactly the temporaries and bindings created since.

use super::cleanup::{CleanupDepth, CleanupKind};
use super::{object_type, Binding, FunctionLowering, Managed, ThrowDest};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;

impl<'a> FunctionLowering<'a> {
    pub(crate) fn emit_try(&mut self, mode: TryMode, inner: &Expr, ty: &Type, span: Span) -> Result<Managed> {
        match mode {
            TryMode::Plain => self.emit_rvalue(inner),
            TryMode::Optional | TryMode::Forced => self.emit_try_handled(mode, inner, ty, span),
        }
    }

    /// `try?` and `try!`: install a local handler around `inner`
    fn emit_try_handled(&mut self, mode: TryMode, inner: &Expr, ty: &Type, span: Span) -> Result<Managed> {
        let wrap = mode == TryMode::Optional;
        let fail = self.ctx.fresh_label();
        let done = self.ctx.fresh_label();
        let slot = self.is_address_only(ty).then(|| self.alloc_temp(ty));
        let depth = self.cleanup_depth();
        self.throw_dests.push(ThrowDest {
            label: fail.clone(),
            depth,
            used: false,
        });
        let normal = self.emit_try_body(inner, ty, slot, wrap, depth);
        let handler = self.throw_dests.pop();
        let value = normal?;
        self.ctx.finish_block(Terminator::Br {
            target: done.clone(),
            args: value.into_iter().collect(),
        });

        if handler.is_some_and(|h| h.used) {
            let error = self.new_value(MirType::Object(Type::error()), Ownership::Owned);
            self.ctx.start_block(fail, vec![error]);
            if wrap {
                self.destroy_value(error);
                let args = match slot {
                    Some(slot) => {
                        self.emit(MirInst::InjectEnumAddr {
                            address: slot,
                            case: CaseRef::none(),
                        });
                        Vec::new()
                    }
                    None => vec![self.none_value(ty)],
                };
                self.ctx.finish_block(Terminator::Br {
                    target: done.clone(),
                    args,
                });
            } else {
                tracing::trace!(function = %self.name, %span, "try! traps on error");
                self.builtin("unexpectedError".to_string(), vec![error], Type::unit());
                self.ctx.finish_block(Terminator::Unreachable);
            }
        }

        match slot {
            Some(slot) => {
                self.ctx.start_block(done, Vec::new());
                Ok(self.manage(slot, ty.clone()))
            }
            None => {
                let result = self.new_object(ty);
                self.ctx.start_block(done, vec![result]);
                Ok(self.manage(result, ty.clone()))
            }
        }
    }

    /// Normal path of a handled `try`; returns the value to branch with
    fn emit_try_body(
        &mut self,
        inner: &Expr,
        ty: &Type,
        slot: Option<Value>,
        wrap: bool,
        depth: CleanupDepth,
    ) -> Result<Option<Value>> {
        if let Some(slot) = slot {
            let target = if wrap {
                let payload = self.new_address(&inner.ty);
                self.emit(MirInst::InitEnumDataAddr {
                    dest: payload,
                    address: slot,
                    case: CaseRef::some(),
                });
                payload
            } else {
                slot
            };
            self.emit_into(inner, target)?;
            self.pop_cleanups(depth)?;
            if wrap {
                self.emit(MirInst::InjectEnumAddr {
                    address: slot,
                    case: CaseRef::some(),
                });
            }
            return Ok(None);
        }
        let value = self.emit_rvalue(inner)?;
        let value = value.forward(self);
        self.pop_cleanups(depth)?;
        if !wrap {
            return Ok(Some(value));
        }
        let dest = self.new_object(ty);
        self.emit(MirInst::Enum {
            dest,
            case: CaseRef::some(),
            payload: Some(value),
        });
        Ok(Some(dest))
    }

    pub(crate) fn emit_do_catch(&mut self, body: &[Stmt], catches: &[CatchClause]) -> Result<()> {
        let catch_label = self.ctx.fresh_label();
        let after = self.ctx.fresh_label();
        let depth = self.cleanup_depth();
        self.throw_dests.push(ThrowDest {
            label: catch_label.clone(),
            depth,
            used: false,
        });
        let falls_through = self.emit_block(body);
        let handler = self.throw_dests.pop();
        let mut reaches_after = falls_through?;
        if reaches_after {
            self.branch_to(&after);
        }
        if handler.is_some_and(|h| h.used) {
            let error = self.new_value(MirType::Object(Type::error()), Ownership::Owned);
            self.ctx.start_block(catch_label, vec![error]);
            reaches_after |= self.emit_catch_clauses(error, catches, &after)?;
        } else {
            tracing::debug!(function = %self.name, "do body cannot throw; catch clauses dropped");
        }
        if reaches_after {
            self.ctx.start_block(after, Vec::new());
        }
        Ok(())
    }

    /// Try each clause in order; an error no clause matches is rethrown.
    /// Returns true when some clause falls through to `after`.
    fn emit_catch_clauses(&mut self, error: Value, catches: &[CatchClause], after: &str) -> Result<bool> {
        let mut reaches_after = false;
        for clause in catches {
            let Some(ty) = &clause.ty else {
                let scope = self.push_scope();
                self.manage(error, Type::error());
                if let Some(name) = &clause.binding {
                    self.bind(
                        name.as_str(),
                        Binding::Value {
                            value: error,
                            ty: Type::error(),
                        },
                    );
                }
                self.emit_stmts(&clause.body)?;
                self.pop_scope(scope)?;
                if !self.ctx.is_terminated() {
                    self.branch_to(after);
                    reaches_after = true;
                }
                return Ok(reaches_after);
            };
            if self.is_address_only(ty) {
                return Err(CompileError::lowering(
                    format!("cannot catch errors of address-only type {ty}"),
                    Span::default(),
                ));
            }
            let success = self.ctx.fresh_label();
            let failure = self.ctx.fresh_label();
            self.ctx.finish_block(Terminator::CheckedCastBranch {
                operand: error,
                ty: ty.clone(),
                success: success.clone(),
                failure: failure.clone(),
            });
            let ownership = if self.is_trivial(ty) {
                Ownership::Trivial
            } else {
                Ownership::Guaranteed
            };
            let cast = self.new_value(object_type(ty), ownership);
            self.ctx.start_block(success, vec![cast]);
            let scope = self.push_scope();
            self.push_cleanup(CleanupKind::DestroyValue(error));
            if let Some(name) = &clause.binding {
                let copy = self.copy_value(cast, ty);
                let bound = self.manage(copy, ty.clone());
                self.bind(
                    name.as_str(),
                    Binding::Value {
                        value: bound.value,
                        ty: ty.clone(),
                    },
                );
            }
            self.emit_stmts(&clause.body)?;
            self.pop_scope(scope)?;
            if !self.ctx.is_terminated() {
                self.branch_to(after);
                reaches_after = true;
            }
            self.ctx.start_block(failure, Vec::new());
        }
        self.emit_throw_edge(error, Span::default())?;
        Ok(reaches_after)
    }
}
