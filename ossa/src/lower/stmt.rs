//! Statements
//!
//! Every statement is a full expression: temporaries it creates are
//! destroyed before the next statement starts. Bindings introduced by `let`
//! and `var` keep their cleanups in the enclosing lexical scope.

use super::access::{FormalAccess, TwoPhaseAccess};
use super::cleanup::CleanupKind;
use super::{AddressKind, Binding, FunctionLowering, ReturnHook};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::types::ArgConvention;

/// Hidden local holding a `for` loop's iterator
const ITERATOR: &str = "$iterator";

impl<'a> FunctionLowering<'a> {
    pub(crate) fn emit_stmts(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            if self.ctx.is_terminated() {
                tracing::debug!(function = %self.name, "skipping unreachable statements");
                break;
            }
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Let { pattern, init } => self.emit_let(pattern, init),
            Stmt::Var { name, init } => self.emit_var(name, init),
            Stmt::Expr(expr) => {
                let depth = self.cleanup_depth();
                self.emit_ignored(expr)?;
                self.pop_cleanups(depth)
            }
            Stmt::Return(value) => self.emit_return_stmt(value.as_ref()),
            Stmt::Throw(error) => {
                if !error.ty.is_error_existential() {
                    return Err(CompileError::lowering(
                        format!("thrown value must be an Error, found {}", error.ty),
                        error.span,
                    ));
                }
                let depth = self.cleanup_depth();
                let value = self.emit_rvalue(error)?;
                let value = value.forward(self);
                self.emit_throw_edge(value, error.span)?;
                self.pop_cleanups(depth)
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => self.emit_if(cond, then_body, else_body),
            Stmt::While { cond, body } => self.emit_while(cond, body),
            Stmt::For {
                pattern,
                sequence,
                iterator,
                body,
            } => self.emit_for(pattern, sequence, iterator, body),
            Stmt::Do { body, catches } => self.emit_do_catch(body, catches),
        }
    }

    fn emit_let(&mut self, pattern: &Pattern, init: &Expr) -> Result<()> {
        if self.is_address_only(&init.ty) {
            let slot = self.alloc_temp(&init.ty);
            let depth = self.cleanup_depth();
            self.emit_into(init, slot)?;
            self.pop_cleanups(depth)?;
            let value = self.manage(slot, init.ty.clone());
            return self.bind_pattern(pattern, value);
        }
        let depth = self.cleanup_depth();
        let value = self.emit_rvalue(init)?;
        let value = value.forward(self);
        self.pop_cleanups(depth)?;
        let value = self.manage(value, init.ty.clone());
        self.bind_pattern(pattern, value)
    }

    fn emit_var(&mut self, name: &str, init: &Expr) -> Result<()> {
        let ty = init.ty.clone();
        if self.boxed_vars.contains(name) {
            let boxed = self.new_value(MirType::Object(Type::Box(Box::new(ty.clone()))), Ownership::Owned);
            self.emit(MirInst::AllocBox { dest: boxed });
            let address = self.new_address(&ty);
            self.emit(MirInst::ProjectBox {
                dest: address,
                operand: boxed,
            });
            self.push_cleanup(CleanupKind::DestroyValue(boxed));
            let depth = self.cleanup_depth();
            self.emit_into(init, address)?;
            self.pop_cleanups(depth)?;
            self.bind(
                name,
                Binding::Address {
                    address,
                    ty,
                    kind: AddressKind::Box,
                    container: Some(boxed),
                },
            );
            return Ok(());
        }
        let slot = self.alloc_temp(&ty);
        let depth = self.cleanup_depth();
        self.emit_into(init, slot)?;
        self.pop_cleanups(depth)?;
        self.push_cleanup(CleanupKind::DestroyAddr(slot));
        self.bind(
            name,
            Binding::Address {
                address: slot,
                ty,
                kind: AddressKind::Stack { mutable: true },
                container: None,
            },
        );
        Ok(())
    }

    fn emit_return_stmt(&mut self, value: Option<&Expr>) -> Result<()> {
        let depth = self.cleanup_depth();
        match (value, self.indirect_result) {
            (Some(expr), Some(out)) => {
                self.emit_into(expr, out)?;
                let unit = self.unit();
                self.emit_return(unit)?;
            }
            (Some(expr), None) => {
                let value = self.emit_rvalue(expr)?;
                let is_address = self.is_address(value.value);
                let mut result = value.forward(self);
                if is_address {
                    result = self.load_take(result, &expr.ty);
                }
                if self.return_hook == Some(ReturnHook::PinOwner) {
                    result = self.pin_owner(result, &expr.ty);
                }
                self.emit_return(result)?;
            }
            (None, _) => {
                let unit = self.unit();
                self.emit_return(unit)?;
            }
        }
        self.pop_cleanups(depth)
    }

    /// Swap the owner of an addressor result for a pin on it
    fn pin_owner(&mut self, result: Value, ty: &Type) -> Value {
        let parts = self.destructure(result, ty);
        let token_ty = Type::optional(Type::NativeObject);
        let token = self.new_value(MirType::Object(token_ty), Ownership::Owned);
        self.emit(MirInst::StrongPin {
            dest: token,
            operand: parts[1],
        });
        self.destroy_value(parts[1]);
        let result_ty = self.result_ty.clone();
        let dest = self.new_object(&result_ty);
        self.emit(MirInst::Tuple {
            dest,
            elements: vec![parts[0], token],
        });
        dest
    }

    fn emit_condition(&mut self, cond: &Expr) -> Result<Value> {
        if cond.ty != Type::Bool {
            return Err(CompileError::lowering(
                format!("condition must be Bool, found {}", cond.ty),
                cond.span,
            ));
        }
        let depth = self.cleanup_depth();
        let value = self.emit_rvalue(cond)?.value;
        self.pop_cleanups(depth)?;
        Ok(value)
    }

    /// Lower `body` in its own scope; true when control falls out of it
    pub(super) fn emit_block(&mut self, body: &[Stmt]) -> Result<bool> {
        let scope = self.push_scope();
        self.emit_stmts(body)?;
        self.pop_scope(scope)?;
        Ok(!self.ctx.is_terminated())
    }

    pub(super) fn branch_to(&mut self, target: &str) {
        self.ctx.finish_block(Terminator::Br {
            target: target.to_string(),
            args: Vec::new(),
        });
    }

    fn emit_if(&mut self, cond: &Expr, then_body: &[Stmt], else_body: &[Stmt]) -> Result<()> {
        let cond = self.emit_condition(cond)?;
        let then_label = self.ctx.fresh_label();
        let else_label = self.ctx.fresh_label();
        let merge = self.ctx.fresh_label();
        self.ctx.finish_block(Terminator::CondBr {
            cond,
            then_target: then_label.clone(),
            else_target: else_label.clone(),
        });
        let mut reaches_merge = false;
        for (label, body) in [(then_label, then_body), (else_label, else_body)] {
            self.ctx.start_block(label, Vec::new());
            if self.emit_block(body)? {
                self.branch_to(&merge);
                reaches_merge = true;
            }
        }
        if reaches_merge {
            self.ctx.start_block(merge, Vec::new());
        }
        Ok(())
    }

    fn emit_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<()> {
        let header = self.ctx.fresh_label();
        let body_label = self.ctx.fresh_label();
        let exit = self.ctx.fresh_label();
        self.branch_to(&header);
        self.ctx.start_block(header.clone(), Vec::new());
        let cond = self.emit_condition(cond)?;
        self.ctx.finish_block(Terminator::CondBr {
            cond,
            then_target: body_label.clone(),
            else_target: exit.clone(),
        });
        self.ctx.start_block(body_label, Vec::new());
        if self.emit_block(body)? {
            self.branch_to(&header);
        }
        self.ctx.start_block(exit, Vec::new());
        Ok(())
    }

    fn emit_for(&mut self, pattern: &Pattern, sequence: &Expr, info: &IteratorInfo, body: &[Stmt]) -> Result<()> {
        let span = sequence.span;
        let next_ty = self.tl().function_type(&info.next)?.clone();
        if next_ty.sig.params.first().map(|p| p.convention) != Some(ArgConvention::InOut) {
            return Err(CompileError::lowering(
                format!("{} must take the iterator inout", info.next),
                span,
            ));
        }
        let outer = self.push_scope();
        let iterator = self.alloc_temp(&info.iterator_ty);
        let make = Expr::call(info.make_iterator.clone(), vec![sequence.clone()], info.iterator_ty.clone()).with_span(span);
        let depth = self.cleanup_depth();
        self.emit_into(&make, iterator)?;
        self.pop_cleanups(depth)?;
        self.push_cleanup(CleanupKind::DestroyAddr(iterator));
        self.bind(
            ITERATOR,
            Binding::Address {
                address: iterator,
                ty: info.iterator_ty.clone(),
                kind: AddressKind::Stack { mutable: true },
                container: None,
            },
        );

        let optional_ty = Type::optional(info.element_ty.clone());
        let optional_slot = self
            .is_address_only(&info.element_ty)
            .then(|| self.alloc_temp(&optional_ty));
        let header = self.ctx.fresh_label();
        let body_label = self.ctx.fresh_label();
        let exit = self.ctx.fresh_label();
        self.branch_to(&header);
        self.ctx.start_block(header.clone(), Vec::new());

        let lv = self.form_lvalue(&Expr::var(ITERATOR, info.iterator_ty.clone()).with_span(span))?;
        let mut access = FormalAccess::new(lv, AccessKind::Modify);
        let address = access.open(self)?;
        let next = self.function_ref_typed(&info.next, next_ty.clone());
        let element = self.emit_apply(next, &next_ty, optional_slot, vec![address], &optional_ty, span)?;
        access.close(self)?;

        let cases = vec![(CaseRef::some(), body_label.clone()), (CaseRef::none(), exit.clone())];
        let scope = match optional_slot {
            Some(slot) => {
                self.ctx.finish_block(Terminator::SwitchEnumAddr {
                    address: slot,
                    cases,
                    default: None,
                });
                self.ctx.start_block(body_label, Vec::new());
                let scope = self.push_scope();
                let payload = self.new_address(&info.element_ty);
                self.emit(MirInst::UncheckedTakeEnumDataAddr {
                    dest: payload,
                    address: slot,
                    case: CaseRef::some(),
                });
                let value = self.manage(payload, info.element_ty.clone());
                self.bind_pattern(pattern, value)?;
                scope
            }
            None => {
                self.ctx.finish_block(Terminator::SwitchEnum {
                    operand: element,
                    cases,
                    default: None,
                });
                let payload = self.new_object(&info.element_ty);
                self.ctx.start_block(body_label, vec![payload]);
                let scope = self.push_scope();
                let value = self.manage(payload, info.element_ty.clone());
                self.bind_pattern(pattern, value)?;
                scope
            }
        };
        self.emit_stmts(body)?;
        self.pop_scope(scope)?;
        if !self.ctx.is_terminated() {
            self.branch_to(&header);
        }
        self.ctx.start_block(exit, Vec::new());
        self.pop_scope(outer)
    }
}
