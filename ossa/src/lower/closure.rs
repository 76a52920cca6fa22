//! Closures and function conversions
//!
//! A closure literal lowers to its own function whose trailing parameters
//! are the captures, plus a `partial_apply` at the use site. How a capture
//! is passed depends on the binding and on whether the closure escapes:
//!
//! | binding              | escaping                    | non-escaping        |
//! |----------------------|-----------------------------|---------------------|
//! | immutable value      | copy, `@guaranteed`         | value, `@guaranteed`|
//! | boxed `var`          | box copy, `@guaranteed`     | `@inout_aliasable`  |
//! | stack `var`, inout   | rejected                    | `@inout_aliasable`  |
//! | address-only `let`   | fresh box, `@guaranteed`    | `@in_guaranteed`    |

use std::collections::HashSet;

use super::cleanup::CleanupKind;
use super::thunk::{lower_block_invoke, lower_reabstraction_thunk};
use super::{AddressKind, Binding, FunctionLowering, Managed};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::types::names::{block_invoke_name, reabstraction_thunk_name};
use crate::types::{ArgConvention, LoweredParam, LoweredSignature};

/// Names captured by an escaping closure anywhere in `body`. Those
/// variables must live in boxes so the closure can outlive the frame.
pub(crate) fn escaping_captures(body: &[Stmt]) -> HashSet<String> {
    let mut names = HashSet::new();
    for stmt in body {
        visit_stmt(stmt, &mut names);
    }
    names
}

fn visit_stmt(stmt: &Stmt, names: &mut HashSet<String>) {
    match stmt {
        Stmt::Let { init, .. } | Stmt::Var { init, .. } => visit_expr(init, names),
        Stmt::Expr(e) | Stmt::Throw(e) | Stmt::Return(Some(e)) => visit_expr(e, names),
        Stmt::Return(None) => {}
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            visit_expr(cond, names);
            then_body.iter().chain(else_body).for_each(|s| visit_stmt(s, names));
        }
        Stmt::While { cond, body } => {
            visit_expr(cond, names);
            body.iter().for_each(|s| visit_stmt(s, names));
        }
        Stmt::For { sequence, body, .. } => {
            visit_expr(sequence, names);
            body.iter().for_each(|s| visit_stmt(s, names));
        }
        Stmt::Do { body, catches } => {
            body.iter().for_each(|s| visit_stmt(s, names));
            catches
                .iter()
                .flat_map(|c| &c.body)
                .for_each(|s| visit_stmt(s, names));
        }
    }
}

fn visit_expr(expr: &Expr, names: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::Closure(closure) => {
            if closure.escaping {
                names.extend(closure.captures.iter().cloned());
            }
            closure.body.iter().for_each(|s| visit_stmt(s, names));
        }
        ExprKind::IntLit(_)
        | ExprKind::FloatLit(_)
        | ExprKind::BoolLit(_)
        | ExprKind::Var(_)
        | ExprKind::Global(_)
        | ExprKind::StaticMember { .. }
        | ExprKind::FunctionRef(_)
        | ExprKind::Nil
        | ExprKind::Metatype => {}
        ExprKind::Tuple(elems) | ExprKind::Construct { args: elems } => {
            elems.iter().for_each(|e| visit_expr(e, names));
        }
        ExprKind::TupleElement { base, .. } | ExprKind::Member { base, .. } => visit_expr(base, names),
        ExprKind::Subscript { base, index } => {
            visit_expr(base, names);
            visit_expr(index, names);
        }
        ExprKind::EnumCase { payload, .. } => {
            if let Some(payload) = payload {
                visit_expr(payload, names);
            }
        }
        ExprKind::Call { callee, args } => {
            match callee {
                Callee::Function(_) => {}
                Callee::Method { base, .. } | Callee::Witness { base, .. } | Callee::Value(base) => {
                    visit_expr(base, names)
                }
            }
            args.iter().for_each(|e| visit_expr(e, names));
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            visit_expr(lhs, names);
            visit_expr(rhs, names);
        }
        ExprKind::Assign { target, value } | ExprKind::CompoundAssign { target, value, .. } => {
            visit_expr(target, names);
            visit_expr(value, names);
        }
        ExprKind::Try { expr: inner, .. }
        | ExprKind::Erase(inner)
        | ExprKind::Upcast(inner)
        | ExprKind::InjectOptional(inner)
        | ExprKind::ForceUnwrap(inner)
        | ExprKind::FunctionConversion(inner)
        | ExprKind::InOut(inner)
        | ExprKind::AddressOf(inner)
        | ExprKind::NativeOwner(inner) => visit_expr(inner, names),
    }
}

/// How one capture crosses into the closure body
struct Capture {
    name: String,
    param: LoweredParam,
    arg: Value,
    /// Rebinding inside the body for captures passed as a box
    boxed: Option<(Type, AddressKind)>,
}

impl<'a> FunctionLowering<'a> {
    pub(crate) fn emit_closure(&mut self, closure: &ClosureExpr, ty: &Type, span: Span) -> Result<Managed> {
        let Some(formal) = ty.as_function() else {
            return Err(CompileError::lowering(format!("closure has non-function type {ty}"), span));
        };
        if formal.representation != Representation::Thick || formal.abstraction != Abstraction::Substituted {
            return Err(CompileError::lowering(
                format!("closure literal cannot have type {ty}; convert it instead"),
                span,
            ));
        }
        if formal.escaping != closure.escaping {
            return Err(CompileError::lowering(
                format!("closure {} disagrees with the escapability of {ty}", closure.name),
                span,
            ));
        }
        let escaping = closure.escaping;

        let mut captures = Vec::new();
        for name in &closure.captures {
            captures.push(self.capture(name, escaping, span)?);
        }

        let tl = self.tl();
        let mut params: Vec<LoweredParam> = closure
            .params
            .iter()
            .map(|p| LoweredParam {
                ty: p.ty.clone(),
                convention: tl.param_convention(&p.ty, p.convention),
            })
            .collect();
        params.extend(captures.iter().map(|c| c.param.clone()));
        let closure_ty = LoweredFunctionType::new(
            FnConvention::Thin,
            LoweredSignature {
                generic_params: self.ty.sig.generic_params.clone(),
                params,
                result: tl.lowered_result(&closure.result),
                throws: closure.throws,
            },
        );
        self.lower_closure_body(closure, &closure_ty, &captures)?;

        let function = self.function_ref_typed(&closure.name, closure_ty);
        if captures.is_empty() {
            let dest = self.new_value(MirType::Object(ty.clone()), Ownership::Trivial);
            self.emit(MirInst::ThinToThickFunction {
                dest,
                operand: function,
            });
            return Ok(Managed::unmanaged(dest, ty.clone()));
        }
        let ownership = if escaping { Ownership::Owned } else { Ownership::Trivial };
        let dest = self.new_value(MirType::Object(ty.clone()), ownership);
        self.emit(MirInst::PartialApply {
            dest,
            callee: function,
            args: captures.iter().map(|c| c.arg).collect(),
            on_stack: !escaping,
        });
        if escaping {
            return Ok(self.manage(dest, ty.clone()));
        }
        self.push_cleanup(CleanupKind::DeallocStack(dest));
        Ok(Managed::unmanaged(dest, ty.clone()))
    }

    fn capture(&mut self, name: &str, escaping: bool, span: Span) -> Result<Capture> {
        let binding = self.lookup(name, span)?;
        let capture = match binding {
            Binding::Value { value, ty } => {
                let convention = if self.is_trivial(&ty) {
                    ArgConvention::Trivial
                } else {
                    ArgConvention::Guaranteed
                };
                let arg = if escaping { self.copy_value(value, &ty) } else { value };
                Capture {
                    name: name.to_string(),
                    param: LoweredParam { ty, convention },
                    arg,
                    boxed: None,
                }
            }
            Binding::Address {
                address,
                ty,
                kind: AddressKind::Box,
                container,
            } => {
                if !escaping {
                    Capture {
                        name: name.to_string(),
                        param: LoweredParam {
                            ty,
                            convention: ArgConvention::InoutAliasable,
                        },
                        arg: address,
                        boxed: None,
                    }
                } else {
                    let container = container
                        .ok_or_else(|| CompileError::lowering(format!("boxed variable {name} has no box"), span))?;
                    let box_ty = Type::Box(Box::new(ty.clone()));
                    let arg = self.copy_value(container, &box_ty);
                    Capture {
                        name: name.to_string(),
                        param: LoweredParam {
                            ty: box_ty,
                            convention: ArgConvention::Guaranteed,
                        },
                        arg,
                        boxed: Some((ty, AddressKind::Box)),
                    }
                }
            }
            Binding::Address {
                address,
                ty,
                kind: kind @ (AddressKind::Stack { mutable: true } | AddressKind::InOut | AddressKind::CapturedInOut),
                ..
            } => {
                if escaping {
                    return Err(CompileError::lowering(
                        format!("escaping closure cannot capture {kind:?} storage {name}"),
                        span,
                    ));
                }
                Capture {
                    name: name.to_string(),
                    param: LoweredParam {
                        ty,
                        convention: ArgConvention::InoutAliasable,
                    },
                    arg: address,
                    boxed: None,
                }
            }
            Binding::Address { address, ty, .. } => {
                if !escaping {
                    Capture {
                        name: name.to_string(),
                        param: LoweredParam {
                            ty,
                            convention: ArgConvention::InGuaranteed,
                        },
                        arg: address,
                        boxed: None,
                    }
                } else {
                    let box_ty = Type::Box(Box::new(ty.clone()));
                    let boxed = self.new_value(MirType::Object(box_ty.clone()), Ownership::Owned);
                    self.emit(MirInst::AllocBox { dest: boxed });
                    let contents = self.new_address(&ty);
                    self.emit(MirInst::ProjectBox {
                        dest: contents,
                        operand: boxed,
                    });
                    self.copy_addr(address, contents, false, true);
                    Capture {
                        name: name.to_string(),
                        param: LoweredParam {
                            ty: box_ty,
                            convention: ArgConvention::Guaranteed,
                        },
                        arg: boxed,
                        boxed: Some((ty, AddressKind::Indirect)),
                    }
                }
            }
        };
        Ok(capture)
    }

    fn lower_closure_body(&mut self, closure: &ClosureExpr, ty: &LoweredFunctionType, captures: &[Capture]) -> Result<()> {
        let _span = tracing::trace_span!("closure", closure = %closure.name).entered();
        let mut body = FunctionLowering::new(self.env, closure.name.clone(), ty.clone(), closure.result.clone());
        body.boxed_vars = escaping_captures(&closure.body);
        body.constraints = self.constraints.clone();
        body.generic = self.generic;
        let names: Vec<&str> = closure
            .params
            .iter()
            .map(|p| p.name.as_str())
            .chain(captures.iter().map(|c| c.name.as_str()))
            .collect();
        body.bind_params(&names)?;
        let first_capture = closure.params.len();
        for (i, capture) in captures.iter().enumerate() {
            let Some((value_ty, kind)) = &capture.boxed else {
                continue;
            };
            let container = body.params[first_capture + i];
            let address = body.new_address(value_ty);
            body.emit(MirInst::ProjectBox {
                dest: address,
                operand: container,
            });
            body.bind(
                capture.name.as_str(),
                Binding::Address {
                    address,
                    ty: value_ty.clone(),
                    kind: *kind,
                    container: Some(container),
                },
            );
        }
        body.lower_body(&closure.body)?;
        let functions = body.finish()?;
        self.aux.extend(functions);
        Ok(())
    }

    /// Convert a function value to the function type `to_ty`
    pub(crate) fn emit_function_conversion(&mut self, inner: &Expr, to_ty: &Type, span: Span) -> Result<Managed> {
        let (Some(from), Some(to)) = (inner.ty.as_function(), to_ty.as_function()) else {
            return Err(CompileError::lowering(
                format!("cannot convert {} to {to_ty}", inner.ty),
                span,
            ));
        };
        let value = self.emit_rvalue(inner)?;
        self.convert_function(value, from, to, to_ty, span)
    }

    fn convert_function(
        &mut self,
        value: Managed,
        from: &FunctionType,
        to: &FunctionType,
        to_ty: &Type,
        span: Span,
    ) -> Result<Managed> {
        if from == to {
            return Ok(value);
        }
        if from.same_shape(to) {
            let ownership = self.ctx.ownership(value.value);
            let operand = value.forward(self);
            let dest = self.new_value(MirType::Object(to_ty.clone()), ownership);
            self.emit(MirInst::ConvertFunction { dest, operand });
            return Ok(self.manage(dest, to_ty.clone()));
        }
        if from.representation == Representation::Thin {
            let thick = FunctionType {
                representation: Representation::Thick,
                ..from.clone()
            };
            let thick_ty = Type::Function(Box::new(thick.clone()));
            let dest = self.new_value(MirType::Object(thick_ty.clone()), Ownership::Trivial);
            self.emit(MirInst::ThinToThickFunction {
                dest,
                operand: value.value,
            });
            return self.convert_function(Managed::unmanaged(dest, thick_ty), &thick, to, to_ty, span);
        }
        if from.representation == Representation::Thick && to.representation == Representation::Block {
            return self.emit_block_bridge(value, from, to, to_ty, span);
        }
        if to.representation != Representation::Thick {
            return Err(CompileError::lowering(
                format!("cannot convert {} to {to_ty}", value.ty),
                span,
            ));
        }
        self.emit_reabstraction(value, from, to, to_ty)
    }

    /// Wrap a closure in a thunk with the calling convention of `to`
    fn emit_reabstraction(&mut self, value: Managed, from: &FunctionType, to: &FunctionType, to_ty: &Type) -> Result<Managed> {
        let name = reabstraction_thunk_name(&value.ty.to_string(), &to_ty.to_string());
        tracing::trace!(function = %self.name, thunk = %name, "reabstracting closure");
        let functions = lower_reabstraction_thunk(self.env, &name, from, to)?;
        let thunk_ty = functions[0].ty.clone();
        self.aux.extend(functions);
        let thunk = self.function_ref_typed(&name, thunk_ty);
        if !to.escaping {
            let dest = self.new_value(MirType::Object(to_ty.clone()), Ownership::Trivial);
            self.emit(MirInst::PartialApply {
                dest,
                callee: thunk,
                args: vec![value.value],
                on_stack: true,
            });
            self.push_cleanup(CleanupKind::DeallocStack(dest));
            return Ok(Managed::unmanaged(dest, to_ty.clone()));
        }
        let closure_ty = value.ty.clone();
        let operand = if value.is_owned() {
            value.forward(self)
        } else {
            self.copy_value(value.value, &closure_ty)
        };
        let dest = self.new_value(MirType::Object(to_ty.clone()), Ownership::Owned);
        self.emit(MirInst::PartialApply {
            dest,
            callee: thunk,
            args: vec![operand],
            on_stack: false,
        });
        Ok(self.manage(dest, to_ty.clone()))
    }

    /// Copy a closure into block storage and turn it into a block
    fn emit_block_bridge(
        &mut self,
        value: Managed,
        from: &FunctionType,
        to: &FunctionType,
        to_ty: &Type,
        span: Span,
    ) -> Result<Managed> {
        let closure_ty = value.ty.clone();
        let invoke_name = block_invoke_name(&closure_ty.to_string());
        let functions = lower_block_invoke(self.env, &invoke_name, from, to).map_err(|e| {
            CompileError::lowering(format!("cannot bridge {closure_ty} to {to_ty}: {}", e.message()), span)
        })?;
        let invoke_ty = functions[0].ty.clone();
        self.aux.extend(functions);

        let storage_ty = Type::BlockStorage(Box::new(closure_ty.clone()));
        let storage = self.new_address(&storage_ty);
        self.emit(MirInst::AllocStack { dest: storage });
        let capture = self.new_address(&closure_ty);
        self.emit(MirInst::ProjectBlockStorage { dest: capture, storage });
        let copy = self.copy_value(value.value, &closure_ty);
        self.store_init(copy, capture, &closure_ty);
        let invoke = self.function_ref_typed(&invoke_name, invoke_ty);
        let header = self.new_value(MirType::Object(to_ty.clone()), Ownership::Trivial);
        self.emit(MirInst::InitBlockStorageHeader {
            dest: header,
            storage,
            invoke,
        });
        let block = self.new_value(MirType::Object(to_ty.clone()), Ownership::Owned);
        self.emit(MirInst::CopyBlock {
            dest: block,
            operand: header,
        });
        if !self.is_trivial(&closure_ty) {
            self.emit(MirInst::DestroyAddr { address: capture });
        }
        self.emit(MirInst::DeallocStack { operand: storage });
        Ok(self.manage(block, to_ty.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closure(name: &str, escaping: bool, captures: &[&str], body: Vec<Stmt>) -> Expr {
        let ty = Type::Function(Box::new(FunctionType {
            escaping,
            ..FunctionType::new(vec![], Type::unit())
        }));
        Expr::new(
            ExprKind::Closure(Box::new(ClosureExpr {
                name: name.into(),
                params: vec![],
                result: Type::unit(),
                throws: false,
                escaping,
                captures: captures.iter().map(|c| c.to_string()).collect(),
                body,
            })),
            ty,
        )
    }

    #[test]
    fn test_escaping_captures_only_from_escaping_closures() {
        let body = vec![
            Stmt::Expr(closure("a", false, &["x"], vec![])),
            Stmt::Expr(closure("b", true, &["y"], vec![])),
        ];
        let names = escaping_captures(&body);
        assert!(names.contains("y"));
        assert!(!names.contains("x"));
    }

    #[test]
    fn test_escaping_captures_found_in_nested_closures() {
        let inner = closure("inner", true, &["z"], vec![]);
        let body = vec![Stmt::If {
            cond: Expr::bool(true),
            then_body: vec![Stmt::Expr(closure("outer", false, &["z"], vec![Stmt::Expr(inner)]))],
            else_body: vec![],
        }];
        assert_eq!(escaping_captures(&body), HashSet::from(["z".to_string()]));
    }
}
