//! Calls
//!
//! Arguments are evaluated left to right after the callee's base. Inout
//! arguments are formed in order but their accesses only begin once every
//! other argument has been evaluated, so `f(&x, x)` reads `x` before the
//! modify access opens. Owned arguments are forwarded into the call; borrowed
//! arguments and temporaries end with the enclosing full expression.

use super::lvalue::LValue;
use super::{unify, FunctionLowering, Managed};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::tables::requirement_type;
use crate::types::names;
use crate::types::{ArgConvention, OwnerKind, ResultConvention};

use std::collections::HashMap;

/// Result of lowering a call
pub(crate) enum CallOutput {
    Value(Managed),
    /// The result was written to the requested address
    Initialized,
}

enum CalleeKind {
    Direct(String),
    Class { selector: String },
    Witness {
        protocol: String,
        requirement: String,
        /// Opened on the base address once its access has begun
        existential: Option<String>,
        lookup: Type,
    },
    Value(Managed),
}

/// An argument between evaluation and the call
enum ArgSlot {
    Ready(Value),
    /// +1 value the call consumes
    Consumed(Managed),
    InOut(LValue),
}

impl<'a> FunctionLowering<'a> {
    /// `apply` or, for a throwing callee, `try_apply` with its error edge
    /// branching to the innermost handler. Returns the direct result.
    pub(crate) fn emit_apply(
        &mut self,
        callee: Value,
        ty: &LoweredFunctionType,
        indirect: Option<Value>,
        args: Vec<Value>,
        result_ty: &Type,
        span: Span,
    ) -> Result<Value> {
        let args: Vec<Value> = indirect.into_iter().chain(args).collect();
        let (direct_ty, ownership) = match ty.sig.result.convention {
            ResultConvention::Indirect => (Type::unit(), Ownership::Trivial),
            ResultConvention::Unowned => (result_ty.clone(), Ownership::Trivial),
            ResultConvention::Owned => (result_ty.clone(), self.owned_kind(result_ty)),
        };
        if !ty.sig.throws {
            let dest = self.new_value(object_type_of(&direct_ty), ownership);
            self.emit(MirInst::Apply { dest, callee, args });
            return Ok(dest);
        }
        let normal = self.ctx.fresh_label();
        let error_label = self.ctx.fresh_label();
        self.ctx.finish_block(Terminator::TryApply {
            callee,
            args,
            normal: normal.clone(),
            error: error_label.clone(),
        });
        let error = self.new_value(MirType::Object(Type::error()), Ownership::Owned);
        self.ctx.start_block(error_label, vec![error]);
        self.emit_throw_edge(error, span)?;
        let dest = self.new_value(object_type_of(&direct_ty), ownership);
        self.ctx.start_block(normal, vec![dest]);
        Ok(dest)
    }

    /// Lower a call expression of formal result type `result_ty`. With
    /// `into`, an indirect result is written there directly.
    pub(crate) fn emit_call(
        &mut self,
        callee: &Callee,
        args: &[Expr],
        result_ty: &Type,
        span: Span,
        into: Option<Value>,
    ) -> Result<CallOutput> {
        let (kind, ty, self_slot) = self.prepare_callee(callee, span)?;
        let formal_count = ty.sig.params.len() - usize::from(self_slot.is_some());
        if formal_count != args.len() {
            return Err(CompileError::lowering(
                format!("call passes {} arguments to a function taking {formal_count}", args.len()),
                span,
            ));
        }
        if let CalleeKind::Direct(name) = &kind {
            check_generic_arguments(name, &ty, args, result_ty, span)?;
        }

        let mut slots = Vec::new();
        for (arg, param) in args.iter().zip(&ty.sig.params) {
            slots.push(self.evaluate_arg(arg, param.convention)?);
        }
        let mut self_slot = self_slot;
        let mut lookup_override = None;
        let mut resolved = Vec::new();
        for slot in slots.into_iter().chain(self_slot.take()) {
            resolved.push(match slot {
                ArgSlot::InOut(lv) => ArgSlot::Ready(self.lvalue_address(&lv, AccessKind::Modify)?),
                other => other,
            });
        }
        if let CalleeKind::Witness {
            existential: Some(protocol),
            ..
        } = &kind
        {
            let mutable = ty.sig.params.last().is_some_and(|p| p.convention == ArgConvention::InOut);
            if let Some(ArgSlot::Ready(address)) = resolved.last_mut() {
                let opened = Type::Opened(protocol.clone());
                let dest = self.new_address(&opened);
                self.emit(MirInst::OpenExistentialAddr {
                    dest,
                    address: *address,
                    mutable,
                });
                *address = dest;
                lookup_override = Some(opened);
            }
        }

        let indirect = match (ty.sig.has_indirect_result(), into) {
            (true, Some(dest)) => Some(dest),
            (true, None) => Some(self.alloc_temp(result_ty)),
            (false, _) => None,
        };

        let self_value = match resolved.last() {
            Some(ArgSlot::Ready(value)) => Some(*value),
            Some(ArgSlot::Consumed(m)) => Some(m.value),
            _ => None,
        };
        let callee_value = match kind {
            CalleeKind::Direct(name) => self.function_ref_typed(&name, ty.clone()),
            CalleeKind::Class { selector } => {
                let operand = self_value.ok_or_else(|| CompileError::lowering("class method without self", span))?;
                let dest = self.new_value(MirType::Function(Box::new(ty.clone())), Ownership::Trivial);
                self.emit(MirInst::ClassMethod {
                    dest,
                    operand,
                    selector,
                });
                dest
            }
            CalleeKind::Witness {
                protocol,
                requirement,
                lookup,
                ..
            } => {
                let dest = self.new_value(MirType::Function(Box::new(ty.clone())), Ownership::Trivial);
                self.emit(MirInst::WitnessMethod {
                    dest,
                    lookup: lookup_override.unwrap_or(lookup),
                    protocol,
                    requirement,
                });
                dest
            }
            CalleeKind::Value(function) => function.value,
        };

        let mut values = Vec::new();
        for slot in resolved {
            values.push(match slot {
                ArgSlot::Ready(value) => value,
                ArgSlot::Consumed(managed) => managed.forward(self),
                ArgSlot::InOut(_) => return Err(CompileError::lowering("unresolved inout argument", span)),
            });
        }
        let result = self.emit_apply(callee_value, &ty, indirect, values, result_ty, span)?;

        match (indirect, into) {
            (Some(_), Some(_)) => Ok(CallOutput::Initialized),
            (Some(temp), None) => {
                if self.is_address_only(result_ty) {
                    Ok(CallOutput::Value(self.manage(temp, result_ty.clone())))
                } else {
                    let value = self.load_take(temp, result_ty);
                    Ok(CallOutput::Value(self.manage(value, result_ty.clone())))
                }
            }
            (None, _) => Ok(CallOutput::Value(self.manage(result, result_ty.clone()))),
        }
    }

    /// Resolve the callee without emitting it; the base of a method call is
    /// evaluated here, before the arguments
    fn prepare_callee(&mut self, callee: &Callee, span: Span) -> Result<(CalleeKind, LoweredFunctionType, Option<ArgSlot>)> {
        match callee {
            Callee::Function(name) => {
                let ty = self.tl().function_type(name)?.clone();
                Ok((CalleeKind::Direct(name.clone()), ty, None))
            }
            Callee::Method { base, name } => {
                let method = self
                    .tl()
                    .method(&base.ty, name)
                    .ok_or_else(|| CompileError::lowering(format!("{} has no method {name}", base.ty), span))?;
                let direct = names::method_name(&method.owner, name);
                let dispatched = method.owner_kind == OwnerKind::Class
                    && !method.is_final
                    && method.decl.kind != MethodKind::Static;
                let class = base.ty.nominal_name().unwrap_or(&method.owner).to_string();
                let (kind, ty) = match dispatched
                    .then(|| self.env.tables.dispatch_entry(&class, name))
                    .flatten()
                {
                    Some(entry) => (
                        CalleeKind::Class {
                            selector: entry.selector.clone(),
                        },
                        entry.ty.clone(),
                    ),
                    None => (CalleeKind::Direct(direct.clone()), self.tl().function_type(&direct)?.clone()),
                };
                let convention = ty
                    .sig
                    .params
                    .last()
                    .map(|p| p.convention)
                    .unwrap_or(ArgConvention::Trivial);
                let slot = if method.decl.kind == MethodKind::Static {
                    let dest = self.new_value(MirType::Object(base.ty.clone()), Ownership::Trivial);
                    self.emit(MirInst::Metatype { dest });
                    ArgSlot::Ready(dest)
                } else {
                    self.evaluate_arg_expr(base, convention)?
                };
                // generic methods are checked against their formal arguments only
                Ok((kind, ty, Some(slot)))
            }
            Callee::Witness {
                base,
                protocol,
                requirement,
            } => {
                let (existential, lookup) = match &base.ty {
                    Type::Existential(p) => (Some(p.clone()), Type::Opened(p.clone())),
                    other => (None, other.clone()),
                };
                let mut subs = HashMap::new();
                subs.insert("Self".to_string(), lookup.clone());
                let ty = requirement_type(self.tl(), protocol, requirement, &subs)?;
                let convention = ty
                    .sig
                    .params
                    .last()
                    .map(|p| p.convention)
                    .unwrap_or(ArgConvention::InGuaranteed);
                let slot = match convention {
                    ArgConvention::InOut => ArgSlot::InOut(self.form_lvalue(base)?),
                    _ => ArgSlot::Ready(self.emit_borrowed_address(base)?.value),
                };
                let kind = CalleeKind::Witness {
                    protocol: protocol.clone(),
                    requirement: requirement.clone(),
                    existential,
                    lookup,
                };
                Ok((kind, ty, Some(slot)))
            }
            Callee::Value(function) => {
                let formal = function.ty.as_function().ok_or_else(|| {
                    CompileError::lowering(format!("cannot call a value of type {}", function.ty), span)
                })?;
                let ty = self.tl().lower_function_type(formal);
                let value = self.emit_borrowed(function)?;
                Ok((CalleeKind::Value(value), ty, None))
            }
        }
    }

    fn evaluate_arg(&mut self, arg: &Expr, convention: ArgConvention) -> Result<ArgSlot> {
        if convention == ArgConvention::InOut {
            let ExprKind::InOut(lvalue) = &arg.kind else {
                return Err(CompileError::lowering("inout argument must be marked with &", arg.span));
            };
            return Ok(ArgSlot::InOut(self.form_lvalue(lvalue)?));
        }
        self.evaluate_arg_expr(arg, convention)
    }

    fn evaluate_arg_expr(&mut self, arg: &Expr, convention: ArgConvention) -> Result<ArgSlot> {
        Ok(match convention {
            ArgConvention::InOut => ArgSlot::InOut(self.form_lvalue(arg)?),
            ArgConvention::InoutAliasable => {
                return Err(CompileError::lowering("aliasable inout is only used for captures", arg.span));
            }
            ArgConvention::Trivial => ArgSlot::Ready(self.emit_rvalue(arg)?.value),
            ArgConvention::Owned => {
                let value = self.emit_rvalue(arg)?;
                if self.is_address(value.value) {
                    let ty = value.ty.clone();
                    let address = value.forward(self);
                    let loaded = self.load_take(address, &ty);
                    ArgSlot::Consumed(self.manage(loaded, ty))
                } else {
                    ArgSlot::Consumed(value)
                }
            }
            ArgConvention::Guaranteed => ArgSlot::Ready(self.emit_borrowed(arg)?.value),
            ArgConvention::In => ArgSlot::Consumed(self.emit_rvalue_in_memory(arg)?),
            ArgConvention::InGuaranteed => ArgSlot::Ready(self.emit_borrowed_address(arg)?.value),
        })
    }

    /// Value valid for the rest of the full expression, without a copy
    /// where the binding already holds one
    pub(crate) fn emit_borrowed(&mut self, expr: &Expr) -> Result<Managed> {
        if let ExprKind::Var(name) = &expr.kind {
            if let super::Binding::Value { value, ty } = self.lookup(name, expr.span)? {
                return Ok(Managed::unmanaged(value, ty));
            }
        }
        self.emit_rvalue(expr)
    }

    /// Address of a value valid for the rest of the full expression
    pub(crate) fn emit_borrowed_address(&mut self, expr: &Expr) -> Result<Managed> {
        if let ExprKind::Var(name) = &expr.kind {
            if let super::Binding::Address { address, ty, kind, .. } = self.lookup(name, expr.span)? {
                if !kind.is_mutable() {
                    return Ok(Managed::unmanaged(address, ty));
                }
            }
        }
        if Self::is_lvalue_expr(expr) {
            let lv = self.form_lvalue(expr)?;
            let address = self.lvalue_address(&lv, AccessKind::Read)?;
            return Ok(Managed::unmanaged(address, expr.ty.clone()));
        }
        self.emit_rvalue_in_memory(expr)
    }

    /// +1 value in a temporary
    pub(crate) fn emit_rvalue_in_memory(&mut self, expr: &Expr) -> Result<Managed> {
        let value = self.emit_rvalue(expr)?;
        if self.is_address(value.value) && value.is_owned() {
            return Ok(value);
        }
        let ty = value.ty.clone();
        let temp = self.alloc_temp(&ty);
        self.init_from_managed(value, temp, &ty);
        Ok(self.manage(temp, ty))
    }
}

fn object_type_of(ty: &Type) -> MirType {
    MirType::Object(ty.clone())
}

/// Every generic parameter of a direct callee must be bound by an argument
/// or the result type
fn check_generic_arguments(
    name: &str,
    ty: &LoweredFunctionType,
    args: &[Expr],
    result_ty: &Type,
    span: Span,
) -> Result<()> {
    if ty.sig.generic_params.is_empty() {
        return Ok(());
    }
    let mut subs = HashMap::new();
    for (param, arg) in ty.sig.params.iter().zip(args) {
        let actual = match &arg.kind {
            ExprKind::InOut(inner) => &inner.ty,
            _ => &arg.ty,
        };
        unify(&param.ty, actual, &mut subs);
    }
    unify(&ty.sig.result.ty, result_ty, &mut subs);
    for generic in &ty.sig.generic_params {
        if !subs.contains_key(generic) {
            return Err(CompileError::lowering(
                format!("cannot infer generic parameter {generic} of {name}"),
                span,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::FnConvention;
    use crate::types::{LoweredParam, LoweredResult, LoweredSignature};

    fn generic_identity() -> LoweredFunctionType {
        LoweredFunctionType::new(
            FnConvention::Thin,
            LoweredSignature {
                generic_params: vec!["T".into()],
                params: vec![LoweredParam {
                    ty: Type::Param("T".into()),
                    convention: ArgConvention::In,
                }],
                result: LoweredResult {
                    ty: Type::Param("T".into()),
                    convention: ResultConvention::Indirect,
                },
                throws: false,
            },
        )
    }

    #[test]
    fn test_generic_argument_inferred_from_argument() {
        let ty = generic_identity();
        assert!(check_generic_arguments("id", &ty, &[Expr::int(1)], &Type::Int, Span::default()).is_ok());
    }

    #[test]
    fn test_generic_argument_unbound() {
        let mut ty = generic_identity();
        ty.sig.generic_params.push("U".into());
        let err = check_generic_arguments("id", &ty, &[Expr::int(1)], &Type::Int, Span::default()).unwrap_err();
        assert!(err.message().contains("cannot infer generic parameter U"));
    }
}
