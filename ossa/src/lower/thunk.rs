//! Forwarding bodies shared by every thunk
//!
//! A thunk receives its arguments in one convention and calls a target
//! expecting another. Each argument is converted on its own; borrowed
//! copies and temporaries live on the cleanup stack until the return.

use super::cleanup::CleanupKind;
use super::{FunctionLowering, LowerEnv};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::types::{ArgConvention, LoweredParam, ResultConvention};

/// What a thunk forwards to
pub(crate) enum ThunkCallee {
    Function(String),
    /// Vtable dispatch on the forwarded `self`
    ClassMethod(String),
    /// A function value held by the thunk
    Value(Value),
}

impl<'a> FunctionLowering<'a> {
    /// Call `callee` with `forwarded` converted to its parameter
    /// conventions, then return its result in this function's convention
    pub(crate) fn emit_forwarding_body(
        &mut self,
        callee: ThunkCallee,
        callee_ty: &LoweredFunctionType,
        forwarded: Vec<(Value, LoweredParam)>,
        span: Span,
    ) -> Result<()> {
        if forwarded.len() != callee_ty.sig.params.len() {
            return Err(CompileError::lowering(
                format!(
                    "{} forwards {} arguments to a function taking {}",
                    self.name,
                    forwarded.len(),
                    callee_ty.sig.params.len()
                ),
                span,
            ));
        }
        let mut args = Vec::new();
        for ((value, from), to) in forwarded.iter().zip(&callee_ty.sig.params) {
            args.push(self.convert_param(*value, from, to, span)?);
        }
        let callee = match callee {
            ThunkCallee::Function(name) => self.function_ref_typed(&name, callee_ty.clone()),
            ThunkCallee::ClassMethod(selector) => {
                let operand = *args
                    .last()
                    .ok_or_else(|| CompileError::lowering("class method thunk without self", span))?;
                let dest = self.new_value(MirType::Function(Box::new(callee_ty.clone())), Ownership::Trivial);
                self.emit(MirInst::ClassMethod {
                    dest,
                    operand,
                    selector,
                });
                dest
            }
            ThunkCallee::Value(value) => value,
        };

        let inner = callee_ty.sig.result.clone();
        let outer = self.ty.sig.result.clone();
        let inner_indirect = inner.convention == ResultConvention::Indirect;
        let result = match (self.indirect_result, inner_indirect) {
            (Some(out), true) => {
                let target = if inner.ty == outer.ty {
                    out
                } else if outer.ty.optional_payload() == Some(&inner.ty) {
                    let payload = self.new_address(&inner.ty);
                    self.emit(MirInst::InitEnumDataAddr {
                        dest: payload,
                        address: out,
                        case: CaseRef::some(),
                    });
                    payload
                } else {
                    return Err(CompileError::lowering(
                        format!("cannot convert an indirect {} to {}", inner.ty, outer.ty),
                        span,
                    ));
                };
                self.emit_apply(callee, callee_ty, Some(target), args, &inner.ty, span)?;
                if target != out {
                    self.emit(MirInst::InjectEnumAddr {
                        address: out,
                        case: CaseRef::some(),
                    });
                }
                self.unit()
            }
            (Some(out), false) => {
                let value = self.emit_apply(callee, callee_ty, None, args, &inner.ty, span)?;
                let value = self.convert_value(value, &inner.ty, &outer.ty, span)?;
                self.store_init(value, out, &outer.ty);
                self.unit()
            }
            (None, true) => {
                let temp = self.alloc_temp(&inner.ty);
                self.emit_apply(callee, callee_ty, Some(temp), args, &inner.ty, span)?;
                let value = self.load_take(temp, &inner.ty);
                self.convert_value(value, &inner.ty, &outer.ty, span)?
            }
            (None, false) => {
                let value = self.emit_apply(callee, callee_ty, None, args, &inner.ty, span)?;
                self.convert_value(value, &inner.ty, &outer.ty, span)?
            }
        };
        self.emit_return(result)
    }

    /// Re-pass one argument. Whatever this function still owns afterwards
    /// gets a cleanup that runs at the return.
    fn convert_param(&mut self, value: Value, from: &LoweredParam, to: &LoweredParam, span: Span) -> Result<Value> {
        use ArgConvention::*;
        let ty = &from.ty;
        let same_type = from.ty == to.ty;
        match (from.convention, to.convention) {
            (a, b) if a == b && same_type => Ok(value),
            (InOut | InoutAliasable, InOut | InoutAliasable) if same_type => Ok(value),
            (In, InGuaranteed) if same_type => {
                self.push_cleanup(CleanupKind::DestroyAddr(value));
                Ok(value)
            }
            (InGuaranteed, In) if same_type => {
                let temp = self.alloc_temp(ty);
                self.copy_addr(value, temp, false, true);
                Ok(temp)
            }
            (In | InGuaranteed | InOut | InoutAliasable, Trivial | Owned | Guaranteed) => {
                let loaded = match (from.convention, to.convention) {
                    (_, Trivial) => self.load_copy(value, ty),
                    (In, _) => self.load_take(value, ty),
                    (_, Owned) => self.load_copy(value, ty),
                    _ => self.load_borrow(value, ty),
                };
                self.convert_direct(loaded, from, to, span)
            }
            (Trivial | Owned | Guaranteed, In | InGuaranteed) => {
                let owned = LoweredParam {
                    ty: to.ty.clone(),
                    convention: Owned,
                };
                let converted = self.convert_direct(value, from, &owned, span)?;
                let temp = self.alloc_temp(&to.ty);
                self.store_init(converted, temp, &to.ty);
                if to.convention == InGuaranteed && !self.is_trivial(&to.ty) {
                    self.push_cleanup(CleanupKind::DestroyAddr(temp));
                }
                Ok(temp)
            }
            (Trivial | Owned | Guaranteed, Trivial | Owned | Guaranteed) => self.convert_direct(value, from, to, span),
            (a, b) => Err(CompileError::lowering(
                format!("cannot forward a {a:?} {} as a {b:?} {}", from.ty, to.ty),
                span,
            )),
        }
    }

    /// Adjust a direct argument to the ownership and type `to` expects
    fn convert_direct(&mut self, value: Value, from: &LoweredParam, to: &LoweredParam, span: Span) -> Result<Value> {
        let owned = self.ctx.ownership(value) == Ownership::Owned;
        if to.convention == ArgConvention::Guaranteed && from.ty == to.ty {
            if owned {
                self.push_cleanup(CleanupKind::DestroyValue(value));
            }
            return Ok(value);
        }
        let plus_one = if owned { value } else { self.copy_value(value, &from.ty) };
        let converted = self.convert_value(plus_one, &from.ty, &to.ty, span)?;
        if to.convention == ArgConvention::Guaranteed && self.ctx.ownership(converted) == Ownership::Owned {
            self.push_cleanup(CleanupKind::DestroyValue(converted));
        }
        Ok(converted)
    }

    /// Convert a +1 value between types a dispatch boundary may bridge:
    /// optional injection and class upcasts, also under an optional
    pub(crate) fn convert_value(&mut self, value: Value, from: &Type, to: &Type, span: Span) -> Result<Value> {
        if from == to {
            return Ok(value);
        }
        if let Some(payload) = to.optional_payload() {
            if let Some(from_payload) = from.optional_payload() {
                return self.convert_optional(value, from_payload, payload, to, span);
            }
            let inner = self.convert_value(value, from, payload, span)?;
            let dest = self.new_object(to);
            self.emit(MirInst::Enum {
                dest,
                case: CaseRef::some(),
                payload: Some(inner),
            });
            return Ok(dest);
        }
        let tl = self.tl();
        if let (Some(a), Some(b)) = (from.nominal_name(), to.nominal_name()) {
            if tl.is_class(from) && tl.is_class(to) && tl.is_subclass(a, b) {
                let ownership = self.ctx.ownership(value);
                let dest = self.new_value(MirType::Object(to.clone()), ownership);
                self.emit(MirInst::Upcast { dest, operand: value });
                return Ok(dest);
            }
        }
        Err(CompileError::lowering(format!("cannot convert {from} to {to}"), span))
    }

    fn convert_optional(&mut self, value: Value, from: &Type, to: &Type, to_optional: &Type, span: Span) -> Result<Value> {
        let some = self.ctx.fresh_label();
        let none = self.ctx.fresh_label();
        let merge = self.ctx.fresh_label();
        self.ctx.finish_block(Terminator::SwitchEnum {
            operand: value,
            cases: vec![(CaseRef::some(), some.clone()), (CaseRef::none(), none.clone())],
            default: None,
        });
        let payload = self.new_object(from);
        self.ctx.start_block(some, vec![payload]);
        let converted = self.convert_value(payload, from, to, span)?;
        let wrapped = self.new_object(to_optional);
        self.emit(MirInst::Enum {
            dest: wrapped,
            case: CaseRef::some(),
            payload: Some(converted),
        });
        self.ctx.finish_block(Terminator::Br {
            target: merge.clone(),
            args: vec![wrapped],
        });
        self.ctx.start_block(none, Vec::new());
        let nothing = self.none_value(to_optional);
        self.ctx.finish_block(Terminator::Br {
            target: merge.clone(),
            args: vec![nothing],
        });
        let result = self.new_object(to_optional);
        self.ctx.start_block(merge, vec![result]);
        Ok(result)
    }
}

/// Thunk adapting a closure of type `from` to the calling convention of
/// `to`; the closure is its trailing, borrowed parameter
pub(crate) fn lower_reabstraction_thunk(
    env: &LowerEnv<'_>,
    name: &str,
    from: &FunctionType,
    to: &FunctionType,
) -> Result<Vec<MirFunction>> {
    let _span = tracing::trace_span!("reabstraction_thunk", thunk = %name).entered();
    let tl = env.tl;
    let callee_ty = tl.lower_function_type(from);
    let mut sig = tl.lower_function_type(to).sig;
    sig.params.push(LoweredParam {
        ty: Type::Function(Box::new(from.clone())),
        convention: ArgConvention::Guaranteed,
    });
    let thunk_ty = LoweredFunctionType::new(FnConvention::Thin, sig.clone());
    let mut fl = FunctionLowering::new(env, name.to_string(), thunk_ty, to.result.clone());
    fl.is_thunk = true;
    let Some((&closure, params)) = fl.params.split_last() else {
        return Err(CompileError::lowering(format!("{name} has no closure parameter"), Span::default()));
    };
    let forwarded = params.iter().copied().zip(sig.params.iter().cloned()).collect();
    fl.emit_forwarding_body(ThunkCallee::Value(closure), &callee_ty, forwarded, Span::default())?;
    fl.finish()
}

/// Invoke function of a block wrapping a closure of type `from`; its first
/// parameter is the block storage holding the closure
pub(crate) fn lower_block_invoke(
    env: &LowerEnv<'_>,
    name: &str,
    from: &FunctionType,
    to: &FunctionType,
) -> Result<Vec<MirFunction>> {
    let _span = tracing::trace_span!("block_invoke", thunk = %name).entered();
    let tl = env.tl;
    let closure_ty = Type::Function(Box::new(from.clone()));
    let callee_ty = tl.lower_function_type(from);
    let mut sig = tl.lower_function_type(to).sig;
    sig.params.insert(
        0,
        LoweredParam {
            ty: Type::BlockStorage(Box::new(closure_ty.clone())),
            convention: ArgConvention::InoutAliasable,
        },
    );
    let invoke_ty = LoweredFunctionType::new(FnConvention::Thin, sig.clone());
    let mut fl = FunctionLowering::new(env, name.to_string(), invoke_ty, to.result.clone());
    fl.is_thunk = true;
    let Some((&storage, params)) = fl.params.split_first() else {
        return Err(CompileError::lowering(format!("{name} has no block storage parameter"), Span::default()));
    };
    let params = params.to_vec();
    let capture = fl.new_address(&closure_ty);
    fl.emit(MirInst::ProjectBlockStorage { dest: capture, storage });
    let closure = fl.load_borrow(capture, &closure_ty);
    let forwarded = params.into_iter().zip(sig.params.iter().skip(1).cloned()).collect();
    fl.emit_forwarding_body(ThunkCallee::Value(closure), &callee_ty, forwarded, Span::default())?;
    fl.finish()
}
