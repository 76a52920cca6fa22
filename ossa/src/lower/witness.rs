//! Witness and vtable thunks
//!
//! A witness thunk has the abstract signature of a protocol requirement and
//! forwards to the member of the conforming type; a vtable thunk fills an
//! inherited slot with an override whose signature differs from it.

use super::thunk::ThunkCallee;
use super::{FunctionLowering, LowerEnv};
use crate::ast::{Span, Type};
use crate::error::{CompileError, Result};
use crate::mir::{LoweredFunctionType, MirFunction};
use crate::tables::WitnessTarget;
use crate::types::names::{self, AccessorKind};
use crate::types::OwnerKind;

pub(crate) fn lower_witness_thunk(
    env: &LowerEnv<'_>,
    name: &str,
    conforming: &Type,
    target: &WitnessTarget,
    ty: &LoweredFunctionType,
) -> Result<Vec<MirFunction>> {
    let tl = env.tl;
    let (owner, owner_kind, is_final, key, implementation, result_ty) = match target {
        WitnessTarget::Method { name: method } => {
            let found = tl.method(conforming, method).ok_or_else(|| {
                CompileError::table(format!("{conforming} has no method {method}"))
            })?;
            let implementation = names::method_name(&found.owner, method);
            (
                found.owner,
                found.owner_kind,
                found.is_final,
                method.clone(),
                implementation,
                found.decl.result,
            )
        }
        WitnessTarget::Accessor { property, kind } => {
            let prop = tl.property(conforming, property).ok_or_else(|| {
                CompileError::table(format!("{conforming} has no property {property}"))
            })?;
            let implementation = names::accessor_name(&prop.owner, property, *kind);
            let result_ty = match kind {
                AccessorKind::Getter => prop.ty.referent().clone(),
                AccessorKind::MaterializeForSet => Type::Tuple(vec![Type::RawPointer, Type::optional(Type::RawPointer)]),
                _ => Type::unit(),
            };
            (
                prop.owner,
                prop.owner_kind,
                prop.is_final,
                names::accessor_key(property, *kind),
                implementation,
                result_ty,
            )
        }
    };

    let mut fl = FunctionLowering::new(env, name.to_string(), ty.clone(), result_ty);
    fl.is_thunk = true;
    let dispatched = if owner_kind == OwnerKind::Class && !is_final {
        let class = conforming.nominal_name().unwrap_or(&owner);
        env.tables.dispatch_entry(class, &key)
    } else {
        None
    };
    let (callee, callee_ty) = match dispatched {
        Some(entry) => {
            tracing::trace!(thunk = %name, selector = %entry.selector, "witness dispatches through the vtable");
            (ThunkCallee::ClassMethod(entry.selector.clone()), entry.ty.clone())
        }
        None => (
            ThunkCallee::Function(implementation.clone()),
            tl.function_type(&implementation)?.clone(),
        ),
    };
    let forwarded = fl.params.iter().copied().zip(ty.sig.params.iter().cloned()).collect();
    fl.emit_forwarding_body(callee, &callee_ty, forwarded, Span::default())?;
    fl.finish()
}

pub(crate) fn lower_vtable_thunk(
    env: &LowerEnv<'_>,
    name: &str,
    implementation: &str,
    ty: &LoweredFunctionType,
) -> Result<Vec<MirFunction>> {
    let callee_ty = env.tl.function_type(implementation)?.clone();
    let mut fl = FunctionLowering::new(env, name.to_string(), ty.clone(), ty.sig.result.ty.clone());
    fl.is_thunk = true;
    let forwarded = fl.params.iter().copied().zip(ty.sig.params.iter().cloned()).collect();
    fl.emit_forwarding_body(ThunkCallee::Function(implementation.to_string()), &callee_ty, forwarded, Span::default())?;
    fl.finish()
}
