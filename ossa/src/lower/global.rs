//! Lazily initialized globals
//!
//! Every global (and static stored property) gets an addressor that runs
//! the initializer through `Builtin.once` on first use and then hands out
//! the global's address as a raw pointer.

use super::{FunctionLowering, LowerEnv};
use crate::ast::{Expr, Type};
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::types::names;

/// Type of the `once` token guarding a global's initializer
pub(crate) fn token_type() -> Type {
    Type::Int
}

pub(crate) fn lower_addressor(env: &LowerEnv<'_>, global: &str, ty: &Type) -> Result<Vec<MirFunction>> {
    let name = names::global_addressor(global);
    let fn_ty = env.tl.function_type(&name)?.clone();
    let mut fl = FunctionLowering::new(env, name, fn_ty, Type::RawPointer);

    let token_ty = token_type();
    let token = fl.new_address(&token_ty);
    fl.emit(MirInst::GlobalAddr {
        dest: token,
        global: names::global_token(global),
    });
    let token_ptr = fl.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
    fl.emit(MirInst::AddressToPointer {
        dest: token_ptr,
        address: token,
    });
    let init = fl.function_ref(&names::global_init_func(global))?;
    fl.builtin("once".to_string(), vec![token_ptr, init], Type::unit());

    let address = fl.new_address(ty);
    fl.emit(MirInst::GlobalAddr {
        dest: address,
        global: global.to_string(),
    });
    let pointer = fl.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
    fl.emit(MirInst::AddressToPointer { dest: pointer, address });
    fl.emit_return(pointer)?;
    fl.finish()
}

pub(crate) fn lower_initializer(env: &LowerEnv<'_>, global: &str, ty: &Type, initial: &Expr) -> Result<Vec<MirFunction>> {
    let name = names::global_init_func(global);
    let fn_ty = env.tl.function_type(&name)?.clone();
    let mut fl = FunctionLowering::new(env, name, fn_ty, Type::unit());
    if &initial.ty != ty {
        return Err(CompileError::lowering(
            format!("initial value of {global} has type {}, expected {ty}", initial.ty),
            initial.span,
        ));
    }
    let address = fl.new_address(ty);
    fl.emit(MirInst::GlobalAddr {
        dest: address,
        global: global.to_string(),
    });
    let depth = fl.cleanup_depth();
    fl.emit_into(initial, address)?;
    fl.pop_cleanups(depth)?;
    let unit = fl.unit();
    fl.emit_return(unit)?;
    fl.finish()
}
