//! Binding patterns of `let` and `for`

use super::{AddressKind, Binding, FunctionLowering, Managed};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;

impl<'a> FunctionLowering<'a> {
    /// Bind `pattern` to the +1 `value`, taking over its cleanup.
    ///
    /// Named bindings keep the cleanup in the current scope. Wildcards
    /// destroy what they match right away.
    pub(crate) fn bind_pattern(&mut self, pattern: &Pattern, value: Managed) -> Result<()> {
        match pattern {
            Pattern::Named(name) => {
                let binding = if self.is_address(value.value) {
                    Binding::Address {
                        address: value.value,
                        ty: value.ty,
                        kind: AddressKind::Stack { mutable: false },
                        container: None,
                    }
                } else {
                    Binding::Value {
                        value: value.value,
                        ty: value.ty,
                    }
                };
                self.bind(name.as_str(), binding);
                Ok(())
            }
            Pattern::Wildcard => {
                self.discard(value);
                Ok(())
            }
            Pattern::Tuple(_) if pattern.is_wildcard() => {
                self.discard(value);
                Ok(())
            }
            Pattern::Tuple(elems) => {
                let Type::Tuple(elem_tys) = value.ty.clone() else {
                    return Err(CompileError::lowering(
                        format!("tuple pattern cannot match a value of type {}", value.ty),
                        Span::default(),
                    ));
                };
                if elem_tys.len() != elems.len() {
                    return Err(CompileError::lowering(
                        format!("tuple pattern of {} elements matched against {}", elems.len(), value.ty),
                        Span::default(),
                    ));
                }
                if self.is_address(value.value) {
                    self.bind_tuple_address(elems, &elem_tys, value)
                } else {
                    let ty = value.ty.clone();
                    let tuple = value.forward(self);
                    let parts = self.destructure(tuple, &ty);
                    for ((sub, part), elem_ty) in elems.iter().zip(parts).zip(elem_tys) {
                        let part = self.manage(part, elem_ty);
                        self.bind_pattern(sub, part)?;
                    }
                    Ok(())
                }
            }
        }
    }

    /// Split a tuple in memory, moving each element out on its own
    fn bind_tuple_address(&mut self, elems: &[Pattern], elem_tys: &[Type], value: Managed) -> Result<()> {
        let tuple = value.forward(self);
        for (index, (sub, elem_ty)) in elems.iter().zip(elem_tys).enumerate() {
            let element = self.new_address(elem_ty);
            self.emit(MirInst::TupleElementAddr {
                dest: element,
                address: tuple,
                index,
            });
            if sub.is_wildcard() {
                if !self.is_trivial(elem_ty) {
                    self.emit(MirInst::DestroyAddr { address: element });
                }
                continue;
            }
            let part = if self.is_address_only(elem_ty) {
                let slot = self.alloc_temp(elem_ty);
                self.copy_addr(element, slot, true, true);
                slot
            } else {
                self.load_take(element, elem_ty)
            };
            let part = self.manage(part, elem_ty.clone());
            self.bind_pattern(sub, part)?;
        }
        Ok(())
    }

    /// End the lifetime of a value nothing binds
    fn discard(&mut self, value: Managed) {
        if !value.is_owned() {
            return;
        }
        let ty = value.ty.clone();
        let raw = value.forward(self);
        if self.is_address(raw) {
            if !self.is_trivial(&ty) {
                self.emit(MirInst::DestroyAddr { address: raw });
            }
        } else {
            self.destroy_value(raw);
        }
    }
}
