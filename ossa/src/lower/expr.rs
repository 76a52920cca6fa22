//! Expressions
//!
//! `emit_rvalue` produces a +1 value: an owned object with a cleanup, a
//! trivial object, or for address-only types an initialized temporary that
//! the cleanup stack destroys. `emit_into` initializes memory the caller
//! already owns, which lets address-only results land in place.

use super::access::{FormalAccess, TwoPhaseAccess};
use super::call::CallOutput;
use super::cleanup::{CleanupHandle, CleanupKind};
use super::lvalue::field_ref;
use super::{FunctionLowering, Managed};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::types::TypeLowering;

const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

impl<'a> FunctionLowering<'a> {
    /// Lower `expr` to a +1 value
    pub(crate) fn emit_rvalue(&mut self, expr: &Expr) -> Result<Managed> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.emit_rvalue_inner(expr))
    }

    fn emit_rvalue_inner(&mut self, expr: &Expr) -> Result<Managed> {
        let ty = expr.ty.clone();
        match &expr.kind {
            ExprKind::IntLit(value) => Ok(Managed::unmanaged(self.integer_literal(ty.clone(), *value), ty)),
            ExprKind::FloatLit(value) => {
                let dest = self.new_value(MirType::Object(ty.clone()), Ownership::Trivial);
                self.emit(MirInst::FloatLiteral { dest, value: *value });
                Ok(Managed::unmanaged(dest, ty))
            }
            ExprKind::BoolLit(value) => {
                let dest = self.integer_literal(Type::Bool, i64::from(*value));
                Ok(Managed::unmanaged(dest, Type::Bool))
            }
            ExprKind::Var(_)
            | ExprKind::Global(_)
            | ExprKind::StaticMember { .. }
            | ExprKind::Member { .. }
            | ExprKind::Subscript { .. }
            | ExprKind::TupleElement { .. } => {
                let lv = self.form_lvalue(expr)?;
                self.lvalue_read(&lv)
            }
            ExprKind::Tuple(elems) => self.emit_tuple(elems, &ty),
            ExprKind::Construct { args } => {
                if self.tl().is_class(&ty) {
                    self.emit_construct_class(args, &ty, expr.span)
                } else {
                    self.emit_construct_struct(args, &ty, expr.span)
                }
            }
            ExprKind::EnumCase { case, payload } => self.emit_enum_case(case, payload.as_deref(), &ty, expr.span),
            ExprKind::Call { callee, args } => match self.emit_call(callee, args, &ty, expr.span, None)? {
                CallOutput::Value(value) => Ok(value),
                CallOutput::Initialized => Err(CompileError::lowering("call result has no value", expr.span)),
            },
            ExprKind::Closure(closure) => self.emit_closure(closure, &ty, expr.span),
            ExprKind::FunctionRef(name) => self.emit_function_value(name, &ty, expr.span),
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.emit_rvalue(lhs)?.value;
                let r = self.emit_rvalue(rhs)?.value;
                let value = self.emit_arithmetic(*op, l, r, &lhs.ty, expr.span)?;
                Ok(Managed::unmanaged(value, ty))
            }
            ExprKind::Assign { target, value } => {
                // indices first, then the new value, then the access
                let lv = self.form_lvalue(target)?;
                let value = self.emit_rvalue(value)?;
                self.lvalue_assign(&lv, value)?;
                Ok(self.unit_value())
            }
            ExprKind::CompoundAssign { op, target, value } => {
                self.emit_compound_assign(*op, target, value, expr.span)?;
                Ok(self.unit_value())
            }
            ExprKind::Try { mode, expr: inner } => self.emit_try(*mode, inner, &ty, expr.span),
            ExprKind::Erase(inner) => {
                if ty.is_error_existential() {
                    return self.emit_error_box(inner, &ty);
                }
                let temp = self.alloc_temp(&ty);
                self.erase_into(inner, temp, &ty)?;
                Ok(self.manage(temp, ty))
            }
            ExprKind::Upcast(inner) => {
                let value = self.emit_rvalue(inner)?;
                let ownership = self.ctx.ownership(value.value);
                let operand = value.forward(self);
                let dest = self.new_value(MirType::Object(ty.clone()), ownership);
                self.emit(MirInst::Upcast { dest, operand });
                Ok(self.manage(dest, ty))
            }
            ExprKind::InjectOptional(inner) => {
                if self.is_address_only(&ty) {
                    let temp = self.alloc_temp(&ty);
                    self.inject_some_into(inner, temp, &ty)?;
                    return Ok(self.manage(temp, ty));
                }
                let payload = self.emit_rvalue(inner)?;
                let payload = payload.forward(self);
                let dest = self.new_object(&ty);
                self.emit(MirInst::Enum {
                    dest,
                    case: CaseRef::some(),
                    payload: Some(payload),
                });
                Ok(self.manage(dest, ty))
            }
            ExprKind::Nil => {
                if self.is_address_only(&ty) {
                    let temp = self.alloc_temp(&ty);
                    self.emit(MirInst::InjectEnumAddr {
                        address: temp,
                        case: CaseRef::none(),
                    });
                    return Ok(self.manage(temp, ty));
                }
                let dest = self.none_value(&ty);
                Ok(self.manage(dest, ty))
            }
            ExprKind::ForceUnwrap(inner) => self.emit_force_unwrap(inner, &ty),
            ExprKind::FunctionConversion(inner) => self.emit_function_conversion(inner, &ty, expr.span),
            ExprKind::Metatype => {
                let dest = self.new_value(MirType::Object(ty.clone()), Ownership::Trivial);
                self.emit(MirInst::Metatype { dest });
                Ok(Managed::unmanaged(dest, ty))
            }
            ExprKind::InOut(_) => Err(CompileError::lowering(
                "'&' is only valid for an inout argument",
                expr.span,
            )),
            ExprKind::AddressOf(inner) => self.emit_address_of(inner, &ty, expr.span),
            ExprKind::NativeOwner(inner) => {
                let value = self.emit_rvalue(inner)?;
                let operand = value.forward(self);
                let dest = self.new_value(MirType::Object(Type::NativeObject), Ownership::Owned);
                self.emit(MirInst::UncheckedRefCast { dest, operand });
                Ok(self.manage(dest, Type::NativeObject))
            }
        }
    }

    /// Initialize the uninitialized memory at `address` with `expr`
    pub(crate) fn emit_into(&mut self, expr: &Expr, address: Value) -> Result<()> {
        let ty = expr.ty.clone();
        match &expr.kind {
            ExprKind::Tuple(elems) if self.is_address_only(&ty) => self.tuple_into(elems, address),
            ExprKind::Construct { args } if self.is_address_only(&ty) && !self.tl().is_class(&ty) => {
                self.struct_into(args, address, &ty, expr.span)
            }
            ExprKind::EnumCase { case, payload } if self.is_address_only(&ty) => {
                self.enum_case_into(case, payload.as_deref(), address, &ty, expr.span)
            }
            ExprKind::InjectOptional(inner) if self.is_address_only(&ty) => self.inject_some_into(inner, address, &ty),
            ExprKind::Erase(inner) if !ty.is_error_existential() => self.erase_into(inner, address, &ty),
            ExprKind::Call { callee, args } => match self.emit_call(callee, args, &ty, expr.span, Some(address))? {
                CallOutput::Initialized => Ok(()),
                CallOutput::Value(value) => {
                    self.init_from_managed(value, address, &ty);
                    Ok(())
                }
            },
            _ => {
                let value = self.emit_rvalue(expr)?;
                self.init_from_managed(value, address, &ty);
                Ok(())
            }
        }
    }

    /// Evaluate an expression statement and drop its value
    pub(crate) fn emit_ignored(&mut self, expr: &Expr) -> Result<()> {
        if expr.is_pure_read() {
            return Ok(());
        }
        self.emit_rvalue(expr)?;
        Ok(())
    }

    fn unit_value(&mut self) -> Managed {
        let unit = self.unit();
        Managed::unmanaged(unit, Type::unit())
    }

    pub(crate) fn none_value(&mut self, ty: &Type) -> Value {
        let dest = self.new_object(ty);
        self.emit(MirInst::Enum {
            dest,
            case: CaseRef::none(),
            payload: None,
        });
        dest
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    fn emit_tuple(&mut self, elems: &[Expr], ty: &Type) -> Result<Managed> {
        if self.is_address_only(ty) {
            let temp = self.alloc_temp(ty);
            self.tuple_into(elems, temp)?;
            return Ok(self.manage(temp, ty.clone()));
        }
        let mut values = Vec::new();
        for elem in elems {
            values.push(self.emit_rvalue(elem)?);
        }
        let elements = values.into_iter().map(|v| v.forward(self)).collect();
        let dest = self.new_object(ty);
        self.emit(MirInst::Tuple { dest, elements });
        Ok(self.manage(dest, ty.clone()))
    }

    fn tuple_into(&mut self, elems: &[Expr], address: Value) -> Result<()> {
        let mut initialized = Vec::new();
        for (index, elem) in elems.iter().enumerate() {
            let dest = self.new_address(&elem.ty);
            self.emit(MirInst::TupleElementAddr { dest, address, index });
            self.emit_into(elem, dest)?;
            initialized.push(self.push_cleanup(CleanupKind::DestroyAddr(dest)));
        }
        self.forward_all(initialized);
        Ok(())
    }

    /// Whole-aggregate cleanups replace the per-element ones
    fn forward_all(&mut self, handles: Vec<CleanupHandle>) {
        for handle in handles {
            self.forward_cleanup(handle);
        }
    }

    /// Memberwise arguments paired with the fields they initialize; lazy
    /// backing fields take no argument
    fn memberwise<'e>(
        &self,
        fields: &[crate::types::StoredField],
        args: &'e [Expr],
        ty: &Type,
        span: Span,
    ) -> Result<Vec<Option<&'e Expr>>> {
        let expected = fields.iter().filter(|f| !is_lazy_backing(&f.name)).count();
        if expected != args.len() {
            return Err(CompileError::lowering(
                format!("{ty} takes {expected} memberwise arguments but {} were given", args.len()),
                span,
            ));
        }
        let mut args = args.iter();
        Ok(fields
            .iter()
            .map(|f| if is_lazy_backing(&f.name) { None } else { args.next() })
            .collect())
    }

    fn emit_construct_struct(&mut self, args: &[Expr], ty: &Type, span: Span) -> Result<Managed> {
        if self.is_address_only(ty) {
            let temp = self.alloc_temp(ty);
            self.struct_into(args, temp, ty, span)?;
            return Ok(self.manage(temp, ty.clone()));
        }
        let fields = self.tl().struct_fields(ty)?;
        let plan = self.memberwise(&fields, args, ty, span)?;
        let mut values = Vec::new();
        for (field, arg) in fields.iter().zip(plan) {
            values.push(match arg {
                Some(arg) => self.emit_rvalue(arg)?,
                None => {
                    let none = self.none_value(&field.ty);
                    self.manage(none, field.ty.clone())
                }
            });
        }
        let fields = values.into_iter().map(|v| v.forward(self)).collect();
        let dest = self.new_object(ty);
        self.emit(MirInst::Struct { dest, fields });
        Ok(self.manage(dest, ty.clone()))
    }

    fn struct_into(&mut self, args: &[Expr], address: Value, ty: &Type, span: Span) -> Result<()> {
        let fields = self.tl().struct_fields(ty)?;
        let plan = self.memberwise(&fields, args, ty, span)?;
        let mut initialized = Vec::new();
        for (field, arg) in fields.iter().zip(plan) {
            let dest = self.new_address(&field.ty);
            self.emit(MirInst::StructElementAddr {
                dest,
                address,
                field: field_ref(field),
            });
            match arg {
                Some(arg) => self.emit_into(arg, dest)?,
                None => self.emit(MirInst::InjectEnumAddr {
                    address: dest,
                    case: CaseRef::none(),
                }),
            }
            initialized.push(self.push_cleanup(CleanupKind::DestroyAddr(dest)));
        }
        self.forward_all(initialized);
        Ok(())
    }

    fn emit_construct_class(&mut self, args: &[Expr], ty: &Type, span: Span) -> Result<Managed> {
        let class = ty.nominal_name().unwrap_or_default().to_string();
        let fields = self.tl().class_fields(&class)?;
        let plan = self.memberwise(&fields, args, ty, span)?;
        let mut values = Vec::new();
        for arg in plan.iter().flatten() {
            if self.is_address_only(&arg.ty) {
                return Err(CompileError::lowering(
                    format!("stored property of {class} must be loadable, found {}", arg.ty),
                    arg.span,
                ));
            }
            values.push(self.emit_rvalue(arg)?);
        }
        let values: Vec<Value> = values.into_iter().map(|v| v.forward(self)).collect();
        let object = self.new_value(MirType::Object(ty.clone()), Ownership::Owned);
        self.emit(MirInst::AllocRef { dest: object });
        if fields.is_empty() {
            return Ok(self.manage(object, ty.clone()));
        }
        let borrowed = self.new_value(MirType::Object(ty.clone()), Ownership::Guaranteed);
        self.emit(MirInst::BeginBorrow {
            dest: borrowed,
            operand: object,
        });
        let mut values = values.into_iter();
        for (field, arg) in fields.iter().zip(plan) {
            let address = self.new_address(&field.ty);
            self.emit(MirInst::RefElementAddr {
                dest: address,
                operand: borrowed,
                field: field_ref(field),
            });
            let value = match (arg, values.next()) {
                (Some(_), Some(value)) => value,
                _ => self.none_value(&field.ty),
            };
            self.store_to_storage(value, address, &field.ty, true);
        }
        self.emit(MirInst::EndBorrow {
            borrowed,
            original: object,
        });
        Ok(self.manage(object, ty.clone()))
    }

    // ------------------------------------------------------------------
    // Enums and optionals
    // ------------------------------------------------------------------

    fn case_ref(ty: &Type, case: &str) -> CaseRef {
        CaseRef::new(TypeLowering::enum_owner_name(ty), case)
    }

    fn emit_enum_case(&mut self, case: &str, payload: Option<&Expr>, ty: &Type, span: Span) -> Result<Managed> {
        if self.is_address_only(ty) {
            let temp = self.alloc_temp(ty);
            self.enum_case_into(case, payload, temp, ty, span)?;
            return Ok(self.manage(temp, ty.clone()));
        }
        self.check_payload(case, payload, ty, span)?;
        let payload = match payload {
            Some(expr) => {
                let value = self.emit_rvalue(expr)?;
                Some(value.forward(self))
            }
            None => None,
        };
        let dest = self.new_object(ty);
        self.emit(MirInst::Enum {
            dest,
            case: Self::case_ref(ty, case),
            payload,
        });
        Ok(self.manage(dest, ty.clone()))
    }

    fn enum_case_into(&mut self, case: &str, payload: Option<&Expr>, address: Value, ty: &Type, span: Span) -> Result<()> {
        self.check_payload(case, payload, ty, span)?;
        let case = Self::case_ref(ty, case);
        if let Some(expr) = payload {
            let data = self.new_address(&expr.ty);
            self.emit(MirInst::InitEnumDataAddr {
                dest: data,
                address,
                case: case.clone(),
            });
            self.emit_into(expr, data)?;
        }
        self.emit(MirInst::InjectEnumAddr { address, case });
        Ok(())
    }

    fn check_payload(&self, case: &str, payload: Option<&Expr>, ty: &Type, span: Span) -> Result<()> {
        let declared = self.tl().case_payload(ty, case)?;
        if declared.is_some() != payload.is_some() {
            return Err(CompileError::lowering(
                format!("case {case} of {ty} payload mismatch"),
                span,
            ));
        }
        Ok(())
    }

    fn inject_some_into(&mut self, inner: &Expr, address: Value, ty: &Type) -> Result<()> {
        let payload_ty = ty.optional_payload().cloned().unwrap_or_else(|| inner.ty.clone());
        let data = self.new_address(&payload_ty);
        self.emit(MirInst::InitEnumDataAddr {
            dest: data,
            address,
            case: CaseRef::some(),
        });
        self.emit_into(inner, data)?;
        self.emit(MirInst::InjectEnumAddr {
            address,
            case: CaseRef::some(),
        });
        Ok(())
    }

    /// Unwrap an optional, trapping on `nil`
    fn emit_force_unwrap(&mut self, inner: &Expr, ty: &Type) -> Result<Managed> {
        let some = self.ctx.fresh_label();
        let none = self.ctx.fresh_label();
        if self.is_address_only(&inner.ty) {
            let optional = self.emit_rvalue_in_memory(inner)?;
            let address = optional.forward(self);
            self.ctx.finish_block(Terminator::SwitchEnumAddr {
                address,
                cases: vec![(CaseRef::some(), some.clone()), (CaseRef::none(), none.clone())],
                default: None,
            });
            self.emit_nil_trap(none);
            self.ctx.start_block(some, Vec::new());
            let payload = self.new_address(ty);
            self.emit(MirInst::UncheckedTakeEnumDataAddr {
                dest: payload,
                address,
                case: CaseRef::some(),
            });
            return Ok(self.manage(payload, ty.clone()));
        }
        let optional = self.emit_rvalue(inner)?;
        let operand = optional.forward(self);
        self.ctx.finish_block(Terminator::SwitchEnum {
            operand,
            cases: vec![(CaseRef::some(), some.clone()), (CaseRef::none(), none.clone())],
            default: None,
        });
        self.emit_nil_trap(none);
        let payload = self.new_object(ty);
        self.ctx.start_block(some, vec![payload]);
        Ok(self.manage(payload, ty.clone()))
    }

    fn emit_nil_trap(&mut self, label: String) {
        self.ctx.start_block(label, Vec::new());
        let dest = self.new_value(MirType::Object(Type::unit()), Ownership::Trivial);
        self.emit(MirInst::Builtin {
            dest,
            name: "unexpectedNil".to_string(),
            args: Vec::new(),
        });
        self.ctx.finish_block(Terminator::Unreachable);
    }

    // ------------------------------------------------------------------
    // Existentials
    // ------------------------------------------------------------------

    fn erase_into(&mut self, inner: &Expr, address: Value, ty: &Type) -> Result<()> {
        if matches!(inner.ty, Type::Existential(_)) {
            let value = self.emit_rvalue(inner)?;
            self.init_from_managed(value, address, ty);
            return Ok(());
        }
        let payload = self.new_address(&inner.ty);
        self.emit(MirInst::InitExistentialAddr {
            dest: payload,
            address,
            concrete: inner.ty.clone(),
        });
        self.emit_into(inner, payload)
    }

    /// `Error` values live in a reference-counted box
    fn emit_error_box(&mut self, inner: &Expr, ty: &Type) -> Result<Managed> {
        if inner.ty.is_error_existential() {
            return self.emit_rvalue(inner);
        }
        let boxed = self.new_value(MirType::Object(ty.clone()), Ownership::Owned);
        self.emit(MirInst::AllocExistentialBox {
            dest: boxed,
            concrete: inner.ty.clone(),
        });
        let managed = self.manage(boxed, ty.clone());
        let payload = self.new_address(&inner.ty);
        self.emit(MirInst::ProjectExistentialBox {
            dest: payload,
            operand: boxed,
        });
        self.emit_into(inner, payload)?;
        Ok(managed)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    /// Builtin arithmetic; integer overflow traps
    pub(crate) fn emit_arithmetic(&mut self, op: BinOp, lhs: Value, rhs: Value, ty: &Type, span: Span) -> Result<Value> {
        if *ty == Type::Double {
            let name = match op {
                BinOp::Add => "fadd",
                BinOp::Sub => "fsub",
                BinOp::Mul => "fmul",
                BinOp::Eq => "fcmp_oeq",
                BinOp::Ne => "fcmp_une",
                BinOp::Lt => "fcmp_olt",
                BinOp::Le => "fcmp_ole",
                BinOp::Gt => "fcmp_ogt",
                BinOp::Ge => "fcmp_oge",
            };
            let result_ty = if op.is_comparison() { Type::Bool } else { Type::Double };
            return Ok(self.builtin(format!("{name}_FPIEEE64"), vec![lhs, rhs], result_ty));
        }
        let width = match ty {
            Type::Int => "Int64",
            Type::Int32 => "Int32",
            Type::Bool if matches!(op, BinOp::Eq | BinOp::Ne) => "Int1",
            other => {
                return Err(CompileError::lowering(
                    format!("operator {op:?} is not defined on {other}"),
                    span,
                ));
            }
        };
        let name = format!("{}_{width}", op.builtin_stem());
        if op.is_comparison() {
            return Ok(self.builtin(name, vec![lhs, rhs], Type::Bool));
        }
        let pair = self.builtin(name, vec![lhs, rhs], Type::Tuple(vec![ty.clone(), Type::Bool]));
        let result = self.new_value(MirType::Object(ty.clone()), Ownership::Trivial);
        self.emit(MirInst::TupleExtract {
            dest: result,
            operand: pair,
            index: 0,
        });
        let overflow = self.new_value(MirType::Object(Type::Bool), Ownership::Trivial);
        self.emit(MirInst::TupleExtract {
            dest: overflow,
            operand: pair,
            index: 1,
        });
        self.emit(MirInst::CondFail {
            operand: overflow,
            message: "arithmetic overflow".to_string(),
        });
        Ok(result)
    }

    pub(crate) fn builtin(&mut self, name: String, args: Vec<Value>, result_ty: Type) -> Value {
        let dest = self.new_value(MirType::Object(result_ty), Ownership::Trivial);
        self.emit(MirInst::Builtin { dest, name, args });
        dest
    }

    /// `target op= value`: one modify access around load, operate, store
    fn emit_compound_assign(&mut self, op: BinOp, target: &Expr, value: &Expr, span: Span) -> Result<()> {
        if op.is_comparison() || !self.is_trivial(&target.ty) {
            return Err(CompileError::lowering(
                format!("compound assignment {op:?} on {}", target.ty),
                span,
            ));
        }
        let lv = self.form_lvalue(target)?;
        let rhs = self.emit_rvalue(value)?.value;
        let mut access = FormalAccess::new(lv, AccessKind::Modify);
        let address = access.open(self)?;
        let old = self.load_copy(address, &target.ty);
        let result = self.emit_arithmetic(op, old, rhs, &target.ty, span)?;
        self.store_assign(result, address, &target.ty);
        access.close(self)
    }

    // ------------------------------------------------------------------
    // Functions and pointers
    // ------------------------------------------------------------------

    fn emit_function_value(&mut self, name: &str, ty: &Type, span: Span) -> Result<Managed> {
        let function = self.function_ref(name)?;
        let Some(formal) = ty.as_function() else {
            return Err(CompileError::lowering(format!("{name} used as a value of type {ty}"), span));
        };
        if formal.representation == Representation::Thin {
            return Ok(Managed::unmanaged(function, ty.clone()));
        }
        let dest = self.new_value(MirType::Object(ty.clone()), Ownership::Trivial);
        self.emit(MirInst::ThinToThickFunction {
            dest,
            operand: function,
        });
        Ok(Managed::unmanaged(dest, ty.clone()))
    }

    /// Pointer to an lvalue's storage, valid while the access stays open
    fn emit_address_of(&mut self, inner: &Expr, ty: &Type, span: Span) -> Result<Managed> {
        let kind = match ty {
            Type::UnsafeMutablePointer(_) => AccessKind::Modify,
            Type::UnsafePointer(_) => AccessKind::Read,
            other => {
                return Err(CompileError::lowering(format!("cannot take the address as {other}"), span));
            }
        };
        let outer = std::mem::replace(&mut self.direct_storage, true);
        let lv = self.form_lvalue(inner);
        self.direct_storage = outer;
        let address = self.lvalue_storage_address(&lv?, kind)?;
        let raw = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
        self.emit(MirInst::AddressToPointer { dest: raw, address });
        let dest = self.new_value(MirType::Object(ty.clone()), Ownership::Trivial);
        self.emit(MirInst::Struct {
            dest,
            fields: vec![raw],
        });
        Ok(Managed::unmanaged(dest, ty.clone()))
    }
}

fn is_lazy_backing(field: &str) -> bool {
    field.starts_with("$__lazy_storage_$")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_backing_names() {
        assert!(is_lazy_backing(&lazy_storage_name("total")));
        assert!(!is_lazy_backing("total"));
    }
}
