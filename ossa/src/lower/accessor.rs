//! Synthesized accessors of properties and subscripts
//!
//! | storage   | getter          | setter                  | materializeForSet        |
//! |-----------|-----------------|-------------------------|--------------------------|
//! | stored    | field read      | field write             | field address            |
//! | observed  | field read      | willSet, write, didSet  | buffer + callback        |
//! | lazy      | init on first   | backing = some(new)     | buffer + callback        |
//! | computed  | `get` body      | `set` body              | buffer + callback        |
//! | addressed | via addressor   | via mutable addressor   | addressor + owner buffer |
//!
//! Getters and setters name their own storage, which makes stored members
//! of the declaring type physical inside them even when the class could be
//! subclassed.

use super::closure::escaping_captures;
use super::{Binding, FunctionLowering, LowerEnv};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::types::names::{self, AccessorKind};
use crate::types::{ArgConvention, OwnerKind};

/// A property or subscript whose accessors are being synthesized
#[derive(Debug, Clone)]
pub struct StorageDecl<'m> {
    pub owner: &'m str,
    pub owner_kind: OwnerKind,
    /// Property name, or [`names::SUBSCRIPT`]
    pub member: &'m str,
    /// Declared type; may be `Weak`/`Unowned` reference storage
    pub ty: &'m Type,
    pub index: Option<&'m Param>,
    pub storage: &'m Storage,
    pub span: Span,
}

impl StorageDecl<'_> {
    fn value_ty(&self) -> &Type {
        self.ty.referent()
    }

    fn is_reference_storage(&self) -> bool {
        self.ty.referent() != self.ty
    }
}

pub(crate) fn lower_accessor(env: &LowerEnv<'_>, storage: &StorageDecl<'_>, kind: AccessorKind) -> Result<Vec<MirFunction>> {
    let tl = env.tl;
    let name = names::accessor_name(storage.owner, storage.member, kind);
    let ty = tl.function_type(&name)?.clone();
    let result_ty = match kind {
        AccessorKind::Getter => storage.value_ty().clone(),
        _ => ty.sig.result.ty.clone(),
    };
    let mut fl = FunctionLowering::new(env, name, ty, result_ty);
    for param in tl.owner_generic_constraints(storage.owner) {
        fl.constraints.insert(param.name, param.conforms_to);
    }
    fl.bind_params(&param_names(storage, kind))?;
    let self_expr = Expr::var("self", tl.self_type(storage.owner)).with_span(storage.span);

    match kind {
        AccessorKind::Getter => {
            fl.storage_owner = Some((storage.owner.to_string(), storage.member.to_string()));
            fl.lower_getter(storage, self_expr)?;
        }
        AccessorKind::Setter => {
            fl.storage_owner = Some((storage.owner.to_string(), storage.member.to_string()));
            fl.lower_setter(storage, self_expr)?;
        }
        AccessorKind::WillSet | AccessorKind::DidSet => {
            let body = match (storage.storage, kind) {
                (Storage::Observed { will_set: Some(body), .. }, AccessorKind::WillSet) => body,
                (Storage::Observed { did_set: Some(body), .. }, AccessorKind::DidSet) => body,
                _ => return Err(missing(storage, kind)),
            };
            fl.boxed_vars = escaping_captures(body);
            fl.lower_body(body)?;
        }
        AccessorKind::UnsafeAddressor | AccessorKind::UnsafeMutableAddressor => {
            let Storage::Addressed { kind: addressor, read, modify } = storage.storage else {
                return Err(missing(storage, kind));
            };
            let body = if kind == AccessorKind::UnsafeAddressor {
                read
            } else {
                modify.as_ref().ok_or_else(|| missing(storage, kind))?
            };
            if *addressor == AddressorKind::PinnedNativeOwner {
                fl.return_hook = Some(super::ReturnHook::PinOwner);
            }
            fl.boxed_vars = escaping_captures(body);
            fl.lower_body(body)?;
        }
        AccessorKind::MaterializeForSet => fl.lower_materialize_for_set(storage, self_expr)?,
        AccessorKind::MaterializeForSetCallback => fl.lower_materialize_callback(storage)?,
    }
    fl.finish()
}

fn missing(storage: &StorageDecl<'_>, kind: AccessorKind) -> CompileError {
    CompileError::lowering(
        format!("{}.{} has no {kind} to synthesize", storage.owner, storage.member),
        storage.span,
    )
}

/// Source names of an accessor's parameters, in signature order
fn param_names<'m>(storage: &StorageDecl<'m>, kind: AccessorKind) -> Vec<&'m str> {
    let index = storage.index.map(|p| p.name.as_str());
    let mut names = Vec::new();
    match kind {
        AccessorKind::Getter | AccessorKind::UnsafeAddressor | AccessorKind::UnsafeMutableAddressor => {
            names.extend(index);
            names.push("self");
        }
        AccessorKind::Setter => {
            names.push("newValue");
            names.extend(index);
            names.push("self");
        }
        AccessorKind::WillSet => names.extend(["newValue", "self"]),
        AccessorKind::DidSet => names.extend(["oldValue", "self"]),
        AccessorKind::MaterializeForSet => {
            names.extend(["$buffer", "$storage"]);
            names.extend(index);
            names.push("self");
        }
        AccessorKind::MaterializeForSetCallback => {
            names.extend(["$buffer", "$storage"]);
            names.extend(index);
            names.extend(["self", "$metatype"]);
        }
    }
    names
}

/// `self.member` or `self[index]`
fn member_expr(storage: &StorageDecl<'_>, self_expr: Expr) -> Expr {
    let value_ty = storage.value_ty().clone();
    let expr = match storage.index {
        Some(index) => Expr::subscript(self_expr, Expr::var(index.name.clone(), index.ty.clone()), value_ty),
        None => Expr::member(self_expr, storage.member, value_ty),
    };
    expr.with_span(storage.span)
}

/// Progress through a materializeForSet body. Each step happens at most
/// once and in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MaterializeState {
    Start,
    BufferAllocated,
    CallbackRegistered,
    Done,
}

struct Materializer {
    state: MaterializeState,
}

impl Materializer {
    fn new() -> Self {
        Materializer {
            state: MaterializeState::Start,
        }
    }

    fn advance(&mut self, next: MaterializeState, storage: &StorageDecl<'_>) -> Result<()> {
        if next <= self.state {
            return Err(CompileError::lowering(
                format!(
                    "materializeForSet of {}.{} moved from {:?} to {next:?}",
                    storage.owner, storage.member, self.state
                ),
                storage.span,
            ));
        }
        tracing::trace!(owner = storage.owner, member = storage.member, from = ?self.state, to = ?next, "materialize");
        self.state = next;
        Ok(())
    }
}

/// Where a materialized temporary lives
#[derive(Debug, Clone, Copy)]
enum BufferSlot {
    /// In the caller's scratch space, reached through `$buffer`
    Inline,
    /// Out of line, owned by the `$storage` value buffer
    Allocated,
}

impl<'a> FunctionLowering<'a> {
    fn lower_getter(&mut self, storage: &StorageDecl<'_>, self_expr: Expr) -> Result<()> {
        match storage.storage {
            Storage::Computed { get, .. } => {
                self.boxed_vars = escaping_captures(get);
                self.lower_body(get)
            }
            Storage::Lazy { initial } => self.lower_lazy_getter(storage, self_expr, initial),
            Storage::Stored { .. } | Storage::Observed { .. } | Storage::Addressed { .. } => {
                let read = member_expr(storage, self_expr);
                self.lower_body(&[Stmt::Return(Some(read))])
            }
        }
    }

    fn lower_setter(&mut self, storage: &StorageDecl<'_>, self_expr: Expr) -> Result<()> {
        let value_ty = storage.value_ty().clone();
        let new_value = Expr::var("newValue", value_ty.clone()).with_span(storage.span);
        match storage.storage {
            Storage::Computed { set: Some(body), .. } => {
                self.boxed_vars = escaping_captures(body);
                self.lower_body(body)
            }
            Storage::Computed { set: None, .. } => Err(missing(storage, AccessorKind::Setter)),
            Storage::Lazy { .. } => {
                let backing = Expr::member(
                    self_expr,
                    lazy_storage_name(storage.member),
                    Type::optional(value_ty),
                );
                self.lower_body(&[Stmt::Expr(Expr::assign(backing, Expr::some(new_value)))])
            }
            Storage::Observed { will_set, did_set, .. } => {
                self.lower_observed_setter(storage, self_expr, will_set.is_some(), did_set.is_some())
            }
            Storage::Stored { .. } | Storage::Addressed { .. } => {
                let target = member_expr(storage, self_expr);
                self.lower_body(&[Stmt::Expr(Expr::assign(target, new_value))])
            }
        }
    }

    /// Copy the old value for `didSet`, call `willSet`, store, call `didSet`
    fn lower_observed_setter(
        &mut self,
        storage: &StorageDecl<'_>,
        self_expr: Expr,
        has_will_set: bool,
        has_did_set: bool,
    ) -> Result<()> {
        let span = storage.span;
        let value_ty = storage.value_ty().clone();
        let target = member_expr(storage, self_expr);
        let depth = self.cleanup_depth();

        let old_value = if has_did_set {
            Some(self.read_old_value(&target, &value_ty)?)
        } else {
            None
        };
        if has_will_set {
            let new_value = match self.lookup("newValue", span)? {
                Binding::Value { value, .. } => value,
                Binding::Address { address, .. } => address,
            };
            self.call_sibling(storage, AccessorKind::WillSet, vec![new_value], &Type::unit())?;
        }

        let new_value = Expr::var("newValue", value_ty).with_span(span);
        self.emit_ignored(&Expr::assign(target, new_value))?;

        if let Some(old_value) = old_value {
            let old_value = old_value.forward(self);
            self.call_sibling(storage, AccessorKind::DidSet, vec![old_value], &Type::unit())?;
        }
        self.pop_cleanups(depth)?;
        let unit = self.unit();
        self.emit_return(unit)
    }

    /// +1 copy of the stored value whose read access has already ended
    fn read_old_value(&mut self, target: &Expr, value_ty: &Type) -> Result<super::Managed> {
        let temp = self.is_address_only(value_ty).then(|| self.alloc_temp(value_ty));
        let depth = self.cleanup_depth();
        let lv = self.form_lvalue(target)?;
        let read = self.lvalue_read(&lv)?;
        let raw = match temp {
            Some(temp) => {
                self.init_from_managed(read, temp, value_ty);
                temp
            }
            None if read.is_owned() => read.forward(self),
            None => self.copy_value(read.value, value_ty),
        };
        self.pop_cleanups(depth)?;
        Ok(self.manage(raw, value_ty.clone()))
    }

    /// Return the backing optional's payload, or evaluate the initial
    /// value, store it and return it
    fn lower_lazy_getter(&mut self, storage: &StorageDecl<'_>, self_expr: Expr, initial: &Expr) -> Result<()> {
        let value_ty = storage.value_ty().clone();
        if initial.ty != value_ty {
            return Err(CompileError::lowering(
                format!("lazy initial value of {}.{} has type {}, expected {value_ty}", storage.owner, storage.member, initial.ty),
                initial.span,
            ));
        }
        self.boxed_vars = escaping_captures(std::slice::from_ref(&Stmt::Expr(initial.clone())));
        let backing_ty = Type::optional(value_ty.clone());
        let backing = Expr::member(self_expr, lazy_storage_name(storage.member), backing_ty.clone()).with_span(storage.span);
        if self.is_address_only(&value_ty) {
            return self.lower_lazy_getter_indirect(&backing, &backing_ty, &value_ty, initial);
        }

        let depth = self.cleanup_depth();
        let lv = self.form_lvalue(&backing)?;
        let current = self.lvalue_read(&lv)?.forward(self);
        self.pop_cleanups(depth)?;

        let some = self.ctx.fresh_label();
        let none = self.ctx.fresh_label();
        self.ctx.finish_block(Terminator::SwitchEnum {
            operand: current,
            cases: vec![(CaseRef::some(), some.clone()), (CaseRef::none(), none.clone())],
            default: None,
        });
        let ownership = self.owned_kind(&value_ty);
        let payload = self.new_value(MirType::Object(value_ty.clone()), ownership);
        self.ctx.start_block(some, vec![payload]);
        self.emit_return(payload)?;

        self.ctx.start_block(none, Vec::new());
        let depth = self.cleanup_depth();
        let value = self.emit_rvalue(initial)?;
        let value = if value.is_owned() {
            value.forward(self)
        } else {
            self.copy_value(value.value, &value_ty)
        };
        let copy = self.copy_value(value, &value_ty);
        let wrapped = self.new_object(&backing_ty);
        self.emit(MirInst::Enum {
            dest: wrapped,
            case: CaseRef::some(),
            payload: Some(copy),
        });
        let wrapped = self.manage(wrapped, backing_ty);
        let lv = self.form_lvalue(&backing)?;
        self.lvalue_assign(&lv, wrapped)?;
        self.pop_cleanups(depth)?;
        self.emit_return(value)
    }

    /// Lazy getter of an address-only value, returned indirectly
    fn lower_lazy_getter_indirect(&mut self, backing: &Expr, backing_ty: &Type, value_ty: &Type, initial: &Expr) -> Result<()> {
        let out = self
            .indirect_result
            .ok_or_else(|| CompileError::lowering("address-only lazy getter without an indirect result", backing.span))?;
        let current = self.alloc_temp(backing_ty);
        let depth = self.cleanup_depth();
        let lv = self.form_lvalue(backing)?;
        let read = self.lvalue_read(&lv)?;
        self.init_from_managed(read, current, backing_ty);
        self.pop_cleanups(depth)?;

        let some = self.ctx.fresh_label();
        let none = self.ctx.fresh_label();
        self.ctx.finish_block(Terminator::SwitchEnumAddr {
            address: current,
            cases: vec![(CaseRef::some(), some.clone()), (CaseRef::none(), none.clone())],
            default: None,
        });
        self.ctx.start_block(some, Vec::new());
        let payload = self.new_address(value_ty);
        self.emit(MirInst::UncheckedTakeEnumDataAddr {
            dest: payload,
            address: current,
            case: CaseRef::some(),
        });
        self.copy_addr(payload, out, true, true);
        let unit = self.unit();
        self.emit_return(unit)?;

        self.ctx.start_block(none, Vec::new());
        let depth = self.cleanup_depth();
        self.emit_into(initial, out)?;
        let wrapped = self.alloc_temp(backing_ty);
        let wrapped_payload = self.new_address(value_ty);
        self.emit(MirInst::InitEnumDataAddr {
            dest: wrapped_payload,
            address: wrapped,
            case: CaseRef::some(),
        });
        self.copy_addr(out, wrapped_payload, false, true);
        self.emit(MirInst::InjectEnumAddr {
            address: wrapped,
            case: CaseRef::some(),
        });
        let wrapped = self.manage(wrapped, backing_ty.clone());
        let lv = self.form_lvalue(backing)?;
        self.lvalue_assign(&lv, wrapped)?;
        self.pop_cleanups(depth)?;
        let unit = self.unit();
        self.emit_return(unit)
    }

    fn lower_materialize_for_set(&mut self, storage: &StorageDecl<'_>, self_expr: Expr) -> Result<()> {
        let mut state = Materializer::new();
        let (raw, needs_callback) = match storage.storage {
            Storage::Stored { .. } if !storage.is_reference_storage() => (self.stored_field_pointer(storage)?, false),
            Storage::Addressed { kind, .. } => (
                self.materialize_through_addressor(storage, *kind, &mut state)?,
                *kind != AddressorKind::Unsafe,
            ),
            _ => (self.materialize_into_buffer(storage, self_expr, &mut state)?, true),
        };

        let callback_ty = Type::optional(Type::RawPointer);
        let callback = if needs_callback {
            let name = names::accessor_name(storage.owner, storage.member, AccessorKind::MaterializeForSetCallback);
            let function = self.function_ref(&name)?;
            let pointer = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
            self.emit(MirInst::ThinFunctionToPointer {
                dest: pointer,
                operand: function,
            });
            let wrapped = self.new_value(MirType::Object(callback_ty), Ownership::Trivial);
            self.emit(MirInst::Enum {
                dest: wrapped,
                case: CaseRef::some(),
                payload: Some(pointer),
            });
            state.advance(MaterializeState::CallbackRegistered, storage)?;
            wrapped
        } else {
            self.none_value(&callback_ty)
        };
        let result_ty = self.ty.sig.result.ty.clone();
        let result = self.new_value(MirType::Object(result_ty), Ownership::Trivial);
        self.emit(MirInst::Tuple {
            dest: result,
            elements: vec![raw, callback],
        });
        self.emit_return(result)?;
        state.advance(MaterializeState::Done, storage)
    }

    /// Address of a stored field, handed out without a temporary
    fn stored_field_pointer(&mut self, storage: &StorageDecl<'_>) -> Result<Value> {
        let self_ty = self.tl().self_type(storage.owner);
        let field = self.tl().field(&self_ty, storage.member)?;
        let address = self.new_address(&field.ty);
        let field_ref = super::lvalue::field_ref(&field);
        match self.lookup("self", storage.span)? {
            Binding::Value { value, .. } if storage.owner_kind == OwnerKind::Class => {
                self.emit(MirInst::RefElementAddr {
                    dest: address,
                    operand: value,
                    field: field_ref,
                });
            }
            Binding::Address { address: base, .. } => {
                self.emit(MirInst::StructElementAddr {
                    dest: address,
                    address: base,
                    field: field_ref,
                });
            }
            Binding::Value { .. } => {
                return Err(CompileError::lowering(
                    format!("materializeForSet of {}.{} needs a mutable self", storage.owner, storage.member),
                    storage.span,
                ))
            }
        }
        Ok(self.address_to_pointer(address))
    }

    /// Copy the current value into a temporary the callback writes back
    fn materialize_into_buffer(
        &mut self,
        storage: &StorageDecl<'_>,
        self_expr: Expr,
        state: &mut Materializer,
    ) -> Result<Value> {
        let value_ty = storage.value_ty().clone();
        let temp = match self.buffer_slot(&value_ty) {
            BufferSlot::Inline => {
                let buffer = self.sibling_param("$buffer", storage.span)?;
                let temp = self.new_address(&value_ty);
                self.emit(MirInst::PointerToAddress {
                    dest: temp,
                    pointer: buffer,
                });
                temp
            }
            BufferSlot::Allocated => {
                let buffer = self.sibling_param("$storage", storage.span)?;
                let temp = self.new_address(&value_ty);
                self.emit(MirInst::AllocValueBuffer { dest: temp, buffer });
                temp
            }
        };
        state.advance(MaterializeState::BufferAllocated, storage)?;

        let depth = self.cleanup_depth();
        let current = self.emit_rvalue(&member_expr(storage, self_expr))?;
        self.init_from_managed(current, temp, &value_ty);
        self.pop_cleanups(depth)?;
        Ok(self.address_to_pointer(temp))
    }

    /// Call the mutable addressor; an owner or pin token is parked in the
    /// buffer until the callback releases it
    fn materialize_through_addressor(
        &mut self,
        storage: &StorageDecl<'_>,
        kind: AddressorKind,
        state: &mut Materializer,
    ) -> Result<Value> {
        let value_ty = storage.value_ty().clone();
        let result_ty = crate::types::addressor_result(&value_ty, true, kind);
        let args = self.sibling_index(storage, AccessorKind::UnsafeMutableAddressor)?;
        let result = self.call_sibling(storage, AccessorKind::UnsafeMutableAddressor, args, &result_ty)?;
        let parts = self.destructure(result, &result_ty);
        let pointer_ty = match &result_ty {
            Type::Tuple(elems) => elems[0].clone(),
            other => other.clone(),
        };
        if let (Type::Tuple(elems), Some(&owner)) = (&result_ty, parts.get(1)) {
            let owner_ty = elems[1].clone();
            let buffer = self.sibling_param("$buffer", storage.span)?;
            let slot = self.new_address(&owner_ty);
            self.emit(MirInst::PointerToAddress {
                dest: slot,
                pointer: buffer,
            });
            self.store_init(owner, slot, &owner_ty);
            state.advance(MaterializeState::BufferAllocated, storage)?;
        }
        let field = self.tl().struct_fields(&pointer_ty)?.into_iter().next().ok_or_else(|| {
            CompileError::lowering(format!("{pointer_ty} has no raw pointer"), storage.span)
        })?;
        let raw = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
        self.emit(MirInst::StructExtract {
            dest: raw,
            operand: parts[0],
            field: super::lvalue::field_ref(&field),
        });
        Ok(raw)
    }

    /// Write the materialized value back, or release the addressor's owner
    fn lower_materialize_callback(&mut self, storage: &StorageDecl<'_>) -> Result<()> {
        let span = storage.span;
        let buffer = self.sibling_param("$buffer", span)?;
        if let Storage::Addressed { kind, .. } = storage.storage {
            let owner_ty = match kind {
                AddressorKind::NativeOwner => Type::NativeObject,
                AddressorKind::PinnedNativeOwner => Type::optional(Type::NativeObject),
                AddressorKind::Unsafe => return Err(missing(storage, AccessorKind::MaterializeForSetCallback)),
            };
            let slot = self.new_address(&owner_ty);
            self.emit(MirInst::PointerToAddress {
                dest: slot,
                pointer: buffer,
            });
            let owner = self.load_take(slot, &owner_ty);
            if *kind == AddressorKind::NativeOwner {
                self.destroy_value(owner);
            } else {
                self.emit(MirInst::StrongUnpin { operand: owner });
            }
            let unit = self.unit();
            return self.emit_return(unit);
        }

        let value_ty = storage.value_ty().clone();
        let slot = self.buffer_slot(&value_ty);
        let value_buffer = self.sibling_param("$storage", span)?;
        let temp = self.new_address(&value_ty);
        match slot {
            BufferSlot::Inline => self.emit(MirInst::PointerToAddress {
                dest: temp,
                pointer: buffer,
            }),
            BufferSlot::Allocated => self.emit(MirInst::ProjectValueBuffer {
                dest: temp,
                buffer: value_buffer,
            }),
        }
        let new_value = if self.is_address_only(&value_ty) {
            temp
        } else {
            self.load_take(temp, &value_ty)
        };
        let mut args = vec![new_value];
        args.extend(self.sibling_index(storage, AccessorKind::Setter)?);
        self.call_sibling(storage, AccessorKind::Setter, args, &Type::unit())?;
        if let BufferSlot::Allocated = slot {
            self.emit(MirInst::DeallocValueBuffer {
                buffer: value_buffer,
                ty: value_ty,
            });
        }
        let unit = self.unit();
        self.emit_return(unit)
    }

    fn buffer_slot(&self, value_ty: &Type) -> BufferSlot {
        let words = self.env.config.value_buffer_words;
        match self.tl().size_in_words(value_ty) {
            Some(size) if size <= words => BufferSlot::Inline,
            _ => BufferSlot::Allocated,
        }
    }

    fn address_to_pointer(&mut self, address: Value) -> Value {
        let pointer = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
        self.emit(MirInst::AddressToPointer { dest: pointer, address });
        pointer
    }

    /// Value of a parameter bound by name
    fn sibling_param(&self, name: &str, span: Span) -> Result<Value> {
        Ok(match self.lookup(name, span)? {
            Binding::Value { value, .. } => value,
            Binding::Address { address, .. } => address,
        })
    }

    /// The index argument for a sibling accessor, copied when it consumes it
    fn sibling_index(&mut self, storage: &StorageDecl<'_>, kind: AccessorKind) -> Result<Vec<Value>> {
        let Some(index) = storage.index else {
            return Ok(Vec::new());
        };
        let name = names::accessor_name(storage.owner, storage.member, kind);
        let ty = self.tl().function_type(&name)?;
        let position = match kind {
            AccessorKind::Setter => 1,
            _ => 0,
        };
        let convention = ty.sig.params.get(position).map(|p| p.convention).unwrap_or(ArgConvention::Guaranteed);
        let value = self.sibling_param(&index.name, storage.span)?;
        Ok(vec![if convention == ArgConvention::Owned {
            self.copy_value(value, &index.ty)
        } else {
            value
        }])
    }

    /// Call another accessor of the same storage directly. `args` precede
    /// the trailing `self`, which is passed in the callee's convention.
    fn call_sibling(
        &mut self,
        storage: &StorageDecl<'_>,
        kind: AccessorKind,
        mut args: Vec<Value>,
        result_ty: &Type,
    ) -> Result<Value> {
        let name = names::accessor_name(storage.owner, storage.member, kind);
        let ty = self.tl().function_type(&name)?.clone();
        let convention = ty.sig.params.last().map(|p| p.convention).unwrap_or(ArgConvention::Guaranteed);
        let depth = self.cleanup_depth();
        let self_ty = self.tl().self_type(storage.owner);
        let self_value = self.self_argument(&self_ty, convention, storage.span)?;
        args.push(self_value);
        let callee = self.function_ref_typed(&name, ty.clone());
        let result = self.emit_apply(callee, &ty, None, args, result_ty, storage.span)?;
        self.pop_cleanups(depth)?;
        Ok(result)
    }

    /// `self` in `convention`, with the access or borrow it needs pushed as
    /// a cleanup
    fn self_argument(&mut self, self_ty: &Type, convention: ArgConvention, span: Span) -> Result<Value> {
        if let Binding::Value { value, .. } = self.lookup("self", span)? {
            if !convention.is_indirect() {
                return Ok(value);
            }
        }
        let lv = self.form_lvalue(&Expr::var("self", self_ty.clone()).with_span(span))?;
        match convention {
            ArgConvention::InOut | ArgConvention::InoutAliasable => self.lvalue_address(&lv, AccessKind::Modify),
            c if c.is_indirect() => self.lvalue_address(&lv, AccessKind::Read),
            _ => {
                let address = self.lvalue_address(&lv, AccessKind::Read)?;
                Ok(self.load_borrow(address, self_ty))
            }
        }
    }
}
