//! Storage references
//!
//! An lvalue is formed in two phases. Formation walks the expression,
//! evaluates subscript indices and records one component per projection
//! without touching memory. Access then projects the components in order,
//! opening `begin_access` scopes as late as possible, and either reads,
//! assigns or yields an address for an in-place modification.
//!
//! Components are physical (a stored field, a tuple element, memory handed
//! out by an addressor) or logical (a getter/setter pair, a protocol
//! requirement). Modifying through a logical component materializes the
//! value in a temporary and registers a writeback cleanup; dynamically
//! dispatched class members go through `materializeForSet` instead.

use super::access::{AccessBase, StorageClass};
use super::cleanup::{CleanupDepth, CleanupHandle, CleanupKind};
use super::{Binding, FunctionLowering, Managed};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::tables::requirement_type;
use crate::types::names::{self, AccessorKind};
use crate::types::{accessor_kinds, addressor_result, ArgConvention, OwnerKind, StoredField};

use std::collections::HashMap;

/// A formed lvalue: root plus projections, indices already evaluated
#[derive(Debug, Clone)]
pub(crate) struct LValue {
    root: Root,
    components: Vec<Component>,
    /// Formal type of the referenced value
    pub(crate) ty: Type,
    span: Span,
}

#[derive(Debug, Clone)]
enum Root {
    Address {
        address: Value,
        ty: Type,
        storage: StorageClass,
        base: AccessBase,
        mutable: bool,
    },
    /// Value in a register: an immutable binding or an evaluated base
    Object { value: Value, ty: Type, cleanup: Option<CleanupHandle> },
    /// Reached through the global's addressor
    Global { name: String, ty: Type },
}

#[derive(Debug, Clone)]
enum Component {
    StructField { field: StoredField },
    TupleElement { index: usize, ty: Type },
    ClassField { field: StoredField },
    Addressor { target: MemberTarget, kind: AddressorKind },
    Accessor { target: MemberTarget },
    Witness {
        protocol: String,
        property: String,
        ty: Type,
        existential: bool,
    },
}

impl Component {
    /// Projected off a class reference
    fn derefs_class(&self) -> bool {
        match self {
            Component::ClassField { .. } => true,
            Component::Addressor { target, .. } | Component::Accessor { target } => {
                target.owner_kind == OwnerKind::Class
            }
            _ => false,
        }
    }

    /// Reading needs a mutable `self`
    fn reads_mutably(&self) -> bool {
        matches!(self, Component::Accessor { target } if target.mutating_getter)
    }

    fn is_logical(&self) -> bool {
        matches!(self, Component::Accessor { .. } | Component::Witness { .. })
    }
}

/// A property or subscript reached through accessors
#[derive(Debug, Clone)]
struct MemberTarget {
    owner: String,
    owner_kind: OwnerKind,
    member: String,
    is_final: bool,
    /// Static class of the base, the vtable to dispatch through
    dispatch_class: Option<String>,
    index: Option<Managed>,
    value_ty: Type,
    has_mfs: bool,
    settable: bool,
    mutating_getter: bool,
}

/// Accessor to call for a member
#[derive(Debug, Clone)]
pub(crate) enum AccessorRef {
    Direct { name: String, ty: LoweredFunctionType },
    Class { selector: String, ty: LoweredFunctionType },
    Witness {
        lookup: Type,
        protocol: String,
        requirement: String,
        ty: LoweredFunctionType,
    },
}

impl AccessorRef {
    pub(crate) fn ty(&self) -> &LoweredFunctionType {
        match self {
            AccessorRef::Direct { ty, .. } | AccessorRef::Class { ty, .. } | AccessorRef::Witness { ty, .. } => ty,
        }
    }

    /// Emit the callee; class dispatch looks up the slot on `self_object`
    pub(crate) fn emit(&self, fl: &mut FunctionLowering<'_>, self_object: Value) -> Value {
        let dest = fl.new_value(MirType::Function(Box::new(self.ty().clone())), Ownership::Trivial);
        let inst = match self {
            AccessorRef::Direct { name, .. } => MirInst::FunctionRef {
                dest,
                function: name.clone(),
            },
            AccessorRef::Class { selector, .. } => MirInst::ClassMethod {
                dest,
                operand: self_object,
                selector: selector.clone(),
            },
            AccessorRef::Witness {
                lookup,
                protocol,
                requirement,
                ..
            } => MirInst::WitnessMethod {
                dest,
                lookup: lookup.clone(),
                protocol: protocol.clone(),
                requirement: requirement.clone(),
            },
        };
        fl.emit(inst);
        dest
    }
}

/// Deferred store back into logical storage, run when the access ends
#[derive(Debug, Clone)]
pub(crate) enum Writeback {
    /// Call the setter with the value left in `temp`
    Setter {
        setter: AccessorRef,
        temp: Value,
        value_ty: Type,
        index: Option<Value>,
        self_arg: Value,
    },
    /// Invoke the callback `materializeForSet` returned, if any
    MaterializeCallback {
        callback: Value,
        buffer: Value,
        storage: Value,
        index: Option<Value>,
        self_value: Value,
        self_ty: Type,
        callback_ty: LoweredFunctionType,
    },
}

/// Intermediate result of projecting components
#[derive(Debug, Clone)]
enum Place {
    Address {
        address: Value,
        ty: Type,
        pending: Option<Pending>,
        mutable: bool,
    },
    Object {
        value: Value,
        ty: Type,
        cleanup: Option<CleanupHandle>,
    },
}

/// Access scope not yet opened on a place
#[derive(Debug, Clone)]
struct Pending {
    storage: StorageClass,
    base: AccessBase,
}

impl Place {
    fn ty(&self) -> &Type {
        match self {
            Place::Address { ty, .. } | Place::Object { ty, .. } => ty,
        }
    }
}

pub(crate) fn field_ref(field: &StoredField) -> FieldRef {
    FieldRef {
        owner: field.owner.clone(),
        name: field.name.clone(),
        index: field.index,
    }
}

impl<'a> FunctionLowering<'a> {
    // ------------------------------------------------------------------
    // Formation
    // ------------------------------------------------------------------

    pub(crate) fn is_lvalue_expr(expr: &Expr) -> bool {
        matches!(
            expr.kind,
            ExprKind::Var(_)
                | ExprKind::Global(_)
                | ExprKind::StaticMember { .. }
                | ExprKind::Member { .. }
                | ExprKind::Subscript { .. }
                | ExprKind::TupleElement { .. }
        )
    }

    pub(crate) fn form_lvalue(&mut self, expr: &Expr) -> Result<LValue> {
        match &expr.kind {
            ExprKind::Var(name) => {
                let root = match self.lookup(name, expr.span)? {
                    Binding::Value { value, ty } => Root::Object { value, ty, cleanup: None },
                    Binding::Address { address, ty, kind, .. } => Root::Address {
                        address,
                        ty,
                        storage: kind.storage_class(),
                        base: AccessBase::Local(name.clone()),
                        mutable: kind.is_mutable(),
                    },
                };
                Ok(self.lvalue_at(root, expr))
            }
            ExprKind::Global(name) => {
                let ty = self.tl().global_type(name).cloned().unwrap_or_else(|| expr.ty.clone());
                Ok(self.lvalue_at(Root::Global { name: name.clone(), ty }, expr))
            }
            ExprKind::StaticMember { owner, name } => {
                let prop = self.tl().static_property(owner, name).ok_or_else(|| {
                    CompileError::lowering(format!("{owner} has no static property {name}"), expr.span)
                })?;
                let root = Root::Global {
                    name: names::static_property_global(owner, name),
                    ty: prop.ty,
                };
                Ok(self.lvalue_at(root, expr))
            }
            ExprKind::Member { base, name } => {
                let mut lv = self.form_lvalue_base(base)?;
                let component = self.member_component(&base.ty, name, expr.span)?;
                lv.components.push(component);
                lv.ty = expr.ty.clone();
                lv.span = expr.span;
                Ok(lv)
            }
            ExprKind::Subscript { base, index } => {
                let mut lv = self.form_lvalue_base(base)?;
                if self.is_address_only(&index.ty) {
                    return Err(CompileError::lowering(
                        format!("subscript index of type {} must be loadable", index.ty),
                        index.span,
                    ));
                }
                let index = self.emit_operand(index)?;
                let component = self.subscript_component(&base.ty, index, expr.span)?;
                lv.components.push(component);
                lv.ty = expr.ty.clone();
                lv.span = expr.span;
                Ok(lv)
            }
            ExprKind::TupleElement { base, index } => {
                let mut lv = self.form_lvalue_base(base)?;
                lv.components.push(Component::TupleElement {
                    index: *index,
                    ty: expr.ty.clone(),
                });
                lv.ty = expr.ty.clone();
                lv.span = expr.span;
                Ok(lv)
            }
            _ => self.form_lvalue_base(expr),
        }
    }

    fn lvalue_at(&self, root: Root, expr: &Expr) -> LValue {
        LValue {
            root,
            components: Vec::new(),
            ty: expr.ty.clone(),
            span: expr.span,
        }
    }

    /// Base of a member access; non-storage expressions become temporaries
    fn form_lvalue_base(&mut self, base: &Expr) -> Result<LValue> {
        if Self::is_lvalue_expr(base) {
            return self.form_lvalue(base);
        }
        let value = self.emit_operand(base)?;
        let root = if self.is_address(value.value) {
            Root::Address {
                address: value.value,
                ty: value.ty.clone(),
                storage: StorageClass::Stack,
                base: AccessBase::Local("$temporary".to_string()),
                mutable: false,
            }
        } else {
            Root::Object {
                value: value.value,
                ty: value.ty.clone(),
                cleanup: value.cleanup,
            }
        };
        Ok(self.lvalue_at(root, base))
    }

    /// Evaluate an operand of the lvalue; it reads storage the usual way
    fn emit_operand(&mut self, expr: &Expr) -> Result<Managed> {
        let direct = std::mem::take(&mut self.direct_storage);
        let value = self.emit_rvalue(expr);
        self.direct_storage = direct;
        value
    }

    fn is_own_storage(&self, owner: &str, member: &str) -> bool {
        self.storage_owner
            .as_ref()
            .is_some_and(|(o, m)| o == owner && m == member)
    }

    fn member_component(&mut self, base_ty: &Type, name: &str, span: Span) -> Result<Component> {
        let tl = self.tl();
        match base_ty {
            Type::Existential(protocol) => return self.witness_component(protocol.clone(), name, true, span),
            Type::Param(param) => {
                let protocol = self.constraint_with_property(param, name).ok_or_else(|| {
                    CompileError::lowering(format!("no requirement {name} constrains {param}"), span)
                })?;
                return self.witness_component(protocol, name, false, span);
            }
            _ => {}
        }
        let Some(prop) = tl.property(base_ty, name) else {
            // backing storage of a lazy property, named directly by its accessors
            let field = tl.field(base_ty, name).map_err(|_| {
                CompileError::lowering(format!("{base_ty} has no property {name}"), span)
            })?;
            return Ok(self.physical(base_ty, field));
        };
        let physical = match &prop.decl.storage {
            Storage::Stored { .. } => {
                prop.owner_kind != OwnerKind::Class
                    || prop.is_final
                    || self.direct_storage
                    || self.is_own_storage(&prop.owner, name)
            }
            Storage::Observed { .. } | Storage::Lazy { .. } => self.is_own_storage(&prop.owner, name),
            Storage::Computed { .. } | Storage::Addressed { .. } => false,
        };
        if physical {
            let field_name = match prop.decl.storage {
                Storage::Lazy { .. } => lazy_storage_name(name),
                _ => name.to_string(),
            };
            let field = tl.field(base_ty, &field_name)?;
            return Ok(self.physical(base_ty, field));
        }
        let target = MemberTarget {
            dispatch_class: (prop.owner_kind == OwnerKind::Class)
                .then(|| base_ty.nominal_name().unwrap_or(&prop.owner).to_string()),
            owner: prop.owner.clone(),
            owner_kind: prop.owner_kind,
            member: name.to_string(),
            is_final: prop.is_final,
            index: None,
            value_ty: prop.ty.referent().clone(),
            has_mfs: accessor_kinds(&prop.decl.storage, &prop.decl.ty).contains(&AccessorKind::MaterializeForSet),
            settable: prop.decl.storage.is_settable(),
            mutating_getter: matches!(prop.decl.storage, Storage::Lazy { .. }) && prop.owner_kind != OwnerKind::Class,
        };
        Ok(match prop.decl.storage {
            Storage::Addressed { kind, .. } => Component::Addressor { target, kind },
            _ => Component::Accessor { target },
        })
    }

    fn physical(&self, base_ty: &Type, field: StoredField) -> Component {
        if self.tl().is_class(base_ty) {
            Component::ClassField { field }
        } else {
            Component::StructField { field }
        }
    }

    fn subscript_component(&mut self, base_ty: &Type, index: Managed, span: Span) -> Result<Component> {
        let sub = self
            .tl()
            .subscript(base_ty)
            .ok_or_else(|| CompileError::lowering(format!("{base_ty} has no subscript"), span))?;
        let target = MemberTarget {
            dispatch_class: (sub.owner_kind == OwnerKind::Class)
                .then(|| base_ty.nominal_name().unwrap_or(&sub.owner).to_string()),
            owner: sub.owner.clone(),
            owner_kind: sub.owner_kind,
            member: names::SUBSCRIPT.to_string(),
            is_final: sub.is_final,
            index: Some(index),
            value_ty: sub.element.clone(),
            has_mfs: accessor_kinds(&sub.decl.storage, &sub.decl.element).contains(&AccessorKind::MaterializeForSet),
            settable: sub.decl.storage.is_settable(),
            mutating_getter: false,
        };
        match sub.decl.storage {
            Storage::Addressed { kind, .. } => Ok(Component::Addressor { target, kind }),
            Storage::Computed { .. } => Ok(Component::Accessor { target }),
            _ => Err(CompileError::lowering(
                format!("subscript of {} must be computed or addressed", sub.owner),
                span,
            )),
        }
    }

    fn constraint_with_property(&self, param: &str, name: &str) -> Option<String> {
        let tl = self.tl();
        self.constraints.get(param)?.iter().find_map(|protocol| {
            let req = tl.requirement(protocol, name)?;
            matches!(req.kind, RequirementKind::Property { .. }).then(|| protocol.clone())
        })
    }

    fn witness_component(&self, protocol: String, name: &str, existential: bool, span: Span) -> Result<Component> {
        let req = self
            .tl()
            .requirement(&protocol, name)
            .ok_or_else(|| CompileError::lowering(format!("protocol {protocol} has no requirement {name}"), span))?;
        match &req.kind {
            RequirementKind::Property { ty, .. } => Ok(Component::Witness {
                protocol,
                property: name.to_string(),
                ty: ty.clone(),
                existential,
            }),
            RequirementKind::Method { .. } => Err(CompileError::lowering(
                format!("{protocol}.{name} is a method, not a property"),
                span,
            )),
        }
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// +1 copy of the referenced value
    pub(crate) fn lvalue_read(&mut self, lv: &LValue) -> Result<Managed> {
        let count = lv.components.len();
        let place = self.project(lv, count, AccessKind::Read)?;
        let value_ty = lv.ty.clone();
        self.read_place(place, &value_ty)
    }

    fn read_place(&mut self, mut place: Place, value_ty: &Type) -> Result<Managed> {
        if let Place::Object { value, ty, cleanup } = &place {
            let (value, ty, cleanup) = (*value, ty.clone(), *cleanup);
            if let Some(handle) = cleanup.filter(|h| self.cleanup_is_active(*h)) {
                return Ok(Managed {
                    value,
                    ty,
                    cleanup: Some(handle),
                });
            }
            let copy = self.copy_value(value, &ty);
            return Ok(self.manage(copy, ty));
        }
        let storage_ty = place.ty().clone();
        let address = self.resolve(&mut place, AccessKind::Read, Span::default())?;
        if self.is_address_only(value_ty) && storage_ty == *value_ty {
            let temp = self.alloc_temp(value_ty);
            self.copy_addr(address, temp, false, true);
            return Ok(self.manage(temp, value_ty.clone()));
        }
        let value = self.load_from_storage(address, &storage_ty);
        Ok(self.manage(value, value_ty.clone()))
    }

    /// Store a +1 `value`, replacing the referenced value
    pub(crate) fn lvalue_assign(&mut self, lv: &LValue, value: Managed) -> Result<()> {
        let count = lv.components.len();
        match lv.components.last() {
            Some(last) if last.is_logical() => {
                let mut place = self.project(lv, count - 1, AccessKind::Modify)?;
                let last = last.clone();
                self.call_setter(&last, &mut place, value, lv.span)
            }
            _ => {
                let mut place = self.project(lv, count, AccessKind::Modify)?;
                let storage_ty = place.ty().clone();
                let address = self.resolve(&mut place, AccessKind::Modify, lv.span)?;
                self.assign_to_address(value, address, &storage_ty);
                Ok(())
            }
        }
    }

    /// Address for an in-place access of `kind`; valid until the enclosing
    /// cleanup scope ends
    pub(crate) fn lvalue_address(&mut self, lv: &LValue, kind: AccessKind) -> Result<Value> {
        let count = lv.components.len();
        let mut place = self.project(lv, count, kind)?;
        if let Place::Object { value, ty, .. } = &place {
            let (value, ty) = (*value, ty.clone());
            if kind.is_mutating() {
                return Err(CompileError::lowering(format!("cannot mutate immutable value of type {ty}"), lv.span));
            }
            let temp = self.alloc_temp(&ty);
            let copy = self.copy_value(value, &ty);
            self.store_init(copy, temp, &ty);
            self.push_cleanup(CleanupKind::DestroyAddr(temp));
            return Ok(temp);
        }
        self.resolve(&mut place, kind, lv.span)
    }

    /// Address of the storage itself, for pointers that escape the
    /// current scope
    pub(crate) fn lvalue_storage_address(&mut self, lv: &LValue, kind: AccessKind) -> Result<Value> {
        let count = lv.components.len();
        let mut place = self.project(lv, count, kind)?;
        if let Place::Object { .. } = place {
            return Err(CompileError::lowering("cannot take the address of a temporary", lv.span));
        }
        self.resolve(&mut place, kind, lv.span)
    }

    fn project(&mut self, lv: &LValue, upto: usize, kind: AccessKind) -> Result<Place> {
        let components = &lv.components[..upto];
        let last_deref = components.iter().rposition(Component::derefs_class);
        let mutating_read = components.iter().any(Component::reads_mutably);
        let kind = if mutating_read && !kind.is_mutating() {
            AccessKind::Modify
        } else {
            kind
        };
        let mode = |i: usize| match last_deref {
            Some(d) if i <= d => AccessKind::Read,
            _ => kind,
        };
        let scope = self.cleanup_depth();
        let mut place = self.project_root(&lv.root, lv.span)?;
        for (i, component) in components.iter().enumerate() {
            if component.derefs_class() {
                place = self.place_to_object(place, scope, lv.span)?;
            }
            let component_mode = mode(i + 1);
            place = self.project_component(place, component, component_mode, mode(i), lv.span)?;
        }
        Ok(place)
    }

    fn project_root(&mut self, root: &Root, span: Span) -> Result<Place> {
        Ok(match root {
            Root::Address {
                address,
                ty,
                storage,
                base,
                mutable,
            } => Place::Address {
                address: *address,
                ty: ty.clone(),
                pending: mutable.then(|| Pending {
                    storage: *storage,
                    base: base.clone(),
                }),
                mutable: *mutable,
            },
            Root::Object { value, ty, cleanup } => Place::Object {
                value: *value,
                ty: ty.clone(),
                cleanup: *cleanup,
            },
            Root::Global { name, ty } => {
                let addressor = names::global_addressor(name);
                let callee = self.function_ref(&addressor)?;
                let ty_fn = self.tl().function_type(&addressor)?.clone();
                let pointer = self.emit_apply(callee, &ty_fn, None, Vec::new(), &Type::RawPointer, span)?;
                let address = self.new_address(ty);
                self.emit(MirInst::PointerToAddress { dest: address, pointer });
                Place::Address {
                    address,
                    ty: ty.clone(),
                    pending: Some(Pending {
                        storage: StorageClass::Global,
                        base: AccessBase::Global(name.clone()),
                    }),
                    mutable: true,
                }
            }
        })
    }

    /// Open the pending access scope of an address place
    fn resolve(&mut self, place: &mut Place, kind: AccessKind, span: Span) -> Result<Value> {
        match place {
            Place::Address {
                address,
                ty,
                pending,
                mutable,
            } => {
                if kind.is_mutating() && !*mutable {
                    return Err(CompileError::lowering(
                        format!("cannot mutate immutable value of type {ty}"),
                        span,
                    ));
                }
                if let Some(p) = pending.take() {
                    let ty = ty.clone();
                    *address = self.begin_access(*address, &ty, kind, p.storage, p.base, span)?;
                }
                Ok(*address)
            }
            Place::Object { ty, .. } => Err(CompileError::lowering(
                format!("value of type {ty} has no address"),
                span,
            )),
        }
    }

    /// Load a class reference out of its storage; the access it needed
    /// ends right away
    fn place_to_object(&mut self, place: Place, scope: CleanupDepth, span: Span) -> Result<Place> {
        match place {
            Place::Object { .. } => Ok(place),
            mut place @ Place::Address { .. } => {
                let ty = place.ty().clone();
                let address = self.resolve(&mut place, AccessKind::Read, span)?;
                let value = self.load_from_storage(address, &ty);
                self.pop_cleanups(scope)?;
                let referent = ty.referent().clone();
                let managed = self.manage(value, referent.clone());
                Ok(Place::Object {
                    value,
                    ty: referent,
                    cleanup: managed.cleanup,
                })
            }
        }
    }

    /// Borrow an owned object for a projection
    fn borrow_object(&mut self, value: Value, ty: &Type) -> Value {
        if self.ctx.ownership(value) != Ownership::Owned {
            return value;
        }
        let dest = self.new_value(MirType::Object(ty.clone()), Ownership::Guaranteed);
        self.emit(MirInst::BeginBorrow { dest, operand: value });
        self.push_cleanup(CleanupKind::EndBorrow {
            borrowed: dest,
            original: value,
        });
        dest
    }

    fn projected_ownership(&self, ty: &Type) -> Ownership {
        if self.is_trivial(ty) {
            Ownership::Trivial
        } else {
            Ownership::Guaranteed
        }
    }

    fn project_component(
        &mut self,
        mut place: Place,
        component: &Component,
        kind: AccessKind,
        base_kind: AccessKind,
        span: Span,
    ) -> Result<Place> {
        match component {
            Component::StructField { field } => match place {
                Place::Address { mutable, .. } => {
                    let base = self.resolve(&mut place, base_kind, span)?;
                    let dest = self.new_address(&field.ty);
                    self.emit(MirInst::StructElementAddr {
                        dest,
                        address: base,
                        field: field_ref(field),
                    });
                    Ok(Place::Address {
                        address: dest,
                        ty: field.ty.clone(),
                        pending: None,
                        mutable,
                    })
                }
                Place::Object { value, ty, .. } => {
                    let borrowed = self.borrow_object(value, &ty);
                    let ownership = self.projected_ownership(&field.ty);
                    let dest = self.new_value(MirType::Object(field.ty.clone()), ownership);
                    self.emit(MirInst::StructExtract {
                        dest,
                        operand: borrowed,
                        field: field_ref(field),
                    });
                    Ok(Place::Object {
                        value: dest,
                        ty: field.ty.clone(),
                        cleanup: None,
                    })
                }
            },
            Component::TupleElement { index, ty: elem_ty } => match place {
                Place::Address { mutable, .. } => {
                    let base = self.resolve(&mut place, base_kind, span)?;
                    let dest = self.new_address(elem_ty);
                    self.emit(MirInst::TupleElementAddr {
                        dest,
                        address: base,
                        index: *index,
                    });
                    Ok(Place::Address {
                        address: dest,
                        ty: elem_ty.clone(),
                        pending: None,
                        mutable,
                    })
                }
                Place::Object { value, ty, .. } => {
                    let borrowed = self.borrow_object(value, &ty);
                    let ownership = self.projected_ownership(elem_ty);
                    let dest = self.new_value(MirType::Object(elem_ty.clone()), ownership);
                    self.emit(MirInst::TupleExtract {
                        dest,
                        operand: borrowed,
                        index: *index,
                    });
                    Ok(Place::Object {
                        value: dest,
                        ty: elem_ty.clone(),
                        cleanup: None,
                    })
                }
            },
            Component::ClassField { field } => {
                let Place::Object { value, ty, .. } = place else {
                    return Err(CompileError::lowering("class field of a non-reference", span));
                };
                let operand = self.borrow_object(value, &ty);
                let dest = self.new_address(&field.ty);
                self.emit(MirInst::RefElementAddr {
                    dest,
                    operand,
                    field: field_ref(field),
                });
                Ok(Place::Address {
                    address: dest,
                    ty: field.ty.clone(),
                    pending: Some(Pending {
                        storage: StorageClass::ClassProperty,
                        base: AccessBase::ClassProperty(format!("{}.{}", field.owner, field.name)),
                    }),
                    mutable: true,
                })
            }
            Component::Addressor { target, kind: addressor } => {
                self.project_addressor(place, target, *addressor, kind, span)
            }
            Component::Accessor { target } => {
                if kind.is_mutating() {
                    self.materialize_for_modify(place, target, span)
                } else {
                    let value = self.call_getter(target, &mut place, span)?;
                    Ok(self.managed_place(value))
                }
            }
            Component::Witness {
                protocol,
                property,
                ty,
                existential,
            } => {
                let (self_addr, lookup) = self.open_witness_base(&mut place, *existential, kind, span)?;
                let getter = self.witness_accessor(&lookup, protocol, property, AccessorKind::Getter)?;
                let value = self.call_witness_getter(&getter, self_addr, ty, span)?;
                if !kind.is_mutating() {
                    return Ok(self.managed_place(value));
                }
                let setter = self.witness_accessor(&lookup, protocol, property, AccessorKind::Setter)?;
                let temp = self.alloc_temp(ty);
                self.init_from_managed(value, temp, ty);
                self.push_cleanup(CleanupKind::Writeback(Box::new(Writeback::Setter {
                    setter,
                    temp,
                    value_ty: ty.clone(),
                    index: None,
                    self_arg: self_addr,
                })));
                Ok(Place::Address {
                    address: temp,
                    ty: ty.clone(),
                    pending: None,
                    mutable: true,
                })
            }
        }
    }

    fn managed_place(&self, value: Managed) -> Place {
        if self.is_address(value.value) {
            Place::Address {
                address: value.value,
                ty: value.ty,
                pending: None,
                mutable: false,
            }
        } else {
            Place::Object {
                value: value.value,
                ty: value.ty,
                cleanup: value.cleanup,
            }
        }
    }

    /// Move a +1 value into uninitialized memory
    pub(crate) fn init_from_managed(&mut self, value: Managed, address: Value, ty: &Type) {
        let is_address = self.is_address(value.value);
        let owned = value.is_owned();
        let raw = value.forward(self);
        if is_address {
            self.copy_addr(raw, address, owned, true);
        } else {
            let raw = if owned { raw } else { self.copy_value(raw, ty) };
            self.store_init(raw, address, ty);
        }
    }

    fn assign_to_address(&mut self, value: Managed, address: Value, storage_ty: &Type) {
        let is_address = self.is_address(value.value);
        let owned = value.is_owned();
        let raw = value.forward(self);
        if is_address {
            self.copy_addr(raw, address, owned, false);
            return;
        }
        let raw = if owned {
            raw
        } else {
            self.copy_value(raw, storage_ty.referent())
        };
        self.store_to_storage(raw, address, storage_ty, false);
    }

    // ------------------------------------------------------------------
    // Reference storage
    // ------------------------------------------------------------------

    /// +1 value loaded from storage of type `storage_ty`
    pub(crate) fn load_from_storage(&mut self, address: Value, storage_ty: &Type) -> Value {
        match storage_ty {
            Type::Weak(inner) => {
                let dest = self.new_value(MirType::Object((**inner).clone()), Ownership::Owned);
                self.emit(MirInst::LoadWeak {
                    dest,
                    address,
                    take: false,
                });
                dest
            }
            Type::Unowned(inner) => {
                let borrowed = self.new_value(MirType::Object(storage_ty.clone()), Ownership::Guaranteed);
                self.emit(MirInst::LoadBorrow { dest: borrowed, address });
                let dest = self.new_value(MirType::Object((**inner).clone()), Ownership::Owned);
                self.emit(MirInst::StrongCopyUnowned {
                    dest,
                    operand: borrowed,
                });
                self.emit(MirInst::EndBorrow {
                    borrowed,
                    original: address,
                });
                dest
            }
            Type::UnownedUnsafe(inner) => {
                let unmanaged = self.new_value(MirType::Object(storage_ty.clone()), Ownership::Trivial);
                self.emit(MirInst::Load {
                    dest: unmanaged,
                    address,
                    qualifier: LoadQualifier::Trivial,
                });
                let reference = self.new_value(MirType::Object((**inner).clone()), Ownership::Guaranteed);
                self.emit(MirInst::UnmanagedToRef {
                    dest: reference,
                    operand: unmanaged,
                });
                let dest = self.new_object(inner);
                self.emit(MirInst::CopyValue {
                    dest,
                    operand: reference,
                });
                dest
            }
            _ => self.load_copy(address, storage_ty),
        }
    }

    /// Consume `value` into storage of type `storage_ty`
    pub(crate) fn store_to_storage(&mut self, value: Value, address: Value, storage_ty: &Type, initialize: bool) {
        match storage_ty {
            Type::Weak(_) => {
                self.emit(MirInst::StoreWeak {
                    value,
                    address,
                    initialize,
                });
                self.destroy_value(value);
            }
            Type::Unowned(_) => {
                let unowned = self.new_value(MirType::Object(storage_ty.clone()), Ownership::Guaranteed);
                self.emit(MirInst::RefToUnowned { dest: unowned, operand: value });
                let copy = self.new_value(MirType::Object(storage_ty.clone()), Ownership::Owned);
                self.emit(MirInst::CopyValue { dest: copy, operand: unowned });
                let qualifier = if initialize {
                    StoreQualifier::Init
                } else {
                    StoreQualifier::Assign
                };
                self.emit(MirInst::Store {
                    value: copy,
                    address,
                    qualifier,
                });
                self.destroy_value(value);
            }
            Type::UnownedUnsafe(_) => {
                let unmanaged = self.new_value(MirType::Object(storage_ty.clone()), Ownership::Trivial);
                self.emit(MirInst::RefToUnmanaged {
                    dest: unmanaged,
                    operand: value,
                });
                self.emit(MirInst::Store {
                    value: unmanaged,
                    address,
                    qualifier: StoreQualifier::Trivial,
                });
                self.destroy_value(value);
            }
            _ if initialize => self.store_init(value, address, storage_ty),
            _ => self.store_assign(value, address, storage_ty),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    fn resolve_accessor(&self, target: &MemberTarget, kind: AccessorKind) -> Result<AccessorRef> {
        if target.owner_kind == OwnerKind::Class && !target.is_final && kind.is_dispatchable() {
            let class = target.dispatch_class.as_deref().unwrap_or(&target.owner);
            if let Some(entry) = self
                .env
                .tables
                .dispatch_entry(class, &names::accessor_key(&target.member, kind))
            {
                return Ok(AccessorRef::Class {
                    selector: entry.selector.clone(),
                    ty: entry.ty.clone(),
                });
            }
        }
        let name = names::accessor_name(&target.owner, &target.member, kind);
        let ty = self.tl().function_type(&name)?.clone();
        Ok(AccessorRef::Direct { name, ty })
    }

    fn witness_accessor(&self, lookup: &Type, protocol: &str, property: &str, kind: AccessorKind) -> Result<AccessorRef> {
        let requirement = names::accessor_key(property, kind);
        let mut subs = HashMap::new();
        subs.insert("Self".to_string(), lookup.clone());
        let ty = requirement_type(self.tl(), protocol, &requirement, &subs)?;
        Ok(AccessorRef::Witness {
            lookup: lookup.clone(),
            protocol: protocol.to_string(),
            requirement,
            ty,
        })
    }

    /// Index argument for a parameter of convention `convention`
    fn index_arg(&mut self, index: &Managed, convention: ArgConvention) -> Value {
        match convention {
            ArgConvention::Owned => self.copy_value(index.value, &index.ty),
            _ => index.value,
        }
    }

    /// `self` argument taken from `place`
    fn self_arg(&mut self, place: &mut Place, convention: ArgConvention, span: Span) -> Result<Value> {
        match convention {
            ArgConvention::InOut => self.resolve(place, AccessKind::Modify, span),
            ArgConvention::InGuaranteed => match place {
                Place::Address { .. } => self.resolve(place, AccessKind::Read, span),
                Place::Object { value, ty, .. } => {
                    let (value, ty) = (*value, ty.clone());
                    let temp = self.alloc_temp(&ty);
                    let copy = self.copy_value(value, &ty);
                    self.store_init(copy, temp, &ty);
                    self.push_cleanup(CleanupKind::DestroyAddr(temp));
                    Ok(temp)
                }
            },
            _ => match place {
                Place::Object { value, .. } => Ok(*value),
                Place::Address { .. } => {
                    let ty = place.ty().clone();
                    let address = self.resolve(place, AccessKind::Read, span)?;
                    Ok(self.load_borrow(address, &ty))
                }
            },
        }
    }

    fn class_self(place: &Place) -> Value {
        match place {
            Place::Object { value, .. } | Place::Address { address: value, .. } => *value,
        }
    }

    /// Call the getter; borrows taken for the call end with it
    fn call_getter(&mut self, target: &MemberTarget, place: &mut Place, span: Span) -> Result<Managed> {
        let getter = self.resolve_accessor(target, AccessorKind::Getter)?;
        let ty = getter.ty().clone();
        let indirect = ty.sig.has_indirect_result().then(|| self.alloc_temp(&target.value_ty));
        let self_convention = ty.sig.params.last().map(|p| p.convention).unwrap_or(ArgConvention::Guaranteed);
        if self_convention == ArgConvention::InOut {
            self.resolve(place, AccessKind::Modify, span)?;
        }
        let depth = self.cleanup_depth();
        let mut args = Vec::new();
        if let (Some(index), Some(param)) = (&target.index, ty.sig.params.first()) {
            let index = index.clone();
            args.push(self.index_arg(&index, param.convention));
        }
        let self_value = self.self_arg(place, self_convention, span)?;
        args.push(self_value);
        let callee = getter.emit(self, self_value);
        let result = self.emit_apply(callee, &ty, indirect, args, &target.value_ty, span)?;
        self.pop_cleanups(depth)?;
        Ok(match indirect {
            Some(temp) => self.manage(temp, target.value_ty.clone()),
            None => self.manage(result, target.value_ty.clone()),
        })
    }

    fn call_setter(&mut self, component: &Component, place: &mut Place, value: Managed, span: Span) -> Result<()> {
        let (setter, index) = match component {
            Component::Accessor { target } => {
                if !target.settable {
                    return Err(CompileError::lowering(
                        format!("{}.{} is get-only", target.owner, target.member),
                        span,
                    ));
                }
                (self.resolve_accessor(target, AccessorKind::Setter)?, target.index.clone())
            }
            Component::Witness {
                protocol,
                property,
                existential,
                ..
            } => {
                let (self_addr, lookup) = self.open_witness_base(place, *existential, AccessKind::Modify, span)?;
                *place = Place::Address {
                    address: self_addr,
                    ty: lookup.clone(),
                    pending: None,
                    mutable: true,
                };
                (self.witness_accessor(&lookup, protocol, property, AccessorKind::Setter)?, None)
            }
            _ => return Err(CompileError::lowering("setter call on stored storage", span)),
        };
        let ty = setter.ty().clone();
        let params = ty.sig.params.clone();
        let self_convention = params.last().map(|p| p.convention).unwrap_or(ArgConvention::Guaranteed);
        let mut args = vec![self.value_arg(value, params[0].convention)];
        if let (Some(index), Some(param)) = (&index, params.get(1)) {
            args.push(self.index_arg(index, param.convention));
        }
        let self_value = self.self_arg(place, self_convention, span)?;
        args.push(self_value);
        let callee = setter.emit(self, self_value);
        self.emit_apply(callee, &ty, None, args, &Type::unit(), span)?;
        Ok(())
    }

    /// Pass a +1 value to a consuming parameter
    fn value_arg(&mut self, value: Managed, convention: ArgConvention) -> Value {
        let ty = value.ty.clone();
        let is_address = self.is_address(value.value);
        let owned = value.is_owned();
        let raw = value.forward(self);
        match (convention, is_address) {
            (ArgConvention::In, true) if owned => raw,
            (ArgConvention::In, _) => {
                let temp = self.alloc_temp(&ty);
                if is_address {
                    self.copy_addr(raw, temp, false, true);
                } else {
                    let raw = if owned { raw } else { self.copy_value(raw, &ty) };
                    self.store_init(raw, temp, &ty);
                }
                temp
            }
            (_, true) => self.load_take(raw, &ty),
            _ if owned => raw,
            _ => self.copy_value(raw, &ty),
        }
    }

    fn materialize_for_modify(&mut self, mut place: Place, target: &MemberTarget, span: Span) -> Result<Place> {
        if !target.settable {
            return Err(CompileError::lowering(
                format!("{}.{} is get-only", target.owner, target.member),
                span,
            ));
        }
        let dispatched = target.owner_kind == OwnerKind::Class && !target.is_final && target.has_mfs;
        if dispatched {
            return self.call_materialize_for_set(place, target, span);
        }
        let setter = self.resolve_accessor(target, AccessorKind::Setter)?;
        let setter_self = setter.ty().sig.params.last().map(|p| p.convention).unwrap_or(ArgConvention::Guaranteed);
        let temp = self.alloc_temp(&target.value_ty);
        let self_arg = if setter_self == ArgConvention::InOut {
            self.resolve(&mut place, AccessKind::Modify, span)?
        } else {
            Self::class_self(&place)
        };
        let value = self.call_getter(target, &mut place, span)?;
        self.init_from_managed(value, temp, &target.value_ty);
        let index = target.index.as_ref().map(|i| i.value);
        self.push_cleanup(CleanupKind::Writeback(Box::new(Writeback::Setter {
            setter,
            temp,
            value_ty: target.value_ty.clone(),
            index,
            self_arg,
        })));
        Ok(Place::Address {
            address: temp,
            ty: target.value_ty.clone(),
            pending: None,
            mutable: true,
        })
    }

    fn call_materialize_for_set(&mut self, place: Place, target: &MemberTarget, span: Span) -> Result<Place> {
        let self_value = Self::class_self(&place);
        let self_ty = place.ty().clone();
        let scratch = self.alloc_temp(&Type::ValueBuffer);
        let buffer = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
        self.emit(MirInst::AddressToPointer {
            dest: buffer,
            address: scratch,
        });
        let storage = self.alloc_temp(&Type::ValueBuffer);
        let mfs = self.resolve_accessor(target, AccessorKind::MaterializeForSet)?;
        let ty = mfs.ty().clone();
        let mut args = vec![buffer, storage];
        if let (Some(index), Some(param)) = (&target.index, ty.sig.params.get(2)) {
            let index = index.clone();
            args.push(self.index_arg(&index, param.convention));
        }
        args.push(self_value);
        let callee = mfs.emit(self, self_value);
        let result_ty = Type::Tuple(vec![Type::RawPointer, Type::optional(Type::RawPointer)]);
        let result = self.emit_apply(callee, &ty, None, args, &result_ty, span)?;
        let pointer = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
        self.emit(MirInst::TupleExtract {
            dest: pointer,
            operand: result,
            index: 0,
        });
        let callback = self.new_value(MirType::Object(Type::optional(Type::RawPointer)), Ownership::Trivial);
        self.emit(MirInst::TupleExtract {
            dest: callback,
            operand: result,
            index: 1,
        });
        let address = self.new_address(&target.value_ty);
        self.emit(MirInst::PointerToAddress { dest: address, pointer });

        let mut callback_ty = ty.clone();
        callback_ty.convention = FnConvention::Method;
        if let Some(last) = callback_ty.sig.params.last_mut() {
            last.ty = self_ty.clone();
            last.convention = ArgConvention::InOut;
        }
        callback_ty.sig.params.push(crate::types::LoweredParam {
            ty: Type::Metatype(Box::new(self_ty.clone())),
            convention: ArgConvention::Trivial,
        });
        callback_ty.sig.result = self.tl().lowered_result(&Type::unit());
        let index = target.index.as_ref().map(|i| i.value);
        self.push_cleanup(CleanupKind::Writeback(Box::new(Writeback::MaterializeCallback {
            callback,
            buffer,
            storage,
            index,
            self_value,
            self_ty,
            callback_ty,
        })));
        Ok(Place::Address {
            address,
            ty: target.value_ty.clone(),
            pending: None,
            mutable: true,
        })
    }

    fn project_addressor(
        &mut self,
        mut place: Place,
        target: &MemberTarget,
        addressor: AddressorKind,
        kind: AccessKind,
        span: Span,
    ) -> Result<Place> {
        let mutable = kind.is_mutating();
        if mutable && !target.settable {
            return Err(CompileError::lowering(
                format!("{}.{} has no mutable addressor", target.owner, target.member),
                span,
            ));
        }
        let accessor_kind = if mutable {
            AccessorKind::UnsafeMutableAddressor
        } else {
            AccessorKind::UnsafeAddressor
        };
        let accessor = self.resolve_accessor(target, accessor_kind)?;
        let ty = accessor.ty().clone();
        let self_convention = ty.sig.params.last().map(|p| p.convention).unwrap_or(ArgConvention::Guaranteed);
        let mut args = Vec::new();
        if let (Some(index), Some(param)) = (&target.index, ty.sig.params.first()) {
            let index = index.clone();
            args.push(self.index_arg(&index, param.convention));
        }
        let loads_self = self_convention == ArgConvention::Guaranteed && matches!(place, Place::Address { .. });
        let self_value = if loads_self {
            // the pointer must outlive a borrow, so self is copied out
            let storage_ty = place.ty().clone();
            let address = self.resolve(&mut place, AccessKind::Read, span)?;
            let copy = self.load_copy(address, &storage_ty);
            self.manage(copy, storage_ty).value
        } else {
            self.self_arg(&mut place, self_convention, span)?
        };
        args.push(self_value);
        let callee = accessor.emit(self, self_value);
        let result_ty = addressor_result(&target.value_ty, mutable, addressor);
        let result = self.emit_apply(callee, &ty, None, args, &result_ty, span)?;
        let pointer_ty = match &result_ty {
            Type::Tuple(elems) => elems[0].clone(),
            other => other.clone(),
        };
        let pointer = match addressor {
            AddressorKind::Unsafe => result,
            AddressorKind::NativeOwner | AddressorKind::PinnedNativeOwner => {
                let parts = self.destructure(result, &result_ty);
                if addressor == AddressorKind::NativeOwner {
                    self.push_cleanup(CleanupKind::DestroyValue(parts[1]));
                } else {
                    self.push_cleanup(CleanupKind::Unpin(parts[1]));
                }
                parts[0]
            }
        };
        let field = self.tl().struct_fields(&pointer_ty)?.into_iter().next().ok_or_else(|| {
            CompileError::lowering(format!("{pointer_ty} has no raw pointer"), span)
        })?;
        let raw = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
        self.emit(MirInst::StructExtract {
            dest: raw,
            operand: pointer,
            field: field_ref(&field),
        });
        let address = self.new_address(&target.value_ty);
        self.emit(MirInst::PointerToAddress { dest: address, pointer: raw });
        Ok(Place::Address {
            address,
            ty: target.value_ty.clone(),
            pending: None,
            mutable,
        })
    }

    /// Split an owned tuple into +1 elements
    pub(crate) fn destructure(&mut self, tuple: Value, ty: &Type) -> Vec<Value> {
        let Type::Tuple(elems) = ty else {
            return vec![tuple];
        };
        let owned = self.ctx.ownership(tuple) == Ownership::Owned;
        let borrowed = if owned {
            let dest = self.new_value(MirType::Object(ty.clone()), Ownership::Guaranteed);
            self.emit(MirInst::BeginBorrow { dest, operand: tuple });
            dest
        } else {
            tuple
        };
        let mut parts = Vec::new();
        for (index, elem) in elems.iter().enumerate() {
            let ownership = self.projected_ownership(elem);
            let part = self.new_value(MirType::Object(elem.clone()), ownership);
            self.emit(MirInst::TupleExtract {
                dest: part,
                operand: borrowed,
                index,
            });
            parts.push(self.copy_value(part, elem));
        }
        if owned {
            self.emit(MirInst::EndBorrow {
                borrowed,
                original: tuple,
            });
            self.emit(MirInst::DestroyValue { operand: tuple });
        }
        parts
    }

    // ------------------------------------------------------------------
    // Protocol requirements
    // ------------------------------------------------------------------

    /// Address of `self` for a requirement call and the type to look the
    /// witness up on
    fn open_witness_base(
        &mut self,
        place: &mut Place,
        existential: bool,
        kind: AccessKind,
        span: Span,
    ) -> Result<(Value, Type)> {
        let ty = place.ty().clone();
        let address = match place {
            Place::Address { .. } => self.resolve(place, kind, span)?,
            Place::Object { .. } => self.self_arg(place, ArgConvention::InGuaranteed, span)?,
        };
        if !existential {
            return Ok((address, ty));
        }
        let Type::Existential(protocol) = &ty else {
            return Err(CompileError::lowering(format!("{ty} is not an existential"), span));
        };
        let opened = Type::Opened(protocol.clone());
        let dest = self.new_address(&opened);
        self.emit(MirInst::OpenExistentialAddr {
            dest,
            address,
            mutable: kind.is_mutating(),
        });
        Ok((dest, opened))
    }

    fn call_witness_getter(&mut self, getter: &AccessorRef, self_addr: Value, value_ty: &Type, span: Span) -> Result<Managed> {
        let ty = getter.ty().clone();
        let indirect = ty.sig.has_indirect_result().then(|| self.alloc_temp(value_ty));
        let callee = getter.emit(self, self_addr);
        let result = self.emit_apply(callee, &ty, indirect, vec![self_addr], value_ty, span)?;
        Ok(match indirect {
            Some(temp) => self.manage(temp, value_ty.clone()),
            None => self.manage(result, value_ty.clone()),
        })
    }

    // ------------------------------------------------------------------
    // Writebacks
    // ------------------------------------------------------------------

    /// Emit a writeback without registering new cleanups
    pub(crate) fn emit_writeback(&mut self, writeback: &Writeback) -> Result<()> {
        match writeback {
            Writeback::Setter {
                setter,
                temp,
                value_ty,
                index,
                self_arg,
            } => {
                let ty = setter.ty().clone();
                let params = &ty.sig.params;
                let value = match params[0].convention {
                    ArgConvention::In => *temp,
                    _ => self.load_take(*temp, value_ty),
                };
                let mut args = vec![value];
                if let (Some(index), Some(param)) = (index, params.get(1).filter(|_| params.len() > 2)) {
                    args.push(self.writeback_index(*index, param.convention));
                }
                args.push(*self_arg);
                let callee = setter.emit(self, *self_arg);
                self.emit_plain_apply(callee, args);
                Ok(())
            }
            Writeback::MaterializeCallback {
                callback,
                buffer,
                storage,
                index,
                self_value,
                self_ty,
                callback_ty,
            } => {
                let some = self.ctx.fresh_label();
                let none = self.ctx.fresh_label();
                let done = self.ctx.fresh_label();
                self.ctx.finish_block(Terminator::SwitchEnum {
                    operand: *callback,
                    cases: vec![(CaseRef::some(), some.clone()), (CaseRef::none(), none.clone())],
                    default: None,
                });

                let pointer = self.new_value(MirType::Object(Type::RawPointer), Ownership::Trivial);
                self.ctx.start_block(some, vec![pointer]);
                let function = self.new_value(MirType::Function(Box::new(callback_ty.clone())), Ownership::Trivial);
                self.emit(MirInst::PointerToThinFunction {
                    dest: function,
                    operand: pointer,
                });
                let self_temp = self.new_address(self_ty);
                self.emit(MirInst::AllocStack { dest: self_temp });
                let copy = self.copy_value(*self_value, self_ty);
                self.store_init(copy, self_temp, self_ty);
                let metatype = self.new_value(MirType::Object(Type::Metatype(Box::new(self_ty.clone()))), Ownership::Trivial);
                self.emit(MirInst::Metatype { dest: metatype });
                let mut args = vec![*buffer, *storage];
                if let (Some(index), Some(param)) = (index, callback_ty.sig.params.get(2).filter(|_| callback_ty.sig.params.len() > 4)) {
                    args.push(self.writeback_index(*index, param.convention));
                }
                args.push(self_temp);
                args.push(metatype);
                self.emit_plain_apply(function, args);
                self.emit(MirInst::DestroyAddr { address: self_temp });
                self.emit(MirInst::DeallocStack { operand: self_temp });
                self.ctx.finish_block(Terminator::Br {
                    target: done.clone(),
                    args: Vec::new(),
                });

                self.ctx.start_block(none, Vec::new());
                self.ctx.finish_block(Terminator::Br {
                    target: done.clone(),
                    args: Vec::new(),
                });
                self.ctx.start_block(done, Vec::new());
                Ok(())
            }
        }
    }

    fn writeback_index(&mut self, index: Value, convention: ArgConvention) -> Value {
        match convention {
            ArgConvention::Owned => {
                let ty = self.ctx.value_type(index).formal().cloned().unwrap_or(Type::Int);
                self.copy_value(index, &ty)
            }
            _ => index,
        }
    }

    /// Non-throwing `apply` whose result is dropped
    fn emit_plain_apply(&mut self, callee: Value, args: Vec<Value>) {
        let dest = self.new_value(MirType::Object(Type::unit()), Ownership::Trivial);
        self.emit(MirInst::Apply { dest, callee, args });
    }
}
