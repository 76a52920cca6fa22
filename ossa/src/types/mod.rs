//! Type & ownership model
//!
//! `TypeLowering` answers the questions lowering keeps asking about formal
//! types: is a value trivial, loadable or address-only, what are the stored
//! fields of a nominal type, which member does a name refer to, and what is
//! the lowered signature of every function the module will contain. It is
//! built once per module and shared read-only by all lowering workers.

pub mod names;

use std::collections::HashMap;

use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::mir::{FnConvention, LoweredFunctionType};
use names::AccessorKind;

/// Value category of a formal type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    /// Bitwise copyable, no reference counting
    Trivial,
    /// Fixed layout with reference-counted parts; lives in registers
    Loadable,
    /// Layout unknown at compile time or identity-bearing; lives in memory
    AddressOnly,
}

/// Lowered parameter passing convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgConvention {
    /// Trivial value in a register
    Trivial,
    Owned,
    Guaranteed,
    /// Address of an initialized value the callee consumes
    In,
    /// Address of a value the callee borrows
    InGuaranteed,
    InOut,
    /// Address captured by a non-escaping closure
    InoutAliasable,
}

impl ArgConvention {
    pub fn is_indirect(&self) -> bool {
        matches!(
            self,
            ArgConvention::In
                | ArgConvention::InGuaranteed
                | ArgConvention::InOut
                | ArgConvention::InoutAliasable
        )
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self, ArgConvention::Owned | ArgConvention::In)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultConvention {
    /// Trivial direct result
    Unowned,
    Owned,
    /// Written through a leading `@out` address argument
    Indirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoweredParam {
    pub ty: Type,
    pub convention: ArgConvention,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoweredResult {
    pub ty: Type,
    pub convention: ResultConvention,
}

/// Lowered signature; the indirect result, when present, is passed as an
/// extra leading argument that is not listed in `params`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoweredSignature {
    pub generic_params: Vec<String>,
    pub params: Vec<LoweredParam>,
    pub result: LoweredResult,
    pub throws: bool,
}

impl LoweredSignature {
    pub fn has_indirect_result(&self) -> bool {
        self.result.convention == ResultConvention::Indirect
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Struct,
    Enum,
    Class,
}

/// A property found by member lookup
#[derive(Debug, Clone)]
pub struct PropertyRef {
    /// Declaring nominal type
    pub owner: String,
    pub owner_kind: OwnerKind,
    pub decl: PropertyDecl,
    /// Storage type with generic arguments of the base applied
    pub ty: Type,
    /// Effectively final: no class dispatch needed
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptRef {
    pub owner: String,
    pub owner_kind: OwnerKind,
    pub decl: SubscriptDecl,
    pub element: Type,
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub struct MethodRef {
    pub owner: String,
    pub owner_kind: OwnerKind,
    pub decl: FnDecl,
    pub is_final: bool,
}

/// A field in the flattened stored layout of a struct or class
#[derive(Debug, Clone, PartialEq)]
pub struct StoredField {
    /// Declaring type (the superclass for inherited class fields)
    pub owner: String,
    pub name: String,
    /// Storage type (may be `Weak`/`Unowned`)
    pub ty: Type,
    pub index: usize,
}

/// Type metadata and lowered signatures for one module
#[derive(Debug, Clone, Default)]
pub struct TypeLowering {
    structs: HashMap<String, StructDecl>,
    enums: HashMap<String, EnumDecl>,
    classes: HashMap<String, ClassDecl>,
    protocols: HashMap<String, ProtocolDecl>,
    conformances: Vec<Conformance>,
    globals: HashMap<String, Type>,
    functions: HashMap<String, LoweredFunctionType>,
}

const MAX_TYPE_DEPTH: usize = 64;

impl TypeLowering {
    pub fn new(module: &Module) -> Result<Self> {
        let mut tl = TypeLowering::default();
        for s in &module.structs {
            tl.insert_nominal(&s.name, s.span)?;
            tl.structs.insert(s.name.clone(), s.clone());
        }
        for e in &module.enums {
            tl.insert_nominal(&e.name, e.span)?;
            tl.enums.insert(e.name.clone(), e.clone());
        }
        for c in &module.classes {
            tl.insert_nominal(&c.name, c.span)?;
            tl.classes.insert(c.name.clone(), c.clone());
        }
        for class in module.classes.iter() {
            if let Some(sup) = &class.superclass {
                if !tl.classes.contains_key(sup) {
                    return Err(CompileError::lowering(
                        format!("class {} inherits from unknown class {sup}", class.name),
                        class.span,
                    ));
                }
            }
        }
        for p in &module.protocols {
            tl.protocols.insert(p.name.clone(), p.clone());
        }
        tl.conformances = module.conformances.clone();
        for g in &module.globals {
            tl.globals.insert(g.name.clone(), g.ty.clone());
        }
        tl.register_signatures(module)?;
        Ok(tl)
    }

    fn insert_nominal(&self, name: &str, span: Span) -> Result<()> {
        if self.structs.contains_key(name)
            || self.enums.contains_key(name)
            || self.classes.contains_key(name)
        {
            return Err(CompileError::lowering(format!("duplicate type {name}"), span));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    pub fn classify(&self, ty: &Type) -> TypeClass {
        self.classify_at(ty, 0)
    }

    fn classify_at(&self, ty: &Type, depth: usize) -> TypeClass {
        if depth > MAX_TYPE_DEPTH {
            return TypeClass::Loadable;
        }
        match ty {
            Type::Int
            | Type::Int32
            | Type::Bool
            | Type::Double
            | Type::RawPointer
            | Type::UnsafePointer(_)
            | Type::UnsafeMutablePointer(_)
            | Type::Metatype(_)
            | Type::UnownedUnsafe(_) => TypeClass::Trivial,
            Type::NativeObject | Type::Unowned(_) | Type::Box(_) => TypeClass::Loadable,
            Type::Param(_)
            | Type::Opened(_)
            | Type::ValueBuffer
            | Type::Weak(_)
            | Type::BlockStorage(_) => TypeClass::AddressOnly,
            Type::Existential(_) if ty.is_error_existential() => TypeClass::Loadable,
            Type::Existential(_) => TypeClass::AddressOnly,
            Type::Function(f) => match f.representation {
                Representation::Thin => TypeClass::Trivial,
                _ if !f.escaping => TypeClass::Trivial,
                _ => TypeClass::Loadable,
            },
            Type::Optional(inner) => self.classify_at(inner, depth + 1),
            Type::Tuple(elems) => combine(elems.iter().map(|e| self.classify_at(e, depth + 1))),
            Type::Named(name) | Type::Generic { name, .. } => {
                if self.classes.contains_key(name) {
                    return TypeClass::Loadable;
                }
                if self.structs.contains_key(name) {
                    let fields = self.struct_fields(ty).unwrap_or_default();
                    return combine(fields.iter().map(|f| self.classify_at(&f.ty, depth + 1)));
                }
                if self.enums.contains_key(name) {
                    let cases = self.enum_cases(ty).unwrap_or_default();
                    return combine(
                        cases
                            .iter()
                            .filter_map(|(_, p)| p.as_ref())
                            .map(|p| self.classify_at(p, depth + 1)),
                    );
                }
                TypeClass::AddressOnly
            }
        }
    }

    pub fn is_trivial(&self, ty: &Type) -> bool {
        self.classify(ty) == TypeClass::Trivial
    }

    pub fn is_address_only(&self, ty: &Type) -> bool {
        self.classify(ty) == TypeClass::AddressOnly
    }

    pub fn is_class(&self, ty: &Type) -> bool {
        ty.nominal_name().is_some_and(|n| self.classes.contains_key(n))
    }

    pub fn is_struct(&self, ty: &Type) -> bool {
        ty.nominal_name().is_some_and(|n| self.structs.contains_key(n))
    }

    pub fn is_enum(&self, ty: &Type) -> bool {
        ty.nominal_name().is_some_and(|n| self.enums.contains_key(n))
    }

    /// Storage size in words; `None` when unknown at compile time
    pub fn size_in_words(&self, ty: &Type) -> Option<usize> {
        self.size_at(ty, 0)
    }

    fn size_at(&self, ty: &Type, depth: usize) -> Option<usize> {
        if depth > MAX_TYPE_DEPTH {
            return None;
        }
        match ty {
            Type::Param(_) | Type::Opened(_) | Type::ValueBuffer | Type::BlockStorage(_) => None,
            Type::Existential(_) if ty.is_error_existential() => Some(1),
            // inline buffer, metadata, witness table
            Type::Existential(_) => Some(5),
            Type::Function(f) if f.representation != Representation::Thin => Some(2),
            Type::Tuple(elems) => elems.iter().map(|e| self.size_at(e, depth + 1)).sum(),
            Type::Optional(inner) => {
                let payload = self.size_at(inner, depth + 1)?;
                if self.is_class(inner) || matches!(**inner, Type::NativeObject) {
                    Some(payload)
                } else {
                    Some(payload + 1)
                }
            }
            Type::Named(name) | Type::Generic { name, .. } if self.structs.contains_key(name) => {
                let fields = self.struct_fields(ty).ok()?;
                fields.iter().map(|f| self.size_at(&f.ty, depth + 1)).sum()
            }
            Type::Named(name) | Type::Generic { name, .. } if self.enums.contains_key(name) => {
                let cases = self.enum_cases(ty).ok()?;
                let mut max = 0;
                for (_, payload) in &cases {
                    if let Some(p) = payload {
                        max = max.max(self.size_at(p, depth + 1)?);
                    }
                }
                Some(max + 1)
            }
            _ => Some(1),
        }
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    /// Generic argument bindings of a bound nominal type
    pub fn substitutions(&self, ty: &Type) -> HashMap<String, Type> {
        let (name, args) = match ty {
            Type::Generic { name, args } => (name, args.as_slice()),
            _ => return HashMap::new(),
        };
        let params = self
            .structs
            .get(name)
            .map(|s| &s.generic_params)
            .or_else(|| self.enums.get(name).map(|e| &e.generic_params));
        match params {
            Some(params) => params
                .iter()
                .zip(args)
                .map(|(p, a)| (p.name.clone(), a.clone()))
                .collect(),
            None => HashMap::new(),
        }
    }

    /// Stored fields of a struct (or the pointer wrappers), in layout order
    pub fn struct_fields(&self, ty: &Type) -> Result<Vec<StoredField>> {
        match ty {
            Type::UnsafePointer(_) | Type::UnsafeMutablePointer(_) => {
                let owner = if matches!(ty, Type::UnsafePointer(_)) {
                    "UnsafePointer"
                } else {
                    "UnsafeMutablePointer"
                };
                return Ok(vec![StoredField {
                    owner: owner.to_string(),
                    name: "_rawValue".to_string(),
                    ty: Type::RawPointer,
                    index: 0,
                }]);
            }
            _ => {}
        }
        let name = ty.nominal_name().unwrap_or_default();
        let decl = self
            .structs
            .get(name)
            .ok_or_else(|| CompileError::lowering(format!("{ty} is not a struct"), Span::default()))?;
        let subs = self.substitutions(ty);
        Ok(decl
            .properties
            .iter()
            .filter(|p| !p.is_static && p.storage.has_backing_field())
            .enumerate()
            .map(|(index, p)| StoredField {
                owner: decl.name.clone(),
                name: backing_field_name(p),
                ty: backing_field_type(p).substitute(&subs),
                index,
            })
            .collect())
    }

    /// Stored fields of a class instance, superclass fields first
    pub fn class_fields(&self, class: &str) -> Result<Vec<StoredField>> {
        let mut chain = self.superclass_chain(class)?;
        chain.reverse();
        let mut fields = Vec::new();
        for decl in chain {
            for p in decl.properties.iter().filter(|p| !p.is_static && p.storage.has_backing_field()) {
                fields.push(StoredField {
                    owner: decl.name.clone(),
                    name: backing_field_name(p),
                    ty: backing_field_type(p),
                    index: fields.len(),
                });
            }
        }
        Ok(fields)
    }

    pub fn field(&self, container: &Type, name: &str) -> Result<StoredField> {
        let fields = if self.is_class(container) {
            self.class_fields(container.nominal_name().unwrap_or_default())?
        } else {
            self.struct_fields(container)?
        };
        fields.into_iter().find(|f| f.name == name).ok_or_else(|| {
            CompileError::lowering(format!("{container} has no stored property {name}"), Span::default())
        })
    }

    /// Cases with substituted payload types; `Optional` is built in
    pub fn enum_cases(&self, ty: &Type) -> Result<Vec<(String, Option<Type>)>> {
        if let Type::Optional(inner) = ty {
            return Ok(vec![
                ("some".to_string(), Some((**inner).clone())),
                ("none".to_string(), None),
            ]);
        }
        let name = ty.nominal_name().unwrap_or_default();
        let decl = self
            .enums
            .get(name)
            .ok_or_else(|| CompileError::lowering(format!("{ty} is not an enum"), Span::default()))?;
        let subs = self.substitutions(ty);
        Ok(decl
            .cases
            .iter()
            .map(|c| (c.name.clone(), c.payload.as_ref().map(|p| p.substitute(&subs))))
            .collect())
    }

    /// Name printed in `#Owner.case` references
    pub fn enum_owner_name(ty: &Type) -> String {
        match ty {
            Type::Optional(_) => "Optional".to_string(),
            other => other.nominal_name().unwrap_or("<enum>").to_string(),
        }
    }

    pub fn case_payload(&self, ty: &Type, case: &str) -> Result<Option<Type>> {
        self.enum_cases(ty)?
            .into_iter()
            .find(|(name, _)| name == case)
            .map(|(_, payload)| payload)
            .ok_or_else(|| CompileError::lowering(format!("{ty} has no case {case}"), Span::default()))
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    pub fn class_decl(&self, name: &str) -> Option<&ClassDecl> {
        self.classes.get(name)
    }

    /// `class` followed by its superclasses, most derived first
    pub fn superclass_chain(&self, class: &str) -> Result<Vec<&ClassDecl>> {
        let mut chain = Vec::new();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            let decl = self.classes.get(&name).ok_or_else(|| {
                CompileError::lowering(format!("unknown class {name}"), Span::default())
            })?;
            if chain.iter().any(|c: &&ClassDecl| c.name == decl.name) {
                return Err(CompileError::lowering(
                    format!("class {class} inherits from itself"),
                    decl.span,
                ));
            }
            chain.push(decl);
            current = decl.superclass.clone();
        }
        Ok(chain)
    }

    pub fn is_subclass(&self, derived: &str, base: &str) -> bool {
        self.superclass_chain(derived)
            .map(|chain| chain.iter().any(|c| c.name == base))
            .unwrap_or(false)
    }

    /// Classes in an order where every superclass precedes its subclasses
    pub fn classes_base_first(&self) -> Vec<&ClassDecl> {
        let mut names: Vec<&String> = self.classes.keys().collect();
        names.sort();
        let mut ordered: Vec<&ClassDecl> = Vec::new();
        for name in names {
            if let Ok(mut chain) = self.superclass_chain(name) {
                chain.reverse();
                for decl in chain {
                    if !ordered.iter().any(|c| c.name == decl.name) {
                        ordered.push(decl);
                    }
                }
            }
        }
        ordered
    }

    // ------------------------------------------------------------------
    // Member lookup
    // ------------------------------------------------------------------

    pub fn property(&self, base: &Type, name: &str) -> Option<PropertyRef> {
        let owner_name = base.nominal_name()?;
        if let Some(decl) = self.structs.get(owner_name) {
            let subs = self.substitutions(base);
            let prop = decl.properties.iter().find(|p| p.name == name)?;
            return Some(PropertyRef {
                owner: decl.name.clone(),
                owner_kind: OwnerKind::Struct,
                ty: prop.ty.substitute(&subs),
                decl: prop.clone(),
                is_final: true,
            });
        }
        if self.enums.contains_key(owner_name) {
            return None;
        }
        let chain = self.superclass_chain(owner_name).ok()?;
        for class in &chain {
            if let Some(prop) = class.properties.iter().find(|p| p.name == name) {
                return Some(PropertyRef {
                    owner: class.name.clone(),
                    owner_kind: OwnerKind::Class,
                    ty: prop.ty.clone(),
                    decl: prop.clone(),
                    is_final: prop.is_static || prop.is_final || class.is_final,
                });
            }
        }
        None
    }

    pub fn static_property(&self, owner: &str, name: &str) -> Option<PropertyRef> {
        let (props, kind): (&[PropertyDecl], OwnerKind) = if let Some(s) = self.structs.get(owner) {
            (&s.properties, OwnerKind::Struct)
        } else if let Some(c) = self.classes.get(owner) {
            (&c.properties, OwnerKind::Class)
        } else {
            return None;
        };
        let prop = props.iter().find(|p| p.name == name && p.is_static)?;
        Some(PropertyRef {
            owner: owner.to_string(),
            owner_kind: kind,
            ty: prop.ty.clone(),
            decl: prop.clone(),
            is_final: true,
        })
    }

    pub fn subscript(&self, base: &Type) -> Option<SubscriptRef> {
        let owner_name = base.nominal_name()?;
        if let Some(decl) = self.structs.get(owner_name) {
            let subs = self.substitutions(base);
            let sub = decl.subscripts.first()?;
            return Some(SubscriptRef {
                owner: decl.name.clone(),
                owner_kind: OwnerKind::Struct,
                element: sub.element.substitute(&subs),
                decl: sub.clone(),
                is_final: true,
            });
        }
        let chain = self.superclass_chain(owner_name).ok()?;
        for class in &chain {
            if let Some(sub) = class.subscripts.first() {
                return Some(SubscriptRef {
                    owner: class.name.clone(),
                    owner_kind: OwnerKind::Class,
                    element: sub.element.clone(),
                    decl: sub.clone(),
                    is_final: sub.is_final || class.is_final,
                });
            }
        }
        None
    }

    pub fn method(&self, base: &Type, name: &str) -> Option<MethodRef> {
        let owner_name = match base {
            Type::Metatype(inner) => inner.nominal_name()?,
            other => other.nominal_name()?,
        };
        if let Some(decl) = self.structs.get(owner_name) {
            let m = decl.methods.iter().find(|m| m.name == name)?;
            return Some(MethodRef {
                owner: decl.name.clone(),
                owner_kind: OwnerKind::Struct,
                decl: m.clone(),
                is_final: true,
            });
        }
        if let Some(decl) = self.enums.get(owner_name) {
            let m = decl.methods.iter().find(|m| m.name == name)?;
            return Some(MethodRef {
                owner: decl.name.clone(),
                owner_kind: OwnerKind::Enum,
                decl: m.clone(),
                is_final: true,
            });
        }
        let chain = self.superclass_chain(owner_name).ok()?;
        for class in &chain {
            if let Some(m) = class.methods.iter().find(|m| m.name == name) {
                return Some(MethodRef {
                    owner: class.name.clone(),
                    owner_kind: OwnerKind::Class,
                    decl: m.clone(),
                    is_final: m.is_final || class.is_final || m.kind == MethodKind::Static,
                });
            }
        }
        None
    }

    pub fn protocol(&self, name: &str) -> Option<&ProtocolDecl> {
        self.protocols.get(name)
    }

    pub fn requirement(&self, protocol: &str, name: &str) -> Option<&Requirement> {
        self.protocols.get(protocol)?.requirements.iter().find(|r| r.name == name)
    }

    pub fn conformances(&self) -> &[Conformance] {
        &self.conformances
    }

    pub fn conformance(&self, ty: &Type, protocol: &str) -> Option<&Conformance> {
        self.conformances.iter().find(|c| &c.ty == ty && c.protocol == protocol)
    }

    pub fn global_type(&self, name: &str) -> Option<&Type> {
        self.globals.get(name)
    }

    /// Formal type of `self` inside members of `owner`
    pub fn self_type(&self, owner: &str) -> Type {
        let params = self
            .structs
            .get(owner)
            .map(|s| &s.generic_params)
            .or_else(|| self.enums.get(owner).map(|e| &e.generic_params));
        match params {
            Some(params) if !params.is_empty() => Type::Generic {
                name: owner.to_string(),
                args: params.iter().map(|p| Type::Param(p.name.clone())).collect(),
            },
            _ => Type::Named(owner.to_string()),
        }
    }

    pub fn owner_generic_params(&self, owner: &str) -> Vec<String> {
        self.owner_generic_constraints(owner).into_iter().map(|p| p.name).collect()
    }

    /// Generic parameters of a nominal type with their protocol constraints
    pub fn owner_generic_constraints(&self, owner: &str) -> Vec<GenericParam> {
        self.structs
            .get(owner)
            .map(|s| &s.generic_params)
            .or_else(|| self.enums.get(owner).map(|e| &e.generic_params))
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Conventions and signatures
    // ------------------------------------------------------------------

    pub fn param_convention(&self, ty: &Type, convention: ParamConvention) -> ArgConvention {
        match (convention, self.classify(ty)) {
            (ParamConvention::InOut, _) => ArgConvention::InOut,
            (ParamConvention::Owned, TypeClass::AddressOnly) => ArgConvention::In,
            (ParamConvention::Shared, TypeClass::AddressOnly) => ArgConvention::InGuaranteed,
            (_, TypeClass::Trivial) => ArgConvention::Trivial,
            (ParamConvention::Owned, TypeClass::Loadable) => ArgConvention::Owned,
            (ParamConvention::Shared, TypeClass::Loadable) => ArgConvention::Guaranteed,
        }
    }

    pub fn result_convention(&self, ty: &Type) -> ResultConvention {
        match self.classify(ty) {
            TypeClass::AddressOnly => ResultConvention::Indirect,
            TypeClass::Trivial => ResultConvention::Unowned,
            TypeClass::Loadable => ResultConvention::Owned,
        }
    }

    pub fn lowered_result(&self, ty: &Type) -> LoweredResult {
        LoweredResult {
            ty: ty.clone(),
            convention: self.result_convention(ty),
        }
    }

    /// Convention of `self` for a member of `owner`
    pub fn self_convention(&self, owner_kind: OwnerKind, self_ty: &Type, mutating: bool) -> ArgConvention {
        match owner_kind {
            OwnerKind::Class => ArgConvention::Guaranteed,
            OwnerKind::Struct | OwnerKind::Enum if mutating => ArgConvention::InOut,
            OwnerKind::Struct | OwnerKind::Enum => self.param_convention(self_ty, ParamConvention::Shared),
        }
    }

    /// Lowered type of a function value of formal type `func`
    pub fn lower_function_type(&self, func: &FunctionType) -> LoweredFunctionType {
        let opaque = func.abstraction == Abstraction::Opaque;
        let params = func
            .params
            .iter()
            .map(|p| LoweredParam {
                ty: p.ty.clone(),
                convention: if opaque {
                    match p.convention {
                        ParamConvention::InOut => ArgConvention::InOut,
                        ParamConvention::Shared => ArgConvention::InGuaranteed,
                        ParamConvention::Owned => ArgConvention::In,
                    }
                } else {
                    self.param_convention(&p.ty, p.convention)
                },
            })
            .collect();
        let result = if opaque {
            LoweredResult {
                ty: func.result.clone(),
                convention: ResultConvention::Indirect,
            }
        } else {
            self.lowered_result(&func.result)
        };
        let convention = match func.representation {
            Representation::Thick => FnConvention::Thick,
            Representation::Thin => FnConvention::Thin,
            Representation::Block => FnConvention::Block,
        };
        LoweredFunctionType::new(
            convention,
            LoweredSignature {
                generic_params: Vec::new(),
                params,
                result,
                throws: func.throws,
            },
        )
    }

    fn lower_params(&self, params: &[Param]) -> Vec<LoweredParam> {
        params
            .iter()
            .map(|p| LoweredParam {
                ty: p.ty.clone(),
                convention: self.param_convention(&p.ty, p.convention),
            })
            .collect()
    }

    /// Signature of a free function or a method
    pub fn lower_fn_decl(&self, decl: &FnDecl, owner: Option<(&str, OwnerKind)>) -> LoweredFunctionType {
        let mut generic_params = owner.map(|(o, _)| self.owner_generic_params(o)).unwrap_or_default();
        generic_params.extend(decl.generic_params.iter().map(|g| g.name.clone()));
        let mut params = self.lower_params(&decl.params);
        let convention = match owner {
            None => FnConvention::Thin,
            Some((owner, kind)) => {
                let self_ty = self.self_type(owner);
                let self_param = match decl.kind {
                    MethodKind::Static => LoweredParam {
                        ty: Type::Metatype(Box::new(self_ty)),
                        convention: ArgConvention::Trivial,
                    },
                    MethodKind::Mutating | MethodKind::Instance => LoweredParam {
                        convention: self.self_convention(kind, &self_ty, decl.kind == MethodKind::Mutating),
                        ty: self_ty,
                    },
                };
                params.push(self_param);
                FnConvention::Method
            }
        };
        LoweredFunctionType::new(
            convention,
            LoweredSignature {
                generic_params,
                params,
                result: self.lowered_result(&decl.result),
                throws: decl.throws,
            },
        )
    }

    /// Signature of an accessor of a property (`index == None`) or subscript
    pub fn accessor_type(
        &self,
        owner: &str,
        owner_kind: OwnerKind,
        storage_ty: &Type,
        index: Option<&Param>,
        kind: AccessorKind,
        storage: &Storage,
    ) -> LoweredFunctionType {
        let self_ty = self.self_type(owner);
        let value_ty = storage_ty.referent().clone();
        let index_params = index.map(|p| self.lower_params(std::slice::from_ref(p))).unwrap_or_default();
        let mutating_getter = matches!(storage, Storage::Lazy { .. });
        let self_param = |mutating: bool| LoweredParam {
            ty: self_ty.clone(),
            convention: self.self_convention(owner_kind, &self_ty, mutating),
        };
        let unit = LoweredResult {
            ty: Type::unit(),
            convention: ResultConvention::Unowned,
        };
        let mut params = Vec::new();
        let result = match kind {
            AccessorKind::Getter => {
                params.extend(index_params);
                params.push(self_param(mutating_getter));
                self.lowered_result(&value_ty)
            }
            AccessorKind::Setter => {
                params.push(LoweredParam {
                    ty: value_ty.clone(),
                    convention: self.param_convention(&value_ty, ParamConvention::Owned),
                });
                params.extend(index_params);
                params.push(self_param(true));
                unit
            }
            AccessorKind::WillSet | AccessorKind::DidSet => {
                let convention = if kind == AccessorKind::WillSet {
                    ParamConvention::Shared
                } else {
                    ParamConvention::Owned
                };
                params.push(LoweredParam {
                    ty: value_ty.clone(),
                    convention: self.param_convention(&value_ty, convention),
                });
                params.push(self_param(true));
                unit
            }
            AccessorKind::MaterializeForSet => {
                params.push(LoweredParam {
                    ty: Type::RawPointer,
                    convention: ArgConvention::Trivial,
                });
                params.push(LoweredParam {
                    ty: Type::ValueBuffer,
                    convention: ArgConvention::InOut,
                });
                params.extend(index_params);
                params.push(self_param(true));
                LoweredResult {
                    ty: Type::Tuple(vec![Type::RawPointer, Type::optional(Type::RawPointer)]),
                    convention: ResultConvention::Unowned,
                }
            }
            AccessorKind::MaterializeForSetCallback => {
                params.push(LoweredParam {
                    ty: Type::RawPointer,
                    convention: ArgConvention::Trivial,
                });
                params.push(LoweredParam {
                    ty: Type::ValueBuffer,
                    convention: ArgConvention::InOut,
                });
                params.extend(index_params);
                params.push(LoweredParam {
                    ty: self_ty.clone(),
                    convention: ArgConvention::InOut,
                });
                params.push(LoweredParam {
                    ty: Type::Metatype(Box::new(self_ty.clone())),
                    convention: ArgConvention::Trivial,
                });
                unit
            }
            AccessorKind::UnsafeAddressor | AccessorKind::UnsafeMutableAddressor => {
                let mutable = kind == AccessorKind::UnsafeMutableAddressor;
                params.extend(index_params);
                // the returned pointer must outlive the call, so value-type
                // self is always passed by address
                params.push(match owner_kind {
                    OwnerKind::Class => self_param(false),
                    OwnerKind::Struct | OwnerKind::Enum if mutable => self_param(true),
                    OwnerKind::Struct | OwnerKind::Enum => LoweredParam {
                        ty: self_ty.clone(),
                        convention: ArgConvention::InGuaranteed,
                    },
                });
                let addressor_kind = match storage {
                    Storage::Addressed { kind, .. } => *kind,
                    _ => AddressorKind::Unsafe,
                };
                self.lowered_result(&addressor_result(&value_ty, mutable, addressor_kind))
            }
        };
        LoweredFunctionType::new(
            FnConvention::Method,
            LoweredSignature {
                generic_params: self.owner_generic_params(owner),
                params,
                result,
                throws: false,
            },
        )
    }

    /// Registered type of a module function
    pub fn function_type(&self, name: &str) -> Result<&LoweredFunctionType> {
        self.functions
            .get(name)
            .ok_or_else(|| CompileError::lowering(format!("unknown function {name}"), Span::default()))
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn register(&mut self, name: String, ty: LoweredFunctionType, span: Span) -> Result<()> {
        if self.functions.insert(name.clone(), ty).is_some() {
            return Err(CompileError::lowering(format!("duplicate function {name}"), span));
        }
        Ok(())
    }

    fn register_signatures(&mut self, module: &Module) -> Result<()> {
        for f in &module.functions {
            let ty = self.lower_fn_decl(f, None);
            self.register(f.name.clone(), ty, f.span)?;
        }
        let mut members: Vec<(String, OwnerKind, Vec<FnDecl>, Vec<PropertyDecl>, Vec<SubscriptDecl>)> = Vec::new();
        for s in &module.structs {
            members.push((s.name.clone(), OwnerKind::Struct, s.methods.clone(), s.properties.clone(), s.subscripts.clone()));
        }
        for e in &module.enums {
            members.push((e.name.clone(), OwnerKind::Enum, e.methods.clone(), Vec::new(), Vec::new()));
        }
        for c in &module.classes {
            members.push((c.name.clone(), OwnerKind::Class, c.methods.clone(), c.properties.clone(), c.subscripts.clone()));
        }
        for (owner, kind, methods, properties, subscripts) in members {
            for m in &methods {
                let ty = self.lower_fn_decl(m, Some((&owner, kind)));
                self.register(names::method_name(&owner, &m.name), ty, m.span)?;
            }
            for p in &properties {
                if p.is_static {
                    if p.storage.has_backing_field() {
                        let global = names::static_property_global(&owner, &p.name);
                        self.globals.insert(global.clone(), p.ty.clone());
                        self.register_global_functions(&global, p.span)?;
                    } else {
                        return Err(CompileError::lowering(
                            format!("static property {owner}.{} must be stored", p.name),
                            p.span,
                        ));
                    }
                    continue;
                }
                for accessor in accessor_kinds(&p.storage, &p.ty) {
                    let ty = self.accessor_type(&owner, kind, &p.ty, None, accessor, &p.storage);
                    self.register(names::accessor_name(&owner, &p.name, accessor), ty, p.span)?;
                }
            }
            for s in &subscripts {
                for accessor in accessor_kinds(&s.storage, &s.element) {
                    let ty = self.accessor_type(&owner, kind, &s.element, Some(&s.index), accessor, &s.storage);
                    self.register(names::accessor_name(&owner, names::SUBSCRIPT, accessor), ty, s.span)?;
                }
            }
        }
        for g in &module.globals {
            self.register_global_functions(&g.name, g.span)?;
        }
        Ok(())
    }

    fn register_global_functions(&mut self, global: &str, span: Span) -> Result<()> {
        let addressor = LoweredFunctionType::new(
            FnConvention::Thin,
            LoweredSignature {
                generic_params: Vec::new(),
                params: Vec::new(),
                result: LoweredResult {
                    ty: Type::RawPointer,
                    convention: ResultConvention::Unowned,
                },
                throws: false,
            },
        );
        let init = LoweredFunctionType::new(
            FnConvention::Thin,
            LoweredSignature {
                generic_params: Vec::new(),
                params: Vec::new(),
                result: LoweredResult {
                    ty: Type::unit(),
                    convention: ResultConvention::Unowned,
                },
                throws: false,
            },
        );
        self.register(names::global_addressor(global), addressor, span)?;
        self.register(names::global_init_func(global), init, span)
    }
}

fn combine(classes: impl Iterator<Item = TypeClass>) -> TypeClass {
    let mut result = TypeClass::Trivial;
    for class in classes {
        match class {
            TypeClass::AddressOnly => return TypeClass::AddressOnly,
            TypeClass::Loadable => result = TypeClass::Loadable,
            TypeClass::Trivial => {}
        }
    }
    result
}

fn backing_field_name(p: &PropertyDecl) -> String {
    match p.storage {
        Storage::Lazy { .. } => lazy_storage_name(&p.name),
        _ => p.name.clone(),
    }
}

fn backing_field_type(p: &PropertyDecl) -> Type {
    match p.storage {
        Storage::Lazy { .. } => Type::optional(p.ty.clone()),
        _ => p.ty.clone(),
    }
}

/// Result type of an addressor returning storage of type `value`
pub fn addressor_result(value: &Type, mutable: bool, kind: AddressorKind) -> Type {
    let pointer = if mutable {
        Type::UnsafeMutablePointer(Box::new(value.clone()))
    } else {
        Type::UnsafePointer(Box::new(value.clone()))
    };
    match kind {
        AddressorKind::Unsafe => pointer,
        AddressorKind::NativeOwner => Type::Tuple(vec![pointer, Type::NativeObject]),
        AddressorKind::PinnedNativeOwner => Type::Tuple(vec![pointer, Type::optional(Type::NativeObject)]),
    }
}

/// Accessors synthesized for a storage declaration of type `ty`, in
/// emission order. Weak and unowned stored properties materialize through
/// a temporary, so they also get a callback.
pub fn accessor_kinds(storage: &Storage, ty: &Type) -> Vec<AccessorKind> {
    use AccessorKind::*;
    match storage {
        Storage::Stored { .. } if ty.referent() != ty => {
            vec![Getter, Setter, MaterializeForSet, MaterializeForSetCallback]
        }
        Storage::Stored { .. } => vec![Getter, Setter, MaterializeForSet],
        Storage::Observed {
            will_set, did_set, ..
        } => {
            let mut kinds = vec![Getter, Setter, MaterializeForSet, MaterializeForSetCallback];
            if will_set.is_some() {
                kinds.push(WillSet);
            }
            if did_set.is_some() {
                kinds.push(DidSet);
            }
            kinds
        }
        Storage::Lazy { .. } => vec![Getter, Setter, MaterializeForSet, MaterializeForSetCallback],
        Storage::Computed { set: None, .. } => vec![Getter],
        Storage::Computed { set: Some(_), .. } => {
            vec![Getter, Setter, MaterializeForSet, MaterializeForSetCallback]
        }
        Storage::Addressed { modify: None, .. } => vec![UnsafeAddressor, Getter],
        Storage::Addressed {
            kind,
            modify: Some(_),
            ..
        } => {
            let mut kinds = vec![UnsafeAddressor, UnsafeMutableAddressor, Getter, Setter, MaterializeForSet];
            if *kind != AddressorKind::Unsafe {
                kinds.push(MaterializeForSetCallback);
            }
            kinds
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> Module {
        Module {
            name: "m".into(),
            structs: vec![
                StructDecl {
                    name: "Point".into(),
                    generic_params: vec![],
                    properties: vec![
                        stored("x", Type::Int),
                        stored("y", Type::Int),
                    ],
                    subscripts: vec![],
                    methods: vec![],
                    span: Span::default(),
                },
                StructDecl {
                    name: "Holder".into(),
                    generic_params: vec![GenericParam { name: "T".into(), conforms_to: vec![] }],
                    properties: vec![stored("value", Type::Param("T".into()))],
                    subscripts: vec![],
                    methods: vec![],
                    span: Span::default(),
                },
            ],
            classes: vec![
                ClassDecl {
                    name: "Base".into(),
                    superclass: None,
                    is_final: false,
                    properties: vec![stored("id", Type::Int)],
                    subscripts: vec![],
                    methods: vec![],
                    span: Span::default(),
                },
                ClassDecl {
                    name: "Derived".into(),
                    superclass: Some("Base".into()),
                    is_final: false,
                    properties: vec![stored("next", Type::optional(Type::Named("Base".into())))],
                    subscripts: vec![],
                    methods: vec![],
                    span: Span::default(),
                },
            ],
            ..Default::default()
        }
    }

    fn stored(name: &str, ty: Type) -> PropertyDecl {
        PropertyDecl {
            name: name.into(),
            ty,
            is_static: false,
            is_final: false,
            is_override: false,
            storage: Storage::Stored { initial: None },
            span: Span::default(),
        }
    }

    #[test]
    fn test_classification() {
        let tl = TypeLowering::new(&module()).unwrap();
        assert_eq!(tl.classify(&Type::Named("Point".into())), TypeClass::Trivial);
        assert_eq!(tl.classify(&Type::Named("Base".into())), TypeClass::Loadable);
        assert_eq!(tl.classify(&Type::Param("T".into())), TypeClass::AddressOnly);
        assert_eq!(tl.classify(&Type::Existential("P".into())), TypeClass::AddressOnly);
        assert_eq!(tl.classify(&Type::error()), TypeClass::Loadable);
        let holder_int = Type::Generic { name: "Holder".into(), args: vec![Type::Int] };
        assert_eq!(tl.classify(&holder_int), TypeClass::Trivial);
        assert_eq!(tl.classify(&tl.self_type("Holder")), TypeClass::AddressOnly);
    }

    #[test]
    fn test_class_fields_flattened_base_first() {
        let tl = TypeLowering::new(&module()).unwrap();
        let fields = tl.class_fields("Derived").unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!((fields[0].owner.as_str(), fields[0].name.as_str(), fields[0].index), ("Base", "id", 0));
        assert_eq!((fields[1].owner.as_str(), fields[1].index), ("Derived", 1));
    }

    #[test]
    fn test_accessor_signatures_registered() {
        let tl = TypeLowering::new(&module()).unwrap();
        let getter = tl.function_type("Point.x!getter").unwrap();
        assert_eq!(getter.sig.params[0].convention, ArgConvention::Trivial);
        let setter = tl.function_type("Base.id!setter").unwrap();
        assert_eq!(setter.sig.params.last().unwrap().convention, ArgConvention::Guaranteed);
        let mfs = tl.function_type("Point.y!materializeForSet").unwrap();
        assert_eq!(mfs.sig.params[1].convention, ArgConvention::InOut);
        assert!(!tl.has_function("Point.x!materializeForSet.callback"));
    }

    #[test]
    fn test_property_lookup_walks_superclasses() {
        let tl = TypeLowering::new(&module()).unwrap();
        let prop = tl.property(&Type::Named("Derived".into()), "id").unwrap();
        assert_eq!(prop.owner, "Base");
        assert!(!prop.is_final);
        assert!(tl.is_subclass("Derived", "Base"));
        assert!(!tl.is_subclass("Base", "Derived"));
    }

    #[test]
    fn test_inline_buffer_sizes() {
        let tl = TypeLowering::new(&module()).unwrap();
        assert_eq!(tl.size_in_words(&Type::Named("Point".into())), Some(2));
        assert_eq!(tl.size_in_words(&Type::optional(Type::Named("Base".into()))), Some(1));
        assert_eq!(tl.size_in_words(&Type::Param("T".into())), None);
    }

    #[test]
    fn test_unknown_superclass_rejected() {
        let mut m = module();
        m.classes[1].superclass = Some("Missing".into());
        assert!(TypeLowering::new(&m).is_err());
    }
}
