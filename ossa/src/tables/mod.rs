//! Vtables and witness tables
//!
//! Tables are assembled once per module, before any function body is
//! lowered, and are read-only afterwards. Building them also decides which
//! dispatch thunks the module needs; those come back as [`ThunkRequest`]s
//! for the lowering stage to synthesize.

use std::collections::HashMap;

use crate::ast::*;
use crate::config::{LoweringConfig, OverridePolicy};
use crate::error::{CompileError, Result};
use crate::mir::{FnConvention, LoweredFunctionType};
use crate::types::names::{self, AccessorKind};
use crate::types::{
    accessor_kinds, ArgConvention, LoweredParam, LoweredResult, LoweredSignature, ResultConvention, TypeLowering,
};

/// Origin of a vtable slot's current implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Slot introduced by this class
    Declared,
    /// Slot and implementation inherited unchanged
    Inherited,
    /// Inherited slot with this class's implementation
    Override,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VTableEntry {
    /// `#Declaring.key`
    pub selector: String,
    pub implementation: String,
    pub ty: LoweredFunctionType,
    pub kind: EntryKind,
}

/// Flat, ordered slot array with a selector index
#[derive(Debug, Clone, PartialEq)]
pub struct VTable {
    pub class: String,
    pub entries: Vec<VTableEntry>,
    index: HashMap<String, usize>,
}

impl VTable {
    fn new(class: &str) -> Self {
        VTable {
            class: class.to_string(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn push(&mut self, entry: VTableEntry) {
        self.index.insert(entry.selector.clone(), self.entries.len());
        self.entries.push(entry);
    }

    pub fn slot(&self, selector: &str) -> Option<usize> {
        self.index.get(selector).copied()
    }

    pub fn entry(&self, selector: &str) -> Option<&VTableEntry> {
        self.slot(selector).map(|i| &self.entries[i])
    }

    /// Most recently introduced slot for a member key
    pub fn latest_for_key(&self, key: &str) -> Option<&VTableEntry> {
        self.entries.iter().rev().find(|e| names::selector_key(&e.selector) == key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WitnessEntry {
    /// Requirement key, `run` or `count!getter`
    pub requirement: String,
    pub thunk: String,
    /// Function the thunk forwards to
    pub witness: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WitnessTable {
    pub conforming: Type,
    pub protocol: String,
    pub entries: Vec<WitnessEntry>,
    pub associated_types: Vec<(String, Type)>,
}

impl WitnessTable {
    pub fn entry(&self, requirement: &str) -> Option<&WitnessEntry> {
        self.entries.iter().find(|e| e.requirement == requirement)
    }
}

/// Every dispatch table of a module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSet {
    pub module: String,
    pub vtables: Vec<VTable>,
    pub witness_tables: Vec<WitnessTable>,
}

impl TableSet {
    pub fn vtable(&self, class: &str) -> Option<&VTable> {
        self.vtables.iter().find(|v| v.class == class)
    }

    /// Slot used when calling member `key` on a value of static type `class`
    pub fn dispatch_entry(&self, class: &str, key: &str) -> Option<&VTableEntry> {
        self.vtable(class)?.latest_for_key(key)
    }

    pub fn witness_table(&self, ty: &Type, protocol: &str) -> Option<&WitnessTable> {
        self.witness_tables
            .iter()
            .find(|w| &w.conforming == ty && w.protocol == protocol)
    }

    /// Conformance of a runtime type known only by its printed name
    pub fn witness_table_named(&self, type_name: &str, protocol: &str) -> Option<&WitnessTable> {
        self.witness_tables.iter().find(|w| {
            w.protocol == protocol
                && (w.conforming.to_string() == type_name || w.conforming.nominal_name() == Some(type_name))
        })
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        for vtable in &self.vtables {
            out.push_str(&format!("sil_vtable {} {{\n", vtable.class));
            for entry in &vtable.entries {
                let tag = match entry.kind {
                    EntryKind::Declared => "",
                    EntryKind::Inherited => " [inherited]",
                    EntryKind::Override => " [override]",
                };
                out.push_str(&format!("  {}: @{}{tag}\n", entry.selector, entry.implementation));
            }
            out.push_str("}\n\n");
        }
        for table in &self.witness_tables {
            out.push_str(&format!(
                "sil_witness_table {}: {} module {} {{\n",
                table.conforming, table.protocol, self.module
            ));
            for (name, ty) in &table.associated_types {
                out.push_str(&format!("  associated_type {name}: {ty}\n"));
            }
            for entry in &table.entries {
                out.push_str(&format!(
                    "  method #{}.{}: @{}\n",
                    table.protocol, entry.requirement, entry.thunk
                ));
            }
            out.push_str("}\n\n");
        }
        out.truncate(out.trim_end().len());
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Member a witness thunk forwards to
#[derive(Debug, Clone, PartialEq)]
pub enum WitnessTarget {
    Method { name: String },
    Accessor { property: String, kind: AccessorKind },
}

/// A dispatch thunk the module must contain
#[derive(Debug, Clone, PartialEq)]
pub enum ThunkRequest {
    /// Adapts an override to the signature of the slot it fills
    VTable {
        name: String,
        class: String,
        implementation: String,
        ty: LoweredFunctionType,
    },
    /// Adapts a concrete member to a requirement's abstract signature
    Witness {
        name: String,
        conforming: Type,
        protocol: String,
        requirement: String,
        target: WitnessTarget,
        ty: LoweredFunctionType,
    },
}

impl ThunkRequest {
    pub fn name(&self) -> &str {
        match self {
            ThunkRequest::VTable { name, .. } | ThunkRequest::Witness { name, .. } => name,
        }
    }
}

/// How an override's signature relates to the slot it overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variance {
    Identical,
    /// Differs only in ways the slot's representation absorbs
    Compatible,
    /// Needs repacking; the old slot cannot call it directly
    Incompatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Same,
    Free,
    Packed,
}

/// Conversion from `from` to `to` allowed at a dispatch boundary
fn conversion(tl: &TypeLowering, from: &Type, to: &Type) -> Option<Conversion> {
    if from == to {
        return Some(Conversion::Same);
    }
    if let Type::Optional(payload) = to {
        if let Some(inner) = conversion(tl, from, payload) {
            let free = is_reference_like(tl, payload);
            return Some(match inner {
                Conversion::Packed => Conversion::Packed,
                _ if free => Conversion::Free,
                _ => Conversion::Packed,
            });
        }
        if let Type::Optional(from_payload) = from {
            return conversion(tl, from_payload, payload);
        }
    }
    match (from.nominal_name(), to.nominal_name()) {
        (Some(a), Some(b)) if tl.is_class(from) && tl.is_class(to) && tl.is_subclass(a, b) => {
            Some(Conversion::Free)
        }
        _ => None,
    }
}

/// Optional of this type shares its representation
fn is_reference_like(tl: &TypeLowering, ty: &Type) -> bool {
    tl.is_class(ty) || matches!(ty, Type::Metatype(_) | Type::NativeObject)
}

fn compare_override(tl: &TypeLowering, base: &LoweredSignature, over: &LoweredSignature) -> Option<Variance> {
    if base.params.len() != over.params.len() || base.throws != over.throws {
        return None;
    }
    let formal = base.params.len().saturating_sub(1);
    let mut conversions = Vec::new();
    for (b, o) in base.params[..formal].iter().zip(&over.params[..formal]) {
        if (b.convention == ArgConvention::InOut) != (o.convention == ArgConvention::InOut) {
            return None;
        }
        conversions.push(conversion(tl, &b.ty, &o.ty)?);
    }
    conversions.push(conversion(tl, &over.result.ty, &base.result.ty)?);
    Some(if conversions.iter().all(|c| *c == Conversion::Same) {
        Variance::Identical
    } else if conversions.contains(&Conversion::Packed) {
        Variance::Incompatible
    } else {
        Variance::Compatible
    })
}

struct DispatchMember {
    key: String,
    implementation: String,
    is_final: bool,
    is_override: bool,
    /// Subscripts carry no `override` marker
    implicit_override: bool,
    span: Span,
}

fn dispatchable_members(class: &ClassDecl) -> Vec<DispatchMember> {
    let mut members = Vec::new();
    for m in class.methods.iter().filter(|m| m.kind != MethodKind::Static) {
        members.push(DispatchMember {
            key: m.name.clone(),
            implementation: names::method_name(&class.name, &m.name),
            is_final: m.is_final || class.is_final,
            is_override: m.is_override,
            implicit_override: false,
            span: m.span,
        });
    }
    for p in class.properties.iter().filter(|p| !p.is_static) {
        for kind in accessor_kinds(&p.storage, &p.ty).into_iter().filter(AccessorKind::is_dispatchable) {
            members.push(DispatchMember {
                key: names::accessor_key(&p.name, kind),
                implementation: names::accessor_name(&class.name, &p.name, kind),
                is_final: p.is_final || class.is_final,
                is_override: p.is_override,
                implicit_override: false,
                span: p.span,
            });
        }
    }
    for s in &class.subscripts {
        for kind in accessor_kinds(&s.storage, &s.element).into_iter().filter(AccessorKind::is_dispatchable) {
            members.push(DispatchMember {
                key: names::accessor_key(names::SUBSCRIPT, kind),
                implementation: names::accessor_name(&class.name, names::SUBSCRIPT, kind),
                is_final: s.is_final || class.is_final,
                is_override: false,
                implicit_override: true,
                span: s.span,
            });
        }
    }
    members
}

/// Function registered for selector `#Declaring.key`
fn declared_function(selector: &str) -> String {
    selector.trim_start_matches('#').to_string()
}

fn with_self_type(ty: &LoweredFunctionType, self_ty: Type) -> LoweredFunctionType {
    let mut ty = ty.clone();
    if let Some(last) = ty.sig.params.last_mut() {
        last.ty = self_ty;
    }
    ty
}

fn build_vtable(
    tl: &TypeLowering,
    config: &LoweringConfig,
    class: &ClassDecl,
    base: Option<&VTable>,
    thunks: &mut Vec<ThunkRequest>,
) -> Result<VTable> {
    let mut vtable = VTable::new(&class.name);
    if let Some(base) = base {
        for entry in &base.entries {
            vtable.push(VTableEntry {
                kind: EntryKind::Inherited,
                ..entry.clone()
            });
        }
    }

    for member in dispatchable_members(class) {
        let impl_ty = tl.function_type(&member.implementation)?.clone();
        let overridden: Vec<usize> = vtable
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| names::selector_key(&e.selector) == member.key)
            .map(|(i, _)| i)
            .collect();

        if overridden.is_empty() {
            if member.is_override {
                return Err(CompileError::lowering(
                    format!("{} does not override any member of a superclass", member.implementation),
                    member.span,
                ));
            }
            if !member.is_final {
                vtable.push(VTableEntry {
                    selector: names::selector(&class.name, &member.key),
                    implementation: member.implementation.clone(),
                    ty: impl_ty,
                    kind: EntryKind::Declared,
                });
            }
            continue;
        }
        if !member.is_override && !member.implicit_override {
            return Err(CompileError::lowering(
                format!("{} overrides a superclass member but is not marked override", member.implementation),
                member.span,
            ));
        }

        let mut needs_slot = false;
        for slot in overridden {
            let selector = vtable.entries[slot].selector.clone();
            let declared_ty = tl.function_type(&declared_function(&selector))?.clone();
            let variance = compare_override(tl, &declared_ty.sig, &impl_ty.sig).ok_or_else(|| {
                CompileError::lowering(
                    format!(
                        "{} has a type incompatible with the overridden {selector}",
                        member.implementation
                    ),
                    member.span,
                )
            })?;
            let entry = &mut vtable.entries[slot];
            entry.kind = EntryKind::Override;
            if variance == Variance::Identical {
                entry.implementation = member.implementation.clone();
                entry.ty = impl_ty.clone();
                continue;
            }
            let thunk_name = names::vtable_thunk_name(&selector, &class.name);
            let thunk_ty = with_self_type(&declared_ty, Type::Named(class.name.clone()));
            entry.implementation = thunk_name.clone();
            entry.ty = thunk_ty.clone();
            tracing::debug!(class = %class.name, %selector, ?variance, "override needs a vtable thunk");
            thunks.push(ThunkRequest::VTable {
                name: thunk_name,
                class: class.name.clone(),
                implementation: member.implementation.clone(),
                ty: thunk_ty,
            });
            needs_slot |= match (config.override_policy, variance) {
                (OverridePolicy::NeverNewSlot, _) => false,
                (OverridePolicy::AlwaysNewSlot, _) => true,
                (OverridePolicy::RepresentationCompatible, v) => v == Variance::Incompatible,
            };
        }
        let own_selector = names::selector(&class.name, &member.key);
        if needs_slot && !member.is_final && vtable.slot(&own_selector).is_none() {
            vtable.push(VTableEntry {
                selector: own_selector,
                implementation: member.implementation.clone(),
                ty: impl_ty,
                kind: EntryKind::Declared,
            });
        }
    }
    Ok(vtable)
}

/// Requirement keys of a protocol requirement, in table order
fn requirement_keys(req: &Requirement) -> Vec<(String, Option<AccessorKind>)> {
    match &req.kind {
        RequirementKind::Method { .. } => vec![(req.name.clone(), None)],
        RequirementKind::Property { settable, .. } => {
            let mut kinds = vec![AccessorKind::Getter];
            if *settable {
                kinds.push(AccessorKind::Setter);
                kinds.push(AccessorKind::MaterializeForSet);
            }
            kinds
                .into_iter()
                .map(|k| (names::accessor_key(&req.name, k), Some(k)))
                .collect()
        }
    }
}

/// Abstract signature of a requirement entry point, with `Self` and its
/// associated types replaced through `subs` after conventions are chosen
pub fn requirement_type(
    tl: &TypeLowering,
    protocol: &str,
    key: &str,
    subs: &HashMap<String, Type>,
) -> Result<LoweredFunctionType> {
    let (name, accessor) = match key.split_once('!') {
        Some((name, kind)) => (name, Some(kind)),
        None => (key, None),
    };
    let req = tl.requirement(protocol, name).ok_or_else(|| {
        CompileError::table(format!("protocol {protocol} has no requirement {name}"))
    })?;
    let self_abstract = Type::Param("Self".to_string());
    let self_ty = self_abstract.substitute(subs);
    let param = |ty: &Type, convention: ParamConvention| LoweredParam {
        ty: ty.substitute(subs),
        convention: tl.param_convention(ty, convention),
    };
    let result = |ty: &Type| LoweredResult {
        ty: ty.substitute(subs),
        convention: tl.result_convention(ty),
    };
    let unit = LoweredResult {
        ty: Type::unit(),
        convention: ResultConvention::Unowned,
    };
    let self_param = |mutating: bool| LoweredParam {
        ty: self_ty.clone(),
        convention: if mutating {
            ArgConvention::InOut
        } else {
            ArgConvention::InGuaranteed
        },
    };
    let sig = match (&req.kind, accessor) {
        (
            RequirementKind::Method {
                params,
                result: res,
                throws,
                mutating,
            },
            None,
        ) => {
            let mut lowered: Vec<LoweredParam> = params.iter().map(|p| param(&p.ty, p.convention)).collect();
            lowered.push(self_param(*mutating));
            LoweredSignature {
                generic_params: Vec::new(),
                params: lowered,
                result: result(res),
                throws: *throws,
            }
        }
        (RequirementKind::Property { ty, .. }, Some("getter")) => LoweredSignature {
            generic_params: Vec::new(),
            params: vec![self_param(false)],
            result: result(ty),
            throws: false,
        },
        (RequirementKind::Property { ty, .. }, Some("setter")) => LoweredSignature {
            generic_params: Vec::new(),
            params: vec![param(ty, ParamConvention::Owned), self_param(true)],
            result: unit,
            throws: false,
        },
        (RequirementKind::Property { .. }, Some("materializeForSet")) => LoweredSignature {
            generic_params: Vec::new(),
            params: vec![
                LoweredParam {
                    ty: Type::RawPointer,
                    convention: ArgConvention::Trivial,
                },
                LoweredParam {
                    ty: Type::ValueBuffer,
                    convention: ArgConvention::InOut,
                },
                self_param(true),
            ],
            result: LoweredResult {
                ty: Type::Tuple(vec![Type::RawPointer, Type::optional(Type::RawPointer)]),
                convention: ResultConvention::Unowned,
            },
            throws: false,
        },
        _ => {
            return Err(CompileError::table(format!(
                "{key} is not an entry point of {protocol}.{name}"
            )))
        }
    };
    Ok(LoweredFunctionType::new(FnConvention::WitnessMethod, sig))
}

/// `Self` and `Self.Assoc` bindings of a conformance
pub fn conformance_substitutions(conformance: &Conformance) -> HashMap<String, Type> {
    let mut subs = HashMap::new();
    subs.insert("Self".to_string(), conformance.ty.clone());
    for binding in &conformance.associated_types {
        subs.insert(format!("Self.{}", binding.name), binding.ty.clone());
    }
    subs
}

fn build_witness_table(
    tl: &TypeLowering,
    conformance: &Conformance,
    thunks: &mut Vec<ThunkRequest>,
) -> Result<WitnessTable> {
    let protocol = tl.protocol(&conformance.protocol).ok_or_else(|| {
        CompileError::table(format!(
            "{} conforms to unknown protocol {}",
            conformance.ty, conformance.protocol
        ))
    })?;
    let mut associated_types = Vec::new();
    for assoc in &protocol.associated_types {
        let binding = conformance
            .associated_types
            .iter()
            .find(|b| &b.name == assoc)
            .ok_or_else(|| {
                CompileError::table(format!(
                    "conformance of {} to {} does not bind associated type {assoc}",
                    conformance.ty, protocol.name
                ))
            })?;
        associated_types.push((assoc.clone(), binding.ty.clone()));
    }
    let subs = conformance_substitutions(conformance);
    let conforming = conformance.ty.to_string();

    let mut entries = Vec::new();
    for req in &protocol.requirements {
        let member = conformance
            .witnesses
            .iter()
            .find(|w| w.requirement == req.name)
            .map(|w| w.member.clone())
            .unwrap_or_else(|| req.name.clone());
        for (key, accessor) in requirement_keys(req) {
            let (target, witness) = match (&req.kind, accessor) {
                (RequirementKind::Method { params, result, throws, .. }, None) => {
                    let method = tl.method(&conformance.ty, &member).ok_or_else(|| {
                        CompileError::table(format!(
                            "{conforming} has no member {member} to witness {}.{}",
                            protocol.name, req.name
                        ))
                    })?;
                    check_method_witness(tl, &method.decl, params, result, *throws, &subs).map_err(|why| {
                        CompileError::lowering(
                            format!("{conforming}.{member} cannot witness {}.{}: {why}", protocol.name, req.name),
                            method.decl.span,
                        )
                    })?;
                    (
                        WitnessTarget::Method { name: member.clone() },
                        names::method_name(&method.owner, &member),
                    )
                }
                (RequirementKind::Property { ty, .. }, Some(kind)) => {
                    let prop = tl.property(&conformance.ty, &member).ok_or_else(|| {
                        CompileError::table(format!(
                            "{conforming} has no property {member} to witness {}.{}",
                            protocol.name, req.name
                        ))
                    })?;
                    if prop.ty.referent() != &ty.substitute(&subs) {
                        return Err(CompileError::lowering(
                            format!(
                                "{conforming}.{member} has type {} but {}.{} requires {}",
                                prop.ty,
                                protocol.name,
                                req.name,
                                ty.substitute(&subs)
                            ),
                            prop.decl.span,
                        ));
                    }
                    if kind != AccessorKind::Getter && !prop.decl.storage.is_settable() {
                        return Err(CompileError::lowering(
                            format!("{conforming}.{member} is not settable but {}.{} is", protocol.name, req.name),
                            prop.decl.span,
                        ));
                    }
                    (
                        WitnessTarget::Accessor {
                            property: member.clone(),
                            kind,
                        },
                        names::accessor_name(&prop.owner, &member, kind),
                    )
                }
                _ => {
                    return Err(CompileError::table(format!(
                        "malformed requirement {}.{}",
                        protocol.name, req.name
                    )))
                }
            };
            let thunk = names::witness_thunk_name(&conforming, &protocol.name, &key);
            thunks.push(ThunkRequest::Witness {
                name: thunk.clone(),
                conforming: conformance.ty.clone(),
                protocol: protocol.name.clone(),
                requirement: key.clone(),
                target,
                ty: requirement_type(tl, &protocol.name, &key, &subs)?,
            });
            entries.push(WitnessEntry {
                requirement: key,
                thunk,
                witness,
            });
        }
    }
    Ok(WitnessTable {
        conforming: conformance.ty.clone(),
        protocol: protocol.name.clone(),
        entries,
        associated_types,
    })
}

fn check_method_witness(
    tl: &TypeLowering,
    witness: &FnDecl,
    params: &[Param],
    result: &Type,
    throws: bool,
    subs: &HashMap<String, Type>,
) -> std::result::Result<(), String> {
    if witness.params.len() != params.len() {
        return Err(format!("expected {} parameters, found {}", params.len(), witness.params.len()));
    }
    if witness.throws && !throws {
        return Err("witness throws but the requirement does not".to_string());
    }
    for (req, wit) in params.iter().zip(&witness.params) {
        let req_ty = req.ty.substitute(subs);
        if conversion(tl, &req_ty, &wit.ty).is_none() {
            return Err(format!("parameter {} has type {}, expected {req_ty}", wit.name, wit.ty));
        }
    }
    let req_result = result.substitute(subs);
    if conversion(tl, &witness.result, &req_result).is_none() {
        return Err(format!("result has type {}, expected {req_result}", witness.result));
    }
    Ok(())
}

/// Build every vtable and witness table of the module
pub fn build_tables(
    tl: &TypeLowering,
    config: &LoweringConfig,
    module: &str,
) -> Result<(TableSet, Vec<ThunkRequest>)> {
    let _span = tracing::debug_span!("build_tables", module).entered();
    let mut set = TableSet {
        module: module.to_string(),
        ..Default::default()
    };
    let mut thunks = Vec::new();

    for class in tl.classes_base_first() {
        let base = class.superclass.as_deref().and_then(|s| set.vtable(s));
        let vtable = build_vtable(tl, config, class, base, &mut thunks)?;
        tracing::trace!(class = %class.name, slots = vtable.entries.len(), "vtable built");
        set.vtables.push(vtable);
    }
    for conformance in tl.conformances() {
        let table = build_witness_table(tl, conformance, &mut thunks)?;
        set.witness_tables.push(table);
    }
    tracing::debug!(
        vtables = set.vtables.len(),
        witness_tables = set.witness_tables.len(),
        thunks = thunks.len(),
        "tables built"
    );
    Ok((set, thunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(name: &str, result: Type) -> FnDecl {
        FnDecl {
            name: name.into(),
            generic_params: vec![],
            params: vec![],
            result,
            throws: false,
            kind: MethodKind::Instance,
            is_final: false,
            is_override: false,
            body: vec![],
            span: Span::default(),
        }
    }

    fn overriding(name: &str, result: Type) -> FnDecl {
        FnDecl {
            is_override: true,
            ..method(name, result)
        }
    }

    fn class(name: &str, superclass: Option<&str>, methods: Vec<FnDecl>) -> ClassDecl {
        ClassDecl {
            name: name.into(),
            superclass: superclass.map(String::from),
            is_final: false,
            properties: vec![],
            subscripts: vec![],
            methods,
            span: Span::default(),
        }
    }

    fn tables(module: &Module, config: &LoweringConfig) -> Result<(TableSet, Vec<ThunkRequest>)> {
        let tl = TypeLowering::new(module)?;
        build_tables(&tl, config, &module.name)
    }

    fn named(n: &str) -> Type {
        Type::Named(n.into())
    }

    #[test]
    fn test_override_replaces_slot() {
        let module = Module {
            name: "m".into(),
            classes: vec![
                class("B", None, vec![method("f", Type::Int), method("g", Type::Int)]),
                class("D", Some("B"), vec![overriding("f", Type::Int)]),
            ],
            ..Default::default()
        };
        let (set, thunks) = tables(&module, &LoweringConfig::default()).unwrap();
        let d = set.vtable("D").unwrap();
        assert_eq!(d.entries.len(), 2);
        assert_eq!(d.entry("#B.f").unwrap().implementation, "D.f");
        assert_eq!(d.entry("#B.f").unwrap().kind, EntryKind::Override);
        assert_eq!(d.entry("#B.g").unwrap().kind, EntryKind::Inherited);
        assert!(thunks.is_empty());
    }

    #[test]
    fn test_optional_class_result_reuses_slot() {
        let module = Module {
            name: "m".into(),
            classes: vec![
                class("B", None, vec![method("make", Type::optional(named("B")))]),
                class("D", Some("B"), vec![overriding("make", named("B"))]),
            ],
            ..Default::default()
        };
        let (set, thunks) = tables(&module, &LoweringConfig::default()).unwrap();
        let d = set.vtable("D").unwrap();
        assert_eq!(d.entries.len(), 1);
        assert_eq!(d.entries[0].implementation, "vtable thunk for #B.make in D");
        assert_eq!(thunks.len(), 1);
    }

    #[test]
    fn test_optional_tuple_result_adds_slot() {
        let tuple = Type::Tuple(vec![Type::Int, Type::Int]);
        let module = Module {
            name: "m".into(),
            classes: vec![
                class("B", None, vec![method("pair", Type::optional(tuple.clone()))]),
                class("D", Some("B"), vec![overriding("pair", tuple)]),
            ],
            ..Default::default()
        };
        let (set, _) = tables(&module, &LoweringConfig::default()).unwrap();
        let d = set.vtable("D").unwrap();
        assert_eq!(d.entries.len(), 2);
        assert_eq!(d.entry("#D.pair").unwrap().implementation, "D.pair");
        assert_eq!(set.dispatch_entry("D", "pair").unwrap().selector, "#D.pair");

        let never = LoweringConfig {
            override_policy: OverridePolicy::NeverNewSlot,
            ..Default::default()
        };
        let (set, _) = tables(&module, &never).unwrap();
        assert_eq!(set.vtable("D").unwrap().entries.len(), 1);
    }

    #[test]
    fn test_unsound_narrowing_rejected() {
        let module = Module {
            name: "m".into(),
            classes: vec![
                class("B", None, vec![method("make", named("B"))]),
                class("D", Some("B"), vec![overriding("make", Type::optional(named("B")))]),
            ],
            ..Default::default()
        };
        assert!(tables(&module, &LoweringConfig::default()).is_err());
    }

    #[test]
    fn test_addressors_get_no_slots() {
        let mut c = class("C", None, vec![]);
        c.subscripts.push(SubscriptDecl {
            index: Param {
                name: "i".into(),
                ty: Type::Int,
                convention: ParamConvention::Owned,
            },
            element: Type::Int,
            is_final: false,
            storage: Storage::Addressed {
                kind: AddressorKind::NativeOwner,
                read: vec![],
                modify: Some(vec![]),
            },
            span: Span::default(),
        });
        let module = Module {
            name: "m".into(),
            classes: vec![c],
            ..Default::default()
        };
        let (set, _) = tables(&module, &LoweringConfig::default()).unwrap();
        let selectors: Vec<_> = set.vtable("C").unwrap().entries.iter().map(|e| e.selector.clone()).collect();
        assert_eq!(
            selectors,
            vec!["#C.subscript!getter", "#C.subscript!setter", "#C.subscript!materializeForSet"]
        );
    }

    #[test]
    fn test_witness_table_entries() {
        let module = Module {
            name: "m".into(),
            structs: vec![StructDecl {
                name: "S".into(),
                generic_params: vec![],
                properties: vec![],
                subscripts: vec![],
                methods: vec![method("run", Type::Int)],
                span: Span::default(),
            }],
            protocols: vec![ProtocolDecl {
                name: "P".into(),
                requirements: vec![Requirement {
                    name: "run".into(),
                    kind: RequirementKind::Method {
                        params: vec![],
                        result: Type::Int,
                        throws: false,
                        mutating: false,
                    },
                }],
                associated_types: vec![],
            }],
            conformances: vec![Conformance {
                ty: named("S"),
                protocol: "P".into(),
                witnesses: vec![],
                associated_types: vec![],
            }],
            ..Default::default()
        };
        let (set, thunks) = tables(&module, &LoweringConfig::default()).unwrap();
        let table = set.witness_table(&named("S"), "P").unwrap();
        assert_eq!(table.entries[0].witness, "S.run");
        assert_eq!(table.entries[0].thunk, "protocol witness for P.run in S");
        match &thunks[0] {
            ThunkRequest::Witness { ty, .. } => {
                assert_eq!(ty.sig.params[0].convention, ArgConvention::InGuaranteed);
                assert_eq!(ty.sig.result.convention, ResultConvention::Unowned);
            }
            other => panic!("unexpected thunk {other:?}"),
        }
        assert!(set.format().contains("method #P.run: @protocol witness for P.run in S"));
    }
}
