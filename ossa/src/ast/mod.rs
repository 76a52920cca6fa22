//! Resolved declaration graph
//!
//! This is the input of the lowering pass: every name resolved, every
//! expression typed, every conformance spelled out. It is normally produced
//! by an external front end and read from JSON.

mod expr;
mod span;
mod types;

pub use expr::*;
pub use span::*;
pub use types::*;

use serde::{Deserialize, Serialize};

/// A module is the unit of lowering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub structs: Vec<StructDecl>,
    #[serde(default)]
    pub enums: Vec<EnumDecl>,
    #[serde(default)]
    pub classes: Vec<ClassDecl>,
    #[serde(default)]
    pub protocols: Vec<ProtocolDecl>,
    #[serde(default)]
    pub conformances: Vec<Conformance>,
    #[serde(default)]
    pub functions: Vec<FnDecl>,
    #[serde(default)]
    pub globals: Vec<GlobalDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    #[serde(default)]
    pub generic_params: Vec<GenericParam>,
    #[serde(default)]
    pub properties: Vec<PropertyDecl>,
    #[serde(default)]
    pub subscripts: Vec<SubscriptDecl>,
    #[serde(default)]
    pub methods: Vec<FnDecl>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDecl {
    pub name: String,
    #[serde(default)]
    pub generic_params: Vec<GenericParam>,
    pub cases: Vec<EnumCaseDecl>,
    #[serde(default)]
    pub methods: Vec<FnDecl>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumCaseDecl {
    pub name: String,
    #[serde(default)]
    pub payload: Option<Type>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDecl {
    pub name: String,
    #[serde(default)]
    pub superclass: Option<String>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub properties: Vec<PropertyDecl>,
    #[serde(default)]
    pub subscripts: Vec<SubscriptDecl>,
    #[serde(default)]
    pub methods: Vec<FnDecl>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDecl {
    pub name: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub associated_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub kind: RequirementKind,
}

/// Requirement signature, written in terms of `Self` and `Self.Assoc` params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequirementKind {
    Method {
        #[serde(default)]
        params: Vec<Param>,
        #[serde(default = "Type::unit")]
        result: Type,
        #[serde(default)]
        throws: bool,
        #[serde(default)]
        mutating: bool,
    },
    Property {
        ty: Type,
        #[serde(default)]
        settable: bool,
    },
}

/// `ty: protocol`, with the member satisfying each requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conformance {
    pub ty: Type,
    pub protocol: String,
    /// Requirements not listed here are satisfied by the same-named member
    #[serde(default)]
    pub witnesses: Vec<WitnessBinding>,
    #[serde(default)]
    pub associated_types: Vec<AssociatedTypeBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessBinding {
    pub requirement: String,
    pub member: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedTypeBinding {
    pub name: String,
    pub ty: Type,
}

/// Function or method declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnDecl {
    pub name: String,
    #[serde(default)]
    pub generic_params: Vec<GenericParam>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default = "Type::unit")]
    pub result: Type,
    #[serde(default)]
    pub throws: bool,
    /// Ignored for free functions
    #[serde(default)]
    pub kind: MethodKind,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_override: bool,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    #[default]
    Instance,
    Mutating,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    #[serde(default)]
    pub convention: ParamConvention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericParam {
    pub name: String,
    #[serde(default)]
    pub conforms_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDecl {
    pub name: String,
    /// Storage type; `Weak`/`Unowned` wrappers select the reference kind
    pub ty: Type,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_override: bool,
    pub storage: Storage,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptDecl {
    pub index: Param,
    pub element: Type,
    #[serde(default)]
    pub is_final: bool,
    pub storage: Storage,
    #[serde(default)]
    pub span: Span,
}

/// How a property or subscript is implemented.
///
/// Accessor bodies see `self`, `newValue` in setters and `willSet`,
/// `oldValue` in `didSet`, and the subscript index under its parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Storage {
    Stored {
        #[serde(default)]
        initial: Option<Expr>,
    },
    Observed {
        #[serde(default)]
        initial: Option<Expr>,
        #[serde(default)]
        will_set: Option<Vec<Stmt>>,
        #[serde(default)]
        did_set: Option<Vec<Stmt>>,
    },
    Lazy { initial: Expr },
    Computed {
        get: Vec<Stmt>,
        #[serde(default)]
        set: Option<Vec<Stmt>>,
    },
    /// Addressors; `read` returns the pointer (and owner), `modify` the
    /// mutable pointer (and owner)
    Addressed {
        kind: AddressorKind,
        read: Vec<Stmt>,
        #[serde(default)]
        modify: Option<Vec<Stmt>>,
    },
}

/// How an addressor ties the returned memory to an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressorKind {
    /// No owner; the caller is responsible for lifetime
    Unsafe,
    /// Returns `(pointer, owner)`; the owner is released after the access
    NativeOwner,
    /// Like `NativeOwner`, but the owner is pinned for the access
    PinnedNativeOwner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: Type,
    pub initial: Expr,
    #[serde(default)]
    pub span: Span,
}

impl Storage {
    /// Physically stored in the instance (possibly with observers)
    pub fn has_backing_field(&self) -> bool {
        matches!(self, Storage::Stored { .. } | Storage::Observed { .. } | Storage::Lazy { .. })
    }

    pub fn is_plain_stored(&self) -> bool {
        matches!(self, Storage::Stored { .. })
    }

    pub fn is_settable(&self) -> bool {
        match self {
            Storage::Stored { .. } | Storage::Observed { .. } | Storage::Lazy { .. } => true,
            Storage::Computed { set, .. } => set.is_some(),
            Storage::Addressed { modify, .. } => modify.is_some(),
        }
    }
}

impl Module {
    pub fn from_json(text: &str) -> crate::Result<Module> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn function(&self, name: &str) -> Option<&FnDecl> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Name of the backing field of a lazy property
pub fn lazy_storage_name(property: &str) -> String {
    format!("$__lazy_storage_${property}")
}
