//! Formal types of the resolved declaration graph

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Formal (source-level) type.
///
/// The front end has already resolved every name: `Named` refers to a
/// struct, enum or class declared in the module, `Param` to a generic
/// parameter in scope, `Existential` to a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// 64-bit signed integer
    Int,
    /// 32-bit signed integer
    Int32,
    Bool,
    Double,
    /// Nominal struct, enum or class without generic arguments
    Named(String),
    /// Bound generic nominal type, e.g. `Pair<Int, T>`
    Generic { name: String, args: Vec<Type> },
    /// Generic parameter (archetype) or an associated type path like `Self.Element`
    Param(String),
    /// Protocol existential; `Error` is the boxed error existential
    Existential(String),
    /// Existential opened at a use site, only produced during lowering
    Opened(String),
    Optional(Box<Type>),
    /// `()` is the empty tuple
    Tuple(Vec<Type>),
    Function(Box<FunctionType>),
    Metatype(Box<Type>),
    RawPointer,
    UnsafePointer(Box<Type>),
    UnsafeMutablePointer(Box<Type>),
    NativeObject,
    ValueBuffer,
    /// Storage type of `weak var x: C?`; the payload is the optional type
    Weak(Box<Type>),
    /// Storage type of `unowned let x: C`
    Unowned(Box<Type>),
    /// Storage type of `unowned(unsafe) let x: C`
    UnownedUnsafe(Box<Type>),
    /// `@block_storage F`, only produced during lowering
    BlockStorage(Box<Type>),
    /// `{ var T }`, only produced during lowering
    Box(Box<Type>),
}

/// Function type as written in the declaration graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    pub params: Vec<FunctionParam>,
    pub result: Type,
    #[serde(default)]
    pub throws: bool,
    #[serde(default = "default_true")]
    pub escaping: bool,
    #[serde(default)]
    pub representation: Representation,
    #[serde(default)]
    pub abstraction: Abstraction,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionParam {
    pub ty: Type,
    #[serde(default)]
    pub convention: ParamConvention,
}

/// Source-level parameter passing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamConvention {
    /// Callee consumes the argument
    #[default]
    Owned,
    /// `__shared`: borrowed for the duration of the call
    Shared,
    InOut,
}

/// How a function value is represented at runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Representation {
    /// Context + function pointer
    #[default]
    Thick,
    /// Bare function pointer without context
    Thin,
    /// External callback ABI (block storage + invoke function)
    Block,
}

/// Calling-convention abstraction level of a function value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Abstraction {
    /// Substituted: loadable types passed directly
    #[default]
    Substituted,
    /// Maximally abstract: every parameter and result passed indirectly
    Opaque,
}

impl Type {
    pub fn unit() -> Type {
        Type::Tuple(Vec::new())
    }

    pub fn error() -> Type {
        Type::Existential("Error".to_string())
    }

    pub fn optional(inner: Type) -> Type {
        Type::Optional(Box::new(inner))
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Type::Tuple(elems) if elems.is_empty())
    }

    pub fn is_error_existential(&self) -> bool {
        matches!(self, Type::Existential(p) if p == "Error")
    }

    pub fn optional_payload(&self) -> Option<&Type> {
        match self {
            Type::Optional(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Name of the nominal declaration this type refers to, if any
    pub fn nominal_name(&self) -> Option<&str> {
        match self {
            Type::Named(name) | Type::Generic { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Replace generic parameters by their bindings
    pub fn substitute(&self, subs: &HashMap<String, Type>) -> Type {
        if subs.is_empty() {
            return self.clone();
        }
        let sub = |t: &Type| t.substitute(subs);
        match self {
            Type::Param(name) => subs.get(name).cloned().unwrap_or_else(|| self.clone()),
            Type::Generic { name, args } => Type::Generic {
                name: name.clone(),
                args: args.iter().map(sub).collect(),
            },
            Type::Optional(t) => Type::Optional(Box::new(sub(t))),
            Type::Tuple(elems) => Type::Tuple(elems.iter().map(sub).collect()),
            Type::Function(f) => Type::Function(Box::new(FunctionType {
                params: f
                    .params
                    .iter()
                    .map(|p| FunctionParam {
                        ty: sub(&p.ty),
                        convention: p.convention,
                    })
                    .collect(),
                result: sub(&f.result),
                ..(**f).clone()
            })),
            Type::Metatype(t) => Type::Metatype(Box::new(sub(t))),
            Type::UnsafePointer(t) => Type::UnsafePointer(Box::new(sub(t))),
            Type::UnsafeMutablePointer(t) => Type::UnsafeMutablePointer(Box::new(sub(t))),
            Type::Weak(t) => Type::Weak(Box::new(sub(t))),
            Type::Unowned(t) => Type::Unowned(Box::new(sub(t))),
            Type::UnownedUnsafe(t) => Type::UnownedUnsafe(Box::new(sub(t))),
            Type::BlockStorage(t) => Type::BlockStorage(Box::new(sub(t))),
            Type::Box(t) => Type::Box(Box::new(sub(t))),
            _ => self.clone(),
        }
    }

    /// Strip a reference-storage wrapper (`weak`, `unowned`) to get the value type
    pub fn referent(&self) -> &Type {
        match self {
            Type::Weak(t) | Type::Unowned(t) | Type::UnownedUnsafe(t) => t,
            _ => self,
        }
    }
}

impl FunctionType {
    pub fn new(params: Vec<Type>, result: Type) -> Self {
        FunctionType {
            params: params
                .into_iter()
                .map(|ty| FunctionParam {
                    ty,
                    convention: ParamConvention::Owned,
                })
                .collect(),
            result,
            throws: false,
            escaping: true,
            representation: Representation::Thick,
            abstraction: Abstraction::Substituted,
        }
    }

    /// Same signature ignoring escapability
    pub fn same_shape(&self, other: &FunctionType) -> bool {
        self.params == other.params
            && self.result == other.result
            && self.throws == other.throws
            && self.representation == other.representation
            && self.abstraction == other.abstraction
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "Int"),
            Type::Int32 => write!(f, "Int32"),
            Type::Bool => write!(f, "Bool"),
            Type::Double => write!(f, "Double"),
            Type::Named(name) => write!(f, "{name}"),
            Type::Generic { name, args } => {
                write!(f, "{name}<")?;
                write_list(f, args)?;
                write!(f, ">")
            }
            Type::Param(name) => write!(f, "{name}"),
            Type::Existential(proto) => write!(f, "{proto}"),
            Type::Opened(proto) => write!(f, "@opened(\"{proto}\") {proto}"),
            Type::Optional(inner) => write!(f, "Optional<{inner}>"),
            Type::Tuple(elems) => {
                write!(f, "(")?;
                write_list(f, elems)?;
                write!(f, ")")
            }
            Type::Function(func) => write!(f, "{func}"),
            Type::Metatype(inner) => write!(f, "@thick {inner}.Type"),
            Type::RawPointer => write!(f, "Builtin.RawPointer"),
            Type::UnsafePointer(inner) => write!(f, "UnsafePointer<{inner}>"),
            Type::UnsafeMutablePointer(inner) => write!(f, "UnsafeMutablePointer<{inner}>"),
            Type::NativeObject => write!(f, "Builtin.NativeObject"),
            Type::ValueBuffer => write!(f, "Builtin.UnsafeValueBuffer"),
            Type::Weak(inner) => write!(f, "@sil_weak {inner}"),
            Type::Unowned(inner) => write!(f, "@sil_unowned {inner}"),
            Type::UnownedUnsafe(inner) => write!(f, "@sil_unmanaged {inner}"),
            Type::BlockStorage(inner) => write!(f, "@block_storage {inner}"),
            Type::Box(inner) => write!(f, "{{ var {inner} }}"),
        }
    }
}

impl std::fmt::Display for FunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.representation {
            Representation::Thick => write!(f, "@callee_guaranteed ")?,
            Representation::Thin => write!(f, "@convention(thin) ")?,
            Representation::Block => write!(f, "@convention(block) ")?,
        }
        if !self.escaping {
            write!(f, "@noescape ")?;
        }
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let prefix = match (self.abstraction, param.convention) {
                (_, ParamConvention::InOut) => "@inout ",
                (Abstraction::Opaque, ParamConvention::Shared) => "@in_guaranteed ",
                (Abstraction::Opaque, ParamConvention::Owned) => "@in ",
                (Abstraction::Substituted, ParamConvention::Shared) => "@guaranteed ",
                (Abstraction::Substituted, ParamConvention::Owned) => "",
            };
            write!(f, "{prefix}{}", param.ty)?;
        }
        write!(f, ") -> ")?;
        if self.abstraction == Abstraction::Opaque {
            write!(f, "@out ")?;
        }
        if self.throws {
            write!(f, "({}, @error Error)", self.result)
        } else {
            write!(f, "{}", self.result)
        }
    }
}

fn write_list(f: &mut std::fmt::Formatter<'_>, types: &[Type]) -> std::fmt::Result {
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{ty}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_nested() {
        let ty = Type::Optional(Box::new(Type::Tuple(vec![Type::Int, Type::Named("C".into())])));
        assert_eq!(ty.to_string(), "Optional<(Int, C)>");
        assert_eq!(Type::unit().to_string(), "()");
    }

    #[test]
    fn test_substitute_reaches_function_params() {
        let mut subs = HashMap::new();
        subs.insert("T".to_string(), Type::Int);
        let ty = Type::Function(Box::new(FunctionType::new(
            vec![Type::Param("T".into())],
            Type::optional(Type::Param("T".into())),
        )));
        let substituted = ty.substitute(&subs);
        let func = substituted.as_function().unwrap();
        assert_eq!(func.params[0].ty, Type::Int);
        assert_eq!(func.result, Type::optional(Type::Int));
    }

    #[test]
    fn test_function_type_json_defaults() {
        let func: FunctionType =
            serde_json::from_str(r#"{"params":[{"ty":"Int"}],"result":"Bool"}"#).unwrap();
        assert!(func.escaping);
        assert!(!func.throws);
        assert_eq!(func.params[0].convention, ParamConvention::Owned);
        assert_eq!(func.representation, Representation::Thick);
    }
}
