//! Runtime values for the interpreter

use std::fmt;

/// Index of a memory cell (stack slot, global, box or object storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub usize);

/// Index of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// One projection step from a cell's root value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proj {
    /// Struct or class field
    Field(usize),
    /// Tuple element
    Elem(usize),
    /// Enum or existential payload
    Payload,
}

/// Address of a (possibly projected) memory location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    pub cell: CellId,
    pub path: Vec<Proj>,
}

impl Addr {
    pub fn root(cell: CellId) -> Self {
        Addr { cell, path: Vec::new() }
    }

    pub fn project(&self, proj: Proj) -> Self {
        let mut path = self.path.clone();
        path.push(proj);
        Addr { cell: self.cell, path }
    }

    /// Whether the two locations share storage (one contains the other)
    pub fn overlaps(&self, other: &Addr) -> bool {
        self.cell == other.cell && self.path.iter().zip(&other.path).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.cell.0)?;
        for proj in &self.path {
            match proj {
                Proj::Field(i) => write!(f, ".{i}")?,
                Proj::Elem(i) => write!(f, ".{i}")?,
                Proj::Payload => write!(f, ".payload")?,
            }
        }
        Ok(())
    }
}

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum RtValue {
    /// Storage that has not been initialized, or whose value was taken
    Uninit,
    Int(i64),
    Float(f64),
    Bool(bool),
    Tuple(Vec<RtValue>),
    Struct { name: String, fields: Vec<RtValue> },
    Enum {
        owner: String,
        case: String,
        payload: Option<Box<RtValue>>,
    },
    /// Inline existential container
    Existential { concrete: String, payload: Box<RtValue> },
    /// Strong reference
    Ref(ObjectId),
    /// Contents of weak storage
    Weak(Option<ObjectId>),
    /// Contents of `unowned` storage
    Unowned(ObjectId),
    /// Contents of `unowned(unsafe)` storage
    Unmanaged(ObjectId),
    /// Address or raw pointer
    Address(Addr),
    /// Function value, thick when a context object is attached
    Function { name: String, context: Option<ObjectId> },
    /// Witness method resolved at the call from the `self` argument
    Witness { protocol: String, requirement: String },
    Metatype(String),
    /// Initialized block storage: invoke function plus captured closure
    BlockHeader { invoke: String, storage: Addr },
}

impl RtValue {
    pub fn unit() -> Self {
        RtValue::Tuple(Vec::new())
    }

    pub fn some(payload: RtValue) -> Self {
        RtValue::Enum {
            owner: "Optional".to_string(),
            case: "some".to_string(),
            payload: Some(Box::new(payload)),
        }
    }

    pub fn none() -> Self {
        RtValue::Enum {
            owner: "Optional".to_string(),
            case: "none".to_string(),
            payload: None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            RtValue::Bool(b) => *b,
            RtValue::Int(n) => *n != 0,
            _ => false,
        }
    }

    /// Get type name for error messages
    pub fn type_name(&self) -> &str {
        match self {
            RtValue::Uninit => "uninitialized",
            RtValue::Int(_) => "Int",
            RtValue::Float(_) => "Double",
            RtValue::Bool(_) => "Bool",
            RtValue::Tuple(_) => "tuple",
            RtValue::Struct { name, .. } => name,
            RtValue::Enum { owner, .. } => owner,
            RtValue::Existential { .. } => "existential",
            RtValue::Ref(_) => "reference",
            RtValue::Weak(_) => "weak reference",
            RtValue::Unowned(_) => "unowned reference",
            RtValue::Unmanaged(_) => "unmanaged reference",
            RtValue::Address(_) => "address",
            RtValue::Function { .. } => "function",
            RtValue::Witness { .. } => "witness method",
            RtValue::Metatype(_) => "metatype",
            RtValue::BlockHeader { .. } => "block storage",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RtValue::Int(n) => Some(*n),
            RtValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            RtValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<&Addr> {
        match self {
            RtValue::Address(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            RtValue::Ref(id) | RtValue::Unowned(id) | RtValue::Unmanaged(id) => Some(*id),
            _ => None,
        }
    }

    /// Strong references owned by this value, in any nesting
    pub fn strong_refs(&self, out: &mut Vec<ObjectId>) {
        match self {
            RtValue::Ref(id) => out.push(*id),
            RtValue::Function { context: Some(id), .. } => out.push(*id),
            RtValue::Tuple(elems) | RtValue::Struct { fields: elems, .. } => {
                elems.iter().for_each(|e| e.strong_refs(out));
            }
            RtValue::Enum { payload: Some(p), .. } => p.strong_refs(out),
            RtValue::Existential { payload, .. } => payload.strong_refs(out),
            _ => {}
        }
    }
}

impl fmt::Display for RtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtValue::Uninit => write!(f, "<uninit>"),
            RtValue::Int(n) => write!(f, "{n}"),
            RtValue::Float(x) => write!(f, "{x}"),
            RtValue::Bool(b) => write!(f, "{b}"),
            RtValue::Tuple(elems) => {
                write!(f, "(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            RtValue::Struct { name, fields } => {
                write!(f, "{name} {{ ")?;
                for (i, v) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, " }}")
            }
            RtValue::Enum { owner, case, payload } => {
                write!(f, "{owner}.{case}")?;
                if let Some(p) = payload {
                    write!(f, "({p})")?;
                }
                Ok(())
            }
            RtValue::Existential { concrete, payload } => write!(f, "{concrete} as any({payload})"),
            RtValue::Ref(id) => write!(f, "{id}"),
            RtValue::Weak(Some(id)) => write!(f, "weak {id}"),
            RtValue::Weak(None) => write!(f, "weak nil"),
            RtValue::Unowned(id) => write!(f, "unowned {id}"),
            RtValue::Unmanaged(id) => write!(f, "unmanaged {id}"),
            RtValue::Address(addr) => write!(f, "&{addr}"),
            RtValue::Function { name, context: None } => write!(f, "@{name}"),
            RtValue::Function { name, context: Some(id) } => write!(f, "@{name}[{id}]"),
            RtValue::Witness { protocol, requirement } => write!(f, "#{protocol}.{requirement}"),
            RtValue::Metatype(name) => write!(f, "{name}.Type"),
            RtValue::BlockHeader { invoke, .. } => write!(f, "block @{invoke}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(format!("{}", RtValue::Int(42)), "42");
        assert_eq!(format!("{}", RtValue::unit()), "()");
        assert_eq!(format!("{}", RtValue::some(RtValue::Bool(true))), "Optional.some(true)");
        assert_eq!(format!("{}", RtValue::none()), "Optional.none");
    }

    #[test]
    fn test_overlap() {
        let base = Addr::root(CellId(1));
        let field = base.project(Proj::Field(0));
        let other = base.project(Proj::Field(1));
        assert!(base.overlaps(&field));
        assert!(field.overlaps(&base));
        assert!(!field.overlaps(&other));
        assert!(!field.overlaps(&Addr::root(CellId(2))));
    }

    #[test]
    fn test_strong_refs_nested() {
        let value = RtValue::Tuple(vec![
            RtValue::Ref(ObjectId(1)),
            RtValue::some(RtValue::Ref(ObjectId(2))),
            RtValue::Weak(Some(ObjectId(3))),
            RtValue::Function {
                name: "f".to_string(),
                context: Some(ObjectId(4)),
            },
        ]);
        let mut refs = Vec::new();
        value.strong_refs(&mut refs);
        assert_eq!(refs, vec![ObjectId(1), ObjectId(2), ObjectId(4)]);
    }
}
