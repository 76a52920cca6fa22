//! Expression and statement nodes

use super::{Param, Span, Type};
use serde::{Deserialize, Serialize};

/// Typed expression. `ty` is the formal type the front end assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),

    /// Local binding or parameter, including `self`, `newValue`, `oldValue`
    Var(String),
    /// Module-level global variable
    Global(String),

    Tuple(Vec<Expr>),
    TupleElement { base: Box<Expr>, index: usize },
    /// Instance property of a struct, enum or class
    Member { base: Box<Expr>, name: String },
    /// Static property `Owner.name`
    StaticMember { owner: String, name: String },
    Subscript { base: Box<Expr>, index: Box<Expr> },

    /// Memberwise construction of `ty`; classes take one argument per stored
    /// property, base class properties first
    Construct { args: Vec<Expr> },
    EnumCase {
        case: String,
        payload: Option<Box<Expr>>,
    },

    Call { callee: Callee, args: Vec<Expr> },
    Closure(Box<ClosureExpr>),
    /// A named function used as a value
    FunctionRef(String),

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign { target: Box<Expr>, value: Box<Expr> },
    CompoundAssign {
        op: BinOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },

    Try { mode: TryMode, expr: Box<Expr> },

    /// Erase to the existential `ty`
    Erase(Box<Expr>),
    /// Class upcast to `ty`
    Upcast(Box<Expr>),
    /// Wrap in the optional `ty`
    InjectOptional(Box<Expr>),
    /// `nil` of optional type `ty`
    Nil,
    ForceUnwrap(Box<Expr>),
    /// Convert a function value to the function type `ty`
    FunctionConversion(Box<Expr>),
    /// Metatype value; `ty` is `Metatype(T)`
    Metatype,

    /// `&lvalue` passed to an `inout` parameter
    InOut(Box<Expr>),
    /// Raw pointer to the storage of an lvalue, as an `UnsafeMutablePointer`
    /// or `UnsafePointer`
    AddressOf(Box<Expr>),
    /// Class reference reinterpreted as `Builtin.NativeObject`
    NativeOwner(Box<Expr>),
}

/// Resolved call target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Callee {
    /// Free function by resolved name
    Function(String),
    /// Method of the base's nominal type; a metatype base calls a static method
    Method { base: Box<Expr>, name: String },
    /// Protocol requirement on an archetype or existential base
    Witness {
        base: Box<Expr>,
        protocol: String,
        requirement: String,
    },
    /// Call through a function value
    Value(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        !matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul)
    }

    /// Builtin name stem, completed with the operand width
    pub fn builtin_stem(&self) -> &'static str {
        match self {
            BinOp::Add => "sadd_with_overflow",
            BinOp::Sub => "ssub_with_overflow",
            BinOp::Mul => "smul_with_overflow",
            BinOp::Eq => "cmp_eq",
            BinOp::Ne => "cmp_ne",
            BinOp::Lt => "cmp_slt",
            BinOp::Le => "cmp_sle",
            BinOp::Gt => "cmp_sgt",
            BinOp::Ge => "cmp_sge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TryMode {
    /// `try`: propagate to the enclosing handler
    Plain,
    /// `try?`: produce `nil` on error
    Optional,
    /// `try!`: trap on error
    Forced,
}

/// Closure literal with its capture list already computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureExpr {
    /// Name of the function the closure body lowers to
    pub name: String,
    pub params: Vec<Param>,
    pub result: Type,
    #[serde(default)]
    pub throws: bool,
    #[serde(default = "default_escaping")]
    pub escaping: bool,
    #[serde(default)]
    pub captures: Vec<String>,
    pub body: Vec<Stmt>,
}

fn default_escaping() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Let { pattern: Pattern, init: Expr },
    Var { name: String, init: Expr },
    Expr(Expr),
    Return(Option<Expr>),
    Throw(Expr),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        #[serde(default)]
        else_body: Vec<Stmt>,
    },
    While { cond: Expr, body: Vec<Stmt> },
    /// `for pattern in sequence`, driven by `iterator`
    For {
        pattern: Pattern,
        sequence: Expr,
        iterator: IteratorInfo,
        body: Vec<Stmt>,
    },
    Do {
        body: Vec<Stmt>,
        catches: Vec<CatchClause>,
    },
}

/// Resolved iteration protocol for a `for` loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorInfo {
    /// `(sequence) -> Iterator`, consumes the sequence
    pub make_iterator: String,
    /// `(inout Iterator) -> Element?`
    pub next: String,
    pub iterator_ty: Type,
    pub element_ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Named(String),
    Wildcard,
    Tuple(Vec<Pattern>),
}

impl Pattern {
    /// True when no sub-pattern binds a name
    pub fn is_wildcard(&self) -> bool {
        match self {
            Pattern::Named(_) => false,
            Pattern::Wildcard => true,
            Pattern::Tuple(elems) => elems.iter().all(Pattern::is_wildcard),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    /// `None` matches any error
    #[serde(default)]
    pub ty: Option<Type>,
    #[serde(default)]
    pub binding: Option<String>,
    pub body: Vec<Stmt>,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type) -> Self {
        Expr {
            kind,
            ty,
            span: Span::default(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn int(value: i64) -> Self {
        Expr::new(ExprKind::IntLit(value), Type::Int)
    }

    pub fn int32(value: i64) -> Self {
        Expr::new(ExprKind::IntLit(value), Type::Int32)
    }

    pub fn bool(value: bool) -> Self {
        Expr::new(ExprKind::BoolLit(value), Type::Bool)
    }

    pub fn unit() -> Self {
        Expr::new(ExprKind::Tuple(Vec::new()), Type::unit())
    }

    pub fn var(name: impl Into<String>, ty: Type) -> Self {
        Expr::new(ExprKind::Var(name.into()), ty)
    }

    pub fn global(name: impl Into<String>, ty: Type) -> Self {
        Expr::new(ExprKind::Global(name.into()), ty)
    }

    pub fn member(base: Expr, name: impl Into<String>, ty: Type) -> Self {
        Expr::new(
            ExprKind::Member {
                base: Box::new(base),
                name: name.into(),
            },
            ty,
        )
    }

    pub fn subscript(base: Expr, index: Expr, ty: Type) -> Self {
        Expr::new(
            ExprKind::Subscript {
                base: Box::new(base),
                index: Box::new(index),
            },
            ty,
        )
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>, ty: Type) -> Self {
        Expr::new(
            ExprKind::Call {
                callee: Callee::Function(name.into()),
                args,
            },
            ty,
        )
    }

    pub fn method(base: Expr, name: impl Into<String>, args: Vec<Expr>, ty: Type) -> Self {
        Expr::new(
            ExprKind::Call {
                callee: Callee::Method {
                    base: Box::new(base),
                    name: name.into(),
                },
                args,
            },
            ty,
        )
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        let ty = if op.is_comparison() { Type::Bool } else { lhs.ty.clone() };
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        )
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Expr::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            Type::unit(),
        )
    }

    pub fn compound_assign(op: BinOp, target: Expr, value: Expr) -> Self {
        Expr::new(
            ExprKind::CompoundAssign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            Type::unit(),
        )
    }

    pub fn try_(mode: TryMode, expr: Expr) -> Self {
        let ty = match mode {
            TryMode::Optional => Type::optional(expr.ty.clone()),
            TryMode::Plain | TryMode::Forced => expr.ty.clone(),
        };
        Expr::new(
            ExprKind::Try {
                mode,
                expr: Box::new(expr),
            },
            ty,
        )
    }

    pub fn tuple(elems: Vec<Expr>) -> Self {
        let ty = Type::Tuple(elems.iter().map(|e| e.ty.clone()).collect());
        Expr::new(ExprKind::Tuple(elems), ty)
    }

    pub fn construct(ty: Type, args: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Construct { args }, ty)
    }

    pub fn enum_case(ty: Type, case: impl Into<String>, payload: Option<Expr>) -> Self {
        Expr::new(
            ExprKind::EnumCase {
                case: case.into(),
                payload: payload.map(Box::new),
            },
            ty,
        )
    }

    pub fn inout(lvalue: Expr) -> Self {
        let ty = lvalue.ty.clone();
        Expr::new(ExprKind::InOut(Box::new(lvalue)), ty)
    }

    pub fn erase(value: Expr, existential: Type) -> Self {
        Expr::new(ExprKind::Erase(Box::new(value)), existential)
    }

    pub fn some(value: Expr) -> Self {
        let ty = Type::optional(value.ty.clone());
        Expr::new(ExprKind::InjectOptional(Box::new(value)), ty)
    }

    /// True for expressions that only read, never call or mutate
    pub fn is_pure_read(&self) -> bool {
        match &self.kind {
            ExprKind::IntLit(_)
            | ExprKind::FloatLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::Var(_)
            | ExprKind::Metatype
            | ExprKind::Nil => true,
            ExprKind::TupleElement { base, .. } => base.is_pure_read(),
            ExprKind::Tuple(elems) => elems.iter().all(Expr::is_pure_read),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_optional_wraps_type() {
        let call = Expr::call("f", vec![], Type::Int);
        let expr = Expr::try_(TryMode::Optional, call);
        assert_eq!(expr.ty, Type::optional(Type::Int));
    }

    #[test]
    fn test_wildcard_pattern() {
        assert!(Pattern::Tuple(vec![Pattern::Wildcard, Pattern::Wildcard]).is_wildcard());
        assert!(!Pattern::Tuple(vec![Pattern::Named("a".into()), Pattern::Wildcard]).is_wildcard());
    }

    #[test]
    fn test_stmt_json_shape() {
        let json = r#"{"Return":{"kind":{"IntLit":3},"ty":"Int"}}"#;
        let stmt: Stmt = serde_json::from_str(json).unwrap();
        assert_eq!(stmt, Stmt::Return(Some(Expr::int(3))));
    }
}
