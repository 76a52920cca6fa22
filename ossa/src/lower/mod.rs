//! Lowering of the declaration graph into ownership SSA
//!
//! Each function body is lowered by one [`FunctionLowering`], which owns the
//! instruction stream, the cleanup stack and the access tracker of that
//! function. Everything it reads from outside (type metadata, dispatch
//! tables, configuration) is shared and immutable, so independent bodies
//! can be lowered on different threads.
//!
//! Values produced while lowering an expression are [`Managed`]: an SSA
//! value plus the cleanup that ends its lifetime. Consuming a managed value
//! forwards its cleanup, so every owned value is destroyed exactly once on
//! every path, including error edges.

mod access;
mod accessor;
mod call;
mod cleanup;
mod closure;
mod errors;
mod expr;
mod global;
mod lvalue;
mod pattern;
mod stmt;
mod thunk;
mod witness;

pub use accessor::StorageDecl;
pub(crate) use global::token_type;

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::config::LoweringConfig;
use crate::error::{CompileError, Result};
use crate::mir::*;
use crate::tables::{TableSet, ThunkRequest};
use crate::types::names::AccessorKind;
use crate::types::{ArgConvention, OwnerKind, ResultConvention, TypeLowering};

use access::{AccessTracker, StorageClass};
use cleanup::{CleanupDepth, CleanupHandle, CleanupKind, CleanupStack};

/// Read-only state shared by every function lowering of a module
#[derive(Clone, Copy)]
pub struct LowerEnv<'a> {
    pub tl: &'a TypeLowering,
    pub tables: &'a TableSet,
    pub config: &'a LoweringConfig,
}

/// One unit of work for the driver: a function of the output module
#[derive(Debug, Clone)]
pub enum LoweringJob<'m> {
    Function(&'m FnDecl),
    Method {
        owner: &'m str,
        owner_kind: OwnerKind,
        decl: &'m FnDecl,
    },
    Accessor {
        storage: StorageDecl<'m>,
        kind: AccessorKind,
    },
    GlobalAddressor {
        global: String,
        ty: Type,
    },
    GlobalInit {
        global: String,
        ty: Type,
        initial: &'m Expr,
    },
    Thunk(ThunkRequest),
}

impl LoweringJob<'_> {
    /// Name of the function the job produces
    pub fn name(&self) -> String {
        use crate::types::names;
        match self {
            LoweringJob::Function(decl) => decl.name.clone(),
            LoweringJob::Method { owner, decl, .. } => names::method_name(owner, &decl.name),
            LoweringJob::Accessor { storage, kind } => names::accessor_name(storage.owner, storage.member, *kind),
            LoweringJob::GlobalAddressor { global, .. } => names::global_addressor(global),
            LoweringJob::GlobalInit { global, .. } => names::global_init_func(global),
            LoweringJob::Thunk(request) => request.name().to_string(),
        }
    }
}

/// Lower one job. The result holds the job's function first, followed by
/// the closures and thunks its body needed.
pub fn lower_job(env: &LowerEnv<'_>, job: &LoweringJob<'_>) -> Result<Vec<MirFunction>> {
    let name = job.name();
    let _span = tracing::trace_span!("lower_function", function = %name).entered();
    match job {
        LoweringJob::Function(decl) => lower_declared(env, name, decl, None),
        LoweringJob::Method {
            owner,
            owner_kind,
            decl,
        } => lower_declared(env, name, decl, Some((owner, *owner_kind))),
        LoweringJob::Accessor { storage, kind } => accessor::lower_accessor(env, storage, *kind),
        LoweringJob::GlobalAddressor { global, ty } => global::lower_addressor(env, global, ty),
        LoweringJob::GlobalInit { global, ty, initial } => global::lower_initializer(env, global, ty, initial),
        LoweringJob::Thunk(ThunkRequest::VTable {
            name,
            implementation,
            ty,
            ..
        }) => witness::lower_vtable_thunk(env, name, implementation, ty),
        LoweringJob::Thunk(ThunkRequest::Witness {
            name,
            conforming,
            target,
            ty,
            ..
        }) => witness::lower_witness_thunk(env, name, conforming, target, ty),
    }
}

fn lower_declared(
    env: &LowerEnv<'_>,
    name: String,
    decl: &FnDecl,
    owner: Option<(&str, OwnerKind)>,
) -> Result<Vec<MirFunction>> {
    let ty = env.tl.function_type(&name)?.clone();
    let mut fl = FunctionLowering::new(env, name, ty, decl.result.clone());
    fl.boxed_vars = closure::escaping_captures(&decl.body);
    let owner_params = owner.map(|(o, _)| env.tl.owner_generic_constraints(o)).unwrap_or_default();
    for param in owner_params.iter().chain(&decl.generic_params) {
        fl.constraints.insert(param.name.clone(), param.conforms_to.clone());
    }
    let mut names: Vec<&str> = decl.params.iter().map(|p| p.name.as_str()).collect();
    if owner.is_some() {
        names.push("self");
    }
    fl.bind_params(&names)?;
    fl.lower_body(&decl.body)?;
    fl.finish()
}

/// What a local name refers to
#[derive(Debug, Clone)]
pub(crate) enum Binding {
    /// Immutable value in a register, borrowed by uses
    Value { value: Value, ty: Type },
    /// Memory location
    Address {
        address: Value,
        ty: Type,
        kind: AddressKind,
        /// Owning box for boxed variables
        container: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressKind {
    Stack { mutable: bool },
    InOut,
    Box,
    CapturedInOut,
    /// `@in` or `@in_guaranteed` parameter
    Indirect,
}

impl AddressKind {
    pub(crate) fn is_mutable(&self) -> bool {
        match self {
            AddressKind::Stack { mutable } => *mutable,
            AddressKind::InOut | AddressKind::Box | AddressKind::CapturedInOut => true,
            AddressKind::Indirect => false,
        }
    }

    pub(crate) fn storage_class(&self) -> StorageClass {
        match self {
            AddressKind::Stack { .. } | AddressKind::Indirect => StorageClass::Stack,
            AddressKind::InOut => StorageClass::InOut,
            AddressKind::Box => StorageClass::Box,
            AddressKind::CapturedInOut => StorageClass::CapturedInOut,
        }
    }
}

/// An SSA value together with the cleanup that ends its lifetime.
///
/// Objects without a cleanup are trivial or borrowed. Addresses with a
/// cleanup are initialized temporaries this scope must destroy.
#[derive(Debug, Clone)]
pub(crate) struct Managed {
    pub(crate) value: Value,
    pub(crate) ty: Type,
    pub(crate) cleanup: Option<CleanupHandle>,
}

impl Managed {
    pub(crate) fn unmanaged(value: Value, ty: Type) -> Self {
        Managed {
            value,
            ty,
            cleanup: None,
        }
    }

    /// Take ownership away from the cleanup stack
    pub(crate) fn forward(self, fl: &mut FunctionLowering<'_>) -> Value {
        if let Some(handle) = self.cleanup {
            fl.forward_cleanup(handle);
        }
        self.value
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.cleanup.is_some()
    }
}

/// Where a thrown error goes
#[derive(Debug, Clone)]
pub(crate) struct ThrowDest {
    pub(crate) label: String,
    pub(crate) depth: CleanupDepth,
    pub(crate) used: bool,
}

/// Extra work done on `return` in synthesized bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReturnHook {
    /// Pinned addressors pin the owner they hand out
    PinOwner,
}

/// Lexical scope: bindings plus the cleanup depth to return to
#[derive(Debug)]
pub(crate) struct Scope {
    depth: CleanupDepth,
}

/// Lowering state of a single function
pub(crate) struct FunctionLowering<'a> {
    pub(crate) env: &'a LowerEnv<'a>,
    pub(crate) ctx: LoweringContext,
    cleanups: CleanupStack,
    pub(crate) access: AccessTracker,
    scopes: Vec<HashMap<String, Binding>>,
    pub(crate) name: String,
    pub(crate) ty: LoweredFunctionType,
    /// Entry arguments after the indirect result
    pub(crate) params: Vec<Value>,
    pub(crate) indirect_result: Option<Value>,
    /// Generic or protocol-abstracted code
    pub(crate) generic: bool,
    pub(crate) throw_dests: Vec<ThrowDest>,
    /// Closures and thunks produced while lowering this body
    pub(crate) aux: Vec<MirFunction>,
    /// Variables captured by escaping closures; they live in boxes
    pub(crate) boxed_vars: HashSet<String>,
    /// Member whose own accessors are being lowered; it reaches storage
    /// directly instead of recursing into itself
    pub(crate) storage_owner: Option<(String, String)>,
    /// Protocols each generic parameter in scope conforms to
    pub(crate) constraints: HashMap<String, Vec<String>>,
    pub(crate) return_hook: Option<ReturnHook>,
    pub(crate) is_thunk: bool,
    pub(crate) result_ty: Type,
    /// Stored class properties resolve to their storage, bypassing dynamic
    /// dispatch; set while forming the operand of an address-of
    pub(crate) direct_storage: bool,
}

impl<'a> FunctionLowering<'a> {
    pub(crate) fn new(env: &'a LowerEnv<'a>, name: String, ty: LoweredFunctionType, result_ty: Type) -> Self {
        let generic = !ty.sig.generic_params.is_empty() || ty.convention == FnConvention::WitnessMethod;
        let mut fl = FunctionLowering {
            env,
            ctx: LoweringContext::new(),
            cleanups: CleanupStack::default(),
            access: AccessTracker::default(),
            scopes: vec![HashMap::new()],
            name,
            ty,
            params: Vec::new(),
            indirect_result: None,
            generic,
            throw_dests: Vec::new(),
            aux: Vec::new(),
            boxed_vars: HashSet::new(),
            storage_owner: None,
            constraints: HashMap::new(),
            return_hook: None,
            is_thunk: false,
            result_ty,
            direct_storage: false,
        };
        fl.create_entry_args();
        if fl.ty.sig.throws {
            let label = fl.ctx.fresh_label();
            fl.throw_dests.push(ThrowDest {
                label,
                depth: CleanupDepth(0),
                used: false,
            });
        }
        fl
    }

    fn create_entry_args(&mut self) {
        let sig = self.ty.sig.clone();
        if sig.result.convention == ResultConvention::Indirect {
            let out = self.new_address(&sig.result.ty);
            self.ctx.add_block_arg(out);
            self.indirect_result = Some(out);
        }
        for param in &sig.params {
            let value = match param.convention {
                c if c.is_indirect() => self.new_address(&param.ty),
                ArgConvention::Trivial => self.new_value(object_type(&param.ty), Ownership::Trivial),
                ArgConvention::Owned => self.new_value(object_type(&param.ty), Ownership::Owned),
                _ => self.new_value(object_type(&param.ty), Ownership::Guaranteed),
            };
            self.ctx.add_block_arg(value);
            self.params.push(value);
        }
    }

    /// Bind the entry arguments to source names and register the cleanups
    /// for parameters this function owns
    pub(crate) fn bind_params(&mut self, names: &[&str]) -> Result<()> {
        if names.len() != self.params.len() {
            return Err(CompileError::lowering(
                format!(
                    "{} takes {} parameters but {} names were bound",
                    self.name,
                    self.params.len(),
                    names.len()
                ),
                Span::default(),
            ));
        }
        let params = self.ty.sig.params.clone();
        for ((name, value), param) in names.iter().zip(self.params.clone()).zip(params) {
            let binding = match param.convention {
                ArgConvention::Trivial | ArgConvention::Guaranteed => Binding::Value {
                    value,
                    ty: param.ty.clone(),
                },
                ArgConvention::Owned => {
                    self.push_cleanup(CleanupKind::DestroyValue(value));
                    Binding::Value {
                        value,
                        ty: param.ty.clone(),
                    }
                }
                ArgConvention::In | ArgConvention::InGuaranteed => {
                    if param.convention == ArgConvention::In {
                        self.push_cleanup(CleanupKind::DestroyAddr(value));
                    }
                    Binding::Address {
                        address: value,
                        ty: param.ty.clone(),
                        kind: AddressKind::Indirect,
                        container: None,
                    }
                }
                ArgConvention::InOut => Binding::Address {
                    address: value,
                    ty: param.ty.clone(),
                    kind: AddressKind::InOut,
                    container: None,
                },
                ArgConvention::InoutAliasable => Binding::Address {
                    address: value,
                    ty: param.ty.clone(),
                    kind: AddressKind::CapturedInOut,
                    container: None,
                },
            };
            self.bind(*name, binding);
        }
        Ok(())
    }

    pub(crate) fn tl(&self) -> &'a TypeLowering {
        self.env.tl
    }

    // ------------------------------------------------------------------
    // Scopes and bindings
    // ------------------------------------------------------------------

    pub(crate) fn bind(&mut self, name: impl Into<String>, binding: Binding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), binding);
        }
    }

    pub(crate) fn lookup(&self, name: &str, span: Span) -> Result<Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
            .ok_or_else(|| CompileError::lowering(format!("unresolved name {name}"), span))
    }

    pub(crate) fn push_scope(&mut self) -> Scope {
        self.scopes.push(HashMap::new());
        Scope {
            depth: self.cleanup_depth(),
        }
    }

    pub(crate) fn pop_scope(&mut self, scope: Scope) -> Result<()> {
        self.pop_cleanups(scope.depth)?;
        self.scopes.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub(crate) fn emit(&mut self, inst: MirInst) {
        self.ctx.push_inst(inst);
    }

    pub(crate) fn new_value(&mut self, ty: MirType, ownership: Ownership) -> Value {
        self.ctx.fresh_value(ty, ownership)
    }

    /// Fresh +1 object of formal type `ty`
    pub(crate) fn new_object(&mut self, ty: &Type) -> Value {
        let ownership = self.owned_kind(ty);
        self.ctx.fresh_value(object_type(ty), ownership)
    }

    pub(crate) fn new_address(&mut self, ty: &Type) -> Value {
        self.ctx.fresh_value(MirType::Address(ty.clone()), Ownership::Address)
    }

    /// Ownership of a +1 value of type `ty`
    pub(crate) fn owned_kind(&self, ty: &Type) -> Ownership {
        if self.tl().is_trivial(ty) {
            Ownership::Trivial
        } else {
            Ownership::Owned
        }
    }

    pub(crate) fn is_address(&self, value: Value) -> bool {
        self.ctx.value_type(value).is_address()
    }

    pub(crate) fn is_trivial(&self, ty: &Type) -> bool {
        self.tl().is_trivial(ty)
    }

    pub(crate) fn is_address_only(&self, ty: &Type) -> bool {
        self.tl().is_address_only(ty)
    }

    /// Give a +1 value (object or initialized temporary) a cleanup
    pub(crate) fn manage(&mut self, value: Value, ty: Type) -> Managed {
        let cleanup = if self.is_address(value) {
            Some(self.push_cleanup(CleanupKind::DestroyAddr(value)))
        } else if self.ctx.ownership(value) == Ownership::Owned {
            Some(self.push_cleanup(CleanupKind::DestroyValue(value)))
        } else {
            None
        };
        Managed { value, ty, cleanup }
    }

    pub(crate) fn copy_value(&mut self, operand: Value, ty: &Type) -> Value {
        if self.is_trivial(ty) || self.ctx.ownership(operand) == Ownership::Trivial {
            return operand;
        }
        let dest = self.new_object(ty);
        self.emit(MirInst::CopyValue { dest, operand });
        dest
    }

    pub(crate) fn destroy_value(&mut self, operand: Value) {
        if self.ctx.ownership(operand) == Ownership::Owned {
            self.emit(MirInst::DestroyValue { operand });
        }
    }

    /// `alloc_stack` whose deallocation is registered as a cleanup
    pub(crate) fn alloc_temp(&mut self, ty: &Type) -> Value {
        let dest = self.new_address(ty);
        self.emit(MirInst::AllocStack { dest });
        self.push_cleanup(CleanupKind::DeallocStack(dest));
        dest
    }

    pub(crate) fn load_copy(&mut self, address: Value, ty: &Type) -> Value {
        let qualifier = if self.is_trivial(ty) {
            LoadQualifier::Trivial
        } else {
            LoadQualifier::Copy
        };
        let dest = self.new_object(ty);
        self.emit(MirInst::Load {
            dest,
            address,
            qualifier,
        });
        dest
    }

    pub(crate) fn load_take(&mut self, address: Value, ty: &Type) -> Value {
        let qualifier = if self.is_trivial(ty) {
            LoadQualifier::Trivial
        } else {
            LoadQualifier::Take
        };
        let dest = self.new_object(ty);
        self.emit(MirInst::Load {
            dest,
            address,
            qualifier,
        });
        dest
    }

    /// `load_borrow` ended by the innermost cleanup scope
    pub(crate) fn load_borrow(&mut self, address: Value, ty: &Type) -> Value {
        if self.is_trivial(ty) {
            return self.load_copy(address, ty);
        }
        let dest = self.new_value(object_type(ty), Ownership::Guaranteed);
        self.emit(MirInst::LoadBorrow { dest, address });
        self.push_cleanup(CleanupKind::EndBorrow {
            borrowed: dest,
            original: address,
        });
        dest
    }

    pub(crate) fn store_init(&mut self, value: Value, address: Value, ty: &Type) {
        let qualifier = if self.is_trivial(ty) {
            StoreQualifier::Trivial
        } else {
            StoreQualifier::Init
        };
        self.emit(MirInst::Store {
            value,
            address,
            qualifier,
        });
    }

    pub(crate) fn store_assign(&mut self, value: Value, address: Value, ty: &Type) {
        let qualifier = if self.is_trivial(ty) {
            StoreQualifier::Trivial
        } else {
            StoreQualifier::Assign
        };
        self.emit(MirInst::Store {
            value,
            address,
            qualifier,
        });
    }

    pub(crate) fn copy_addr(&mut self, src: Value, dest: Value, take: bool, initialize: bool) {
        self.emit(MirInst::CopyAddr {
            src,
            dest,
            take,
            initialize,
        });
    }

    pub(crate) fn integer_literal(&mut self, ty: Type, value: i64) -> Value {
        let dest = self.new_value(MirType::Object(ty), Ownership::Trivial);
        self.emit(MirInst::IntegerLiteral { dest, value });
        dest
    }

    pub(crate) fn unit(&mut self) -> Value {
        let dest = self.new_value(MirType::Object(Type::unit()), Ownership::Trivial);
        self.emit(MirInst::Tuple {
            dest,
            elements: Vec::new(),
        });
        dest
    }

    pub(crate) fn function_ref(&mut self, function: &str) -> Result<Value> {
        let ty = self.tl().function_type(function)?.clone();
        Ok(self.function_ref_typed(function, ty))
    }

    pub(crate) fn function_ref_typed(&mut self, function: &str, ty: LoweredFunctionType) -> Value {
        let dest = self.new_value(MirType::Function(Box::new(ty)), Ownership::Trivial);
        self.emit(MirInst::FunctionRef {
            dest,
            function: function.to_string(),
        });
        dest
    }

    // ------------------------------------------------------------------
    // Function bodies
    // ------------------------------------------------------------------

    pub(crate) fn lower_body(&mut self, body: &[Stmt]) -> Result<()> {
        self.emit_stmts(body)?;
        if !self.ctx.is_terminated() {
            if self.result_ty.is_unit() {
                let unit = self.unit();
                self.emit_return(unit)?;
            } else {
                return Err(CompileError::lowering(
                    format!("missing return in {} returning {}", self.name, self.result_ty),
                    Span::default(),
                ));
            }
        }
        Ok(())
    }

    /// Run every cleanup of the function, then return `value`
    pub(crate) fn emit_return(&mut self, value: Value) -> Result<()> {
        self.emit_branch_cleanups(CleanupDepth(0))?;
        self.ctx.finish_block(Terminator::Return(value));
        Ok(())
    }

    /// Branch a thrown error to the innermost handler, running the cleanups
    /// of every scope it leaves
    pub(crate) fn emit_throw_edge(&mut self, error: Value, span: Span) -> Result<()> {
        let dest = self.throw_dests.last_mut().ok_or_else(|| {
            CompileError::lowering("error is not handled because the enclosing function does not throw", span)
        })?;
        dest.used = true;
        let (label, depth) = (dest.label.clone(), dest.depth);
        self.emit_branch_cleanups(depth)?;
        self.ctx.finish_block(Terminator::Br {
            target: label,
            args: vec![error],
        });
        Ok(())
    }

    /// Finish the function: emit its throw block and hand over the result
    pub(crate) fn finish(mut self) -> Result<Vec<MirFunction>> {
        if self.ty.sig.throws {
            if let Some(dest) = self.throw_dests.first().cloned() {
                if dest.used {
                    let error = self.new_value(MirType::Object(Type::error()), Ownership::Owned);
                    self.ctx.start_block(dest.label, vec![error]);
                    self.ctx.finish_block(Terminator::Throw(error));
                }
            }
        }
        if self.access.open_count() != 0 && !self.ctx.is_terminated() {
            return Err(CompileError::lowering(
                format!("{} left {} access scopes open", self.name, self.access.open_count()),
                Span::default(),
            ));
        }
        let mut params = Vec::new();
        params.extend(self.indirect_result);
        params.extend(self.params.iter().copied());
        let (blocks, values) = self.ctx.finish();
        let function = MirFunction {
            name: self.name,
            ty: self.ty,
            params,
            blocks,
            values,
            is_thunk: self.is_thunk,
        };
        let mut functions = vec![function];
        functions.extend(self.aux);
        Ok(functions)
    }
}

/// Object type of a formal type; function types keep their formal form
pub(crate) fn object_type(ty: &Type) -> MirType {
    MirType::Object(ty.clone())
}

/// Bind generic parameters of `pattern` by matching it against `actual`
pub(crate) fn unify(pattern: &Type, actual: &Type, subs: &mut HashMap<String, Type>) {
    match (pattern, actual) {
        (Type::Param(name), _) => {
            subs.entry(name.clone()).or_insert_with(|| actual.clone());
        }
        (Type::Generic { args: a, .. }, Type::Generic { args: b, .. }) => {
            for (p, q) in a.iter().zip(b) {
                unify(p, q, subs);
            }
        }
        (Type::Tuple(a), Type::Tuple(b)) => {
            for (p, q) in a.iter().zip(b) {
                unify(p, q, subs);
            }
        }
        (Type::Optional(p), Type::Optional(q))
        | (Type::Metatype(p), Type::Metatype(q))
        | (Type::UnsafePointer(p), Type::UnsafePointer(q))
        | (Type::UnsafeMutablePointer(p), Type::UnsafeMutablePointer(q)) => unify(p, q, subs),
        (Type::Function(f), Type::Function(g)) => {
            for (p, q) in f.params.iter().zip(&g.params) {
                unify(&p.ty, &q.ty, subs);
            }
            unify(&f.result, &g.result, subs);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unify_nested() {
        let mut subs = HashMap::new();
        let pattern = Type::Tuple(vec![Type::Param("T".into()), Type::optional(Type::Param("U".into()))]);
        let actual = Type::Tuple(vec![Type::Int, Type::optional(Type::Bool)]);
        unify(&pattern, &actual, &mut subs);
        assert_eq!(subs.get("T"), Some(&Type::Int));
        assert_eq!(subs.get("U"), Some(&Type::Bool));
    }

    #[test]
    fn test_unify_keeps_first_binding() {
        let mut subs = HashMap::new();
        let t = Type::Param("T".into());
        unify(&t, &Type::Int, &mut subs);
        unify(&t, &Type::Bool, &mut subs);
        assert_eq!(subs["T"], Type::Int);
    }

    #[test]
    fn test_address_kind_mutability() {
        assert!(AddressKind::InOut.is_mutable());
        assert!(!AddressKind::Indirect.is_mutable());
        assert!(!AddressKind::Stack { mutable: false }.is_mutable());
        assert_eq!(AddressKind::Box.storage_class(), StorageClass::Box);
    }
}
