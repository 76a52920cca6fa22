//! IR evaluator
//!
//! Executes lowered functions block by block. Reference counts are explicit
//! in the heap, `begin_access` scopes with dynamic (or unknown) enforcement
//! are checked against every other open access, and global initializers run
//! under `builtin "once"`.

use super::error::{InterpResult, RuntimeError, TrapKind};
use super::heap::{Heap, HeapStats, LeakReport, ObjectKind};
use super::once::{OnceClaim, OnceFlag};
use super::value::{Addr, CellId, ObjectId, Proj, RtValue};
use crate::ast::Type;
use crate::mir::*;
use crate::types::names;
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum nesting of IR calls
const MAX_CALL_DEPTH: usize = 10_000;

/// Stack growth parameters for deep recursion
const STACK_RED_ZONE: usize = 128 * 1024; // 128KB remaining triggers growth
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024; // Grow by 4MB each time

/// How a call finished
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Return(RtValue),
    Throw(RtValue),
}

#[derive(Debug, Clone)]
struct ActiveAccess {
    id: u64,
    addr: Addr,
    kind: AccessKind,
}

/// Per-call state
struct Frame<'f> {
    func: &'f MirFunction,
    values: Vec<Option<RtValue>>,
    /// `begin_access` results registered for dynamic checking
    accesses: HashMap<Value, u64>,
}

impl<'f> Frame<'f> {
    fn new(func: &'f MirFunction) -> Self {
        Frame {
            func,
            values: vec![None; func.values.len()],
            accesses: HashMap::new(),
        }
    }

    fn get(&self, value: Value) -> InterpResult<RtValue> {
        self.values
            .get(value.0 as usize)
            .and_then(|v| v.clone())
            .ok_or_else(|| {
                RuntimeError::new(
                    TrapKind::TypeError,
                    format!("{}: {value} used before definition", self.func.name),
                )
            })
    }

    fn set(&mut self, value: Value, rt: RtValue) -> InterpResult<()> {
        let slot = self.values.get_mut(value.0 as usize).ok_or_else(|| {
            RuntimeError::new(TrapKind::TypeError, format!("{}: no value {value}", self.func.name))
        })?;
        *slot = Some(rt);
        Ok(())
    }

    fn ty(&self, value: Value) -> Option<&MirType> {
        self.func.value_info(value).map(|info| &info.ty)
    }

    fn address(&self, value: Value) -> InterpResult<Addr> {
        match self.get(value)? {
            RtValue::Address(addr) => Ok(addr),
            other => Err(RuntimeError::type_error("address", other.type_name())),
        }
    }

    fn object(&self, value: Value) -> InterpResult<ObjectId> {
        let rt = self.get(value)?;
        rt.as_object()
            .ok_or_else(|| RuntimeError::type_error("reference", rt.type_name()))
    }
}

/// Nominal name used to shape storage of type `ty`
fn storage_hint(ty: Option<&MirType>) -> Option<String> {
    let formal = ty?.formal()?;
    match formal {
        Type::Box(inner) | Type::BlockStorage(inner) => inner.nominal_name().map(str::to_string),
        other => other.nominal_name().map(str::to_string),
    }
}

/// Name witness tables are keyed by for a concrete type
fn conformance_name(ty: &Type) -> Option<String> {
    match ty {
        Type::Int => Some("Int".to_string()),
        Type::Int32 => Some("Int32".to_string()),
        Type::Bool => Some("Bool".to_string()),
        Type::Double => Some("Double".to_string()),
        other => other.nominal_name().map(str::to_string),
    }
}

/// The interpreter
pub struct Interpreter<'m> {
    module: &'m MirModule,
    functions: HashMap<&'m str, &'m MirFunction>,
    heap: Heap,
    globals: HashMap<String, CellId>,
    once: HashMap<CellId, Arc<OnceFlag>>,
    accesses: Vec<ActiveAccess>,
    next_access: u64,
    depth: usize,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m MirModule) -> Self {
        let functions = module.functions.iter().map(|f| (f.name.as_str(), f)).collect();
        let mut heap = Heap::new();
        let globals = module
            .globals
            .iter()
            .map(|g| {
                let hint = conformance_name(&g.ty);
                (g.name.clone(), heap.alloc_cell(RtValue::Uninit, hint))
            })
            .collect();
        Interpreter {
            module,
            functions,
            heap,
            globals,
            once: HashMap::new(),
            accesses: Vec::new(),
            next_access: 0,
            depth: 0,
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Objects and cells still live, ignoring storage reachable from globals
    pub fn leak_report(&self) -> LeakReport {
        let mut roots: Vec<CellId> = self.globals.values().copied().collect();
        roots.sort();
        self.heap.leak_report(&roots)
    }

    /// Current value of a global, without running its initializer
    pub fn global(&self, name: &str) -> InterpResult<RtValue> {
        let cell = self.globals.get(name).ok_or_else(|| RuntimeError::undefined_global(name))?;
        self.heap.read(&Addr::root(*cell))
    }

    /// Allocate a stack cell holding `value`, for passing indirect arguments
    pub fn alloc(&mut self, value: RtValue, ty: &Type) -> RtValue {
        let cell = self.heap.alloc_cell(value, conformance_name(ty));
        RtValue::Address(Addr::root(cell))
    }

    pub fn load(&self, address: &RtValue) -> InterpResult<RtValue> {
        let addr = address
            .as_address()
            .ok_or_else(|| RuntimeError::type_error("address", address.type_name()))?;
        self.heap.read(addr)
    }

    /// Free a cell made by `alloc`, returning its final contents
    pub fn free(&mut self, address: &RtValue) -> InterpResult<RtValue> {
        let addr = address
            .as_address()
            .ok_or_else(|| RuntimeError::type_error("address", address.type_name()))?;
        self.heap.free_cell(addr.cell)
    }

    /// Release a value the caller owns
    pub fn destroy(&mut self, value: RtValue) -> InterpResult<()> {
        self.heap.release_value(value)
    }

    /// Whether a heap object is still allocated
    pub fn is_alive(&self, value: &RtValue) -> bool {
        value.as_object().is_some_and(|id| self.heap.is_alive(id))
    }

    /// Call a function by name with already-lowered arguments
    pub fn call(&mut self, name: &str, args: Vec<RtValue>) -> InterpResult<Outcome> {
        let func = self.function(name)?;
        self.execute(func, args)
    }

    /// Run a function taking no formal arguments. An indirect result is
    /// returned by value; an error escaping the function is a trap.
    pub fn run(&mut self, name: &str) -> InterpResult<RtValue> {
        let func = self.function(name)?;
        let _span = tracing::debug_span!("run", function = %name).entered();
        let outcome = if func.ty.sig.has_indirect_result() {
            let slot = self.alloc(RtValue::Uninit, &func.ty.sig.result.ty);
            let outcome = self.execute(func, vec![slot.clone()])?;
            let value = self.free(&slot)?;
            match outcome {
                Outcome::Return(_) => Outcome::Return(value),
                thrown => thrown,
            }
        } else {
            self.execute(func, Vec::new())?
        };
        match outcome {
            Outcome::Return(value) => {
                tracing::debug!(function = %name, result = %value, "finished");
                Ok(value)
            }
            Outcome::Throw(error) => Err(RuntimeError::new(
                TrapKind::UncaughtError,
                format!("{name} threw {}", self.describe_error(&error)),
            )),
        }
    }

    fn function(&self, name: &str) -> InterpResult<&'m MirFunction> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::undefined_function(name))
    }

    fn describe_error(&self, error: &RtValue) -> String {
        match error.as_object().and_then(|id| self.heap.object(id).ok()) {
            Some(object) => object.kind.to_string(),
            None => error.to_string(),
        }
    }

    fn execute(&mut self, func: &'m MirFunction, args: Vec<RtValue>) -> InterpResult<Outcome> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::stack_overflow());
        }
        self.depth += 1;
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.run_body(func, args));
        self.depth -= 1;
        result
    }

    fn run_body(&mut self, func: &'m MirFunction, args: Vec<RtValue>) -> InterpResult<Outcome> {
        tracing::trace!(function = %func.name, args = args.len(), "call");
        if args.len() != func.params.len() {
            return Err(RuntimeError::arity_mismatch(&func.name, func.params.len(), args.len()));
        }
        let mut frame = Frame::new(func);
        for (param, arg) in func.params.iter().zip(args) {
            frame.set(*param, arg)?;
        }
        let mut block = func
            .blocks
            .first()
            .ok_or_else(|| RuntimeError::new(TrapKind::TypeError, format!("{} has no body", func.name)))?;

        loop {
            for inst in &block.instructions {
                self.step(&mut frame, inst)?;
            }
            let (target, block_args) = match &block.terminator {
                Terminator::Return(value) => return Ok(Outcome::Return(frame.get(*value)?)),
                Terminator::Throw(value) => return Ok(Outcome::Throw(frame.get(*value)?)),
                Terminator::Br { target, args } => {
                    let values = args.iter().map(|a| frame.get(*a)).collect::<InterpResult<Vec<_>>>()?;
                    (target, values)
                }
                Terminator::CondBr {
                    cond,
                    then_target,
                    else_target,
                } => {
                    let target = if frame.get(*cond)?.is_truthy() {
                        then_target
                    } else {
                        else_target
                    };
                    (target, Vec::new())
                }
                Terminator::SwitchEnum {
                    operand,
                    cases,
                    default,
                } => {
                    let value = frame.get(*operand)?;
                    let (case, payload) = match value {
                        RtValue::Enum { case, payload, .. } => (case, payload),
                        other => return Err(RuntimeError::type_error("enum", other.type_name())),
                    };
                    match cases.iter().find(|(c, _)| c.name == case) {
                        Some((_, label)) => {
                            let target = lookup_block(func, label)?;
                            let args = match payload {
                                Some(p) if target.args.len() == 1 => vec![*p],
                                _ => Vec::new(),
                            };
                            (label, args)
                        }
                        None => (switch_default(func, default, &case)?, Vec::new()),
                    }
                }
                Terminator::SwitchEnumAddr {
                    address,
                    cases,
                    default,
                } => {
                    let case = match self.heap.read(&frame.address(*address)?)? {
                        RtValue::Enum { case, .. } => case,
                        other => return Err(RuntimeError::type_error("enum", other.type_name())),
                    };
                    match cases.iter().find(|(c, _)| c.name == case) {
                        Some((_, label)) => (label, Vec::new()),
                        None => (switch_default(func, default, &case)?, Vec::new()),
                    }
                }
                Terminator::TryApply {
                    callee,
                    args,
                    normal,
                    error,
                } => {
                    let callee = frame.get(*callee)?;
                    let args = args.iter().map(|a| frame.get(*a)).collect::<InterpResult<Vec<_>>>()?;
                    match self.call_value(&callee, args)? {
                        Outcome::Return(value) => (normal, vec![value]),
                        Outcome::Throw(err) => (error, vec![err]),
                    }
                }
                Terminator::CheckedCastBranch {
                    operand,
                    ty,
                    success,
                    failure,
                } => match self.checked_cast(&frame.get(*operand)?, ty)? {
                    Some(cast) => (success, vec![cast]),
                    None => (failure, Vec::new()),
                },
                Terminator::Unreachable => {
                    return Err(RuntimeError::new(
                        TrapKind::Unreachable,
                        format!("{}: unreachable executed", func.name),
                    ))
                }
            };
            block = lookup_block(func, target)?;
            if block.args.len() != block_args.len() {
                return Err(RuntimeError::arity_mismatch(&block.label, block.args.len(), block_args.len()));
            }
            for (arg, value) in block.args.iter().zip(block_args) {
                frame.set(*arg, value)?;
            }
        }
    }

    /// Success value of casting an error to `ty`, borrowed from the operand
    fn checked_cast(&self, value: &RtValue, ty: &Type) -> InterpResult<Option<RtValue>> {
        if ty.is_error_existential() {
            return Ok(Some(value.clone()));
        }
        let Some(target) = conformance_name(ty) else {
            return Ok(None);
        };
        let Some(id) = value.as_object() else {
            return Err(RuntimeError::type_error("error box", value.type_name()));
        };
        let object = self.heap.object(id)?;
        match &object.kind {
            ObjectKind::ErrorBox { concrete } if *concrete == target => self.heap.read(&Addr::root(object.cell)).map(Some),
            ObjectKind::Instance { class } if *class == target => Ok(Some(value.clone())),
            _ => Ok(None),
        }
    }

    /// Apply a function value
    fn call_value(&mut self, callee: &RtValue, mut args: Vec<RtValue>) -> InterpResult<Outcome> {
        match callee {
            RtValue::Function { name, context } => {
                let func = self.function(name)?;
                if let Some(id) = context {
                    let cell = self.heap.object(*id)?.cell;
                    match self.heap.read(&Addr::root(cell))? {
                        RtValue::Tuple(captures) => args.extend(captures),
                        other => return Err(RuntimeError::type_error("closure context", other.type_name())),
                    }
                }
                self.execute(func, args)
            }
            RtValue::Witness { protocol, requirement } => {
                let self_arg = args
                    .last()
                    .ok_or_else(|| RuntimeError::arity_mismatch(requirement, 1, 0))?;
                let conforming = self.runtime_type_name(self_arg)?;
                let thunk = self.witness_thunk(&conforming, protocol, requirement)?;
                let func = self.function(&thunk)?;
                self.execute(func, args)
            }
            RtValue::Ref(id) => {
                let object = self.heap.object(*id)?;
                let ObjectKind::Block { invoke } = &object.kind else {
                    return Err(RuntimeError::type_error("function", "object reference"));
                };
                let func = self.function(invoke)?;
                args.insert(0, RtValue::Address(Addr::root(object.cell)));
                self.execute(func, args)
            }
            other => Err(RuntimeError::type_error("function", other.type_name())),
        }
    }

    fn witness_thunk(&self, conforming: &str, protocol: &str, requirement: &str) -> InterpResult<String> {
        self.module
            .tables
            .witness_table_named(conforming, protocol)
            .and_then(|table| table.entry(requirement))
            .map(|entry| entry.thunk.clone())
            .ok_or_else(|| RuntimeError::dispatch(format!("{conforming}: {protocol}.{requirement}")))
    }

    /// Dynamic type of a value, looking through addresses and boxes
    fn runtime_type_name(&self, value: &RtValue) -> InterpResult<String> {
        let value = match value {
            RtValue::Address(addr) => self.heap.read(addr)?,
            other => other.clone(),
        };
        let name = match &value {
            RtValue::Int(_) => "Int".to_string(),
            RtValue::Bool(_) => "Bool".to_string(),
            RtValue::Float(_) => "Double".to_string(),
            RtValue::Struct { name, .. } => name.clone(),
            RtValue::Enum { owner, .. } => owner.clone(),
            RtValue::Existential { concrete, .. } => concrete.clone(),
            RtValue::Metatype(name) => name.clone(),
            RtValue::Ref(id) => match &self.heap.object(*id)?.kind {
                ObjectKind::Instance { class } => class.clone(),
                ObjectKind::ErrorBox { concrete } => concrete.clone(),
                other => return Err(RuntimeError::dispatch(format!("witness lookup on {other}"))),
            },
            other => return Err(RuntimeError::type_error("conforming value", other.type_name())),
        };
        if name.is_empty() {
            return Err(RuntimeError::dispatch("witness lookup on a value of unknown type"));
        }
        Ok(name)
    }

    fn class_of(&self, value: &RtValue) -> InterpResult<String> {
        match value {
            RtValue::Metatype(name) => Ok(name.clone()),
            RtValue::Ref(id) => match &self.heap.object(*id)?.kind {
                ObjectKind::Instance { class } => Ok(class.clone()),
                other => Err(RuntimeError::type_error("class instance", &other.to_string())),
            },
            other => Err(RuntimeError::type_error("class instance", other.type_name())),
        }
    }

    fn step(&mut self, frame: &mut Frame<'m>, inst: &MirInst) -> InterpResult<()> {
        use MirInst::*;
        match inst {
            IntegerLiteral { dest, value } => {
                let rt = match frame.ty(*dest).and_then(MirType::formal) {
                    Some(Type::Bool) => RtValue::Bool(*value != 0),
                    _ => RtValue::Int(*value),
                };
                frame.set(*dest, rt)
            }
            FloatLiteral { dest, value } => frame.set(*dest, RtValue::Float(*value)),
            FunctionRef { dest, function } => frame.set(
                *dest,
                RtValue::Function {
                    name: function.clone(),
                    context: None,
                },
            ),
            ClassMethod {
                dest,
                operand,
                selector,
            } => {
                let class = self.class_of(&frame.get(*operand)?)?;
                let vtable = self
                    .module
                    .tables
                    .vtable(&class)
                    .ok_or_else(|| RuntimeError::dispatch(format!("class {class} (no vtable)")))?;
                let entry = vtable
                    .entry(selector)
                    .or_else(|| vtable.latest_for_key(names::selector_key(selector)))
                    .ok_or_else(|| RuntimeError::dispatch(format!("{class}: {selector}")))?;
                frame.set(
                    *dest,
                    RtValue::Function {
                        name: entry.implementation.clone(),
                        context: None,
                    },
                )
            }
            WitnessMethod {
                dest,
                lookup,
                protocol,
                requirement,
            } => {
                let resolved = match lookup {
                    Type::Param(_) | Type::Opened(_) | Type::Existential(_) => RtValue::Witness {
                        protocol: protocol.clone(),
                        requirement: requirement.clone(),
                    },
                    concrete => {
                        let thunk = self
                            .module
                            .tables
                            .witness_table(concrete, protocol)
                            .and_then(|table| table.entry(requirement))
                            .map(|entry| entry.thunk.clone())
                            .ok_or_else(|| RuntimeError::dispatch(format!("{concrete}: {protocol}.{requirement}")))?;
                        RtValue::Function {
                            name: thunk,
                            context: None,
                        }
                    }
                };
                frame.set(*dest, resolved)
            }
            Apply { dest, callee, args } => {
                let callee = frame.get(*callee)?;
                let args = args.iter().map(|a| frame.get(*a)).collect::<InterpResult<Vec<_>>>()?;
                match self.call_value(&callee, args)? {
                    Outcome::Return(value) => frame.set(*dest, value),
                    Outcome::Throw(error) => Err(RuntimeError::new(
                        TrapKind::UncaughtError,
                        format!("non-throwing apply of {callee} threw {}", self.describe_error(&error)),
                    )),
                }
            }
            PartialApply {
                dest,
                callee,
                args,
                on_stack,
            } => {
                let name = match frame.get(*callee)? {
                    RtValue::Function { name, context: None } => name,
                    other => return Err(RuntimeError::type_error("thin function", other.type_name())),
                };
                let captures = args.iter().map(|a| frame.get(*a)).collect::<InterpResult<Vec<_>>>()?;
                let context = self.heap.alloc_object(
                    ObjectKind::Context { on_stack: *on_stack },
                    RtValue::Tuple(captures),
                    None,
                );
                frame.set(
                    *dest,
                    RtValue::Function {
                        name,
                        context: Some(context),
                    },
                )
            }
            ThinToThickFunction { dest, operand }
            | ConvertFunction { dest, operand }
            | Upcast { dest, operand }
            | UncheckedRefCast { dest, operand }
            | BeginBorrow { dest, operand }
            | ThinFunctionToPointer { dest, operand }
            | PointerToThinFunction { dest, operand } => {
                let value = frame.get(*operand)?;
                frame.set(*dest, value)
            }
            Builtin { dest, name, args } => {
                let args = args.iter().map(|a| frame.get(*a)).collect::<InterpResult<Vec<_>>>()?;
                let result = self.builtin(name, args)?;
                frame.set(*dest, result)
            }
            Metatype { dest } => {
                let name = match frame.ty(*dest).and_then(MirType::formal) {
                    Some(Type::Metatype(inner)) => inner.to_string(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                frame.set(*dest, RtValue::Metatype(name))
            }

            AllocStack { dest } => {
                let cell = self.heap.alloc_cell(RtValue::Uninit, storage_hint(frame.ty(*dest)));
                frame.set(*dest, RtValue::Address(Addr::root(cell)))
            }
            DeallocStack { operand } => match frame.get(*operand)? {
                RtValue::Address(addr) if addr.path.is_empty() => self.heap.free_cell(addr.cell).map(drop),
                RtValue::Function {
                    context: Some(id), ..
                } => self.heap.release_value(RtValue::Ref(id)),
                other => Err(RuntimeError::type_error("stack allocation", other.type_name())),
            },
            AllocBox { dest } => {
                let id = self
                    .heap
                    .alloc_object(ObjectKind::Box, RtValue::Uninit, storage_hint(frame.ty(*dest)));
                frame.set(*dest, RtValue::Ref(id))
            }
            ProjectBox { dest, operand } | ProjectExistentialBox { dest, operand } => {
                let cell = self.heap.object(frame.object(*operand)?)?.cell;
                frame.set(*dest, RtValue::Address(Addr::root(cell)))
            }
            AllocRef { dest } => {
                let class = storage_hint(frame.ty(*dest)).unwrap_or_default();
                let id = self.heap.alloc_object(
                    ObjectKind::Instance { class: class.clone() },
                    RtValue::Struct {
                        name: class.clone(),
                        fields: Vec::new(),
                    },
                    Some(class),
                );
                frame.set(*dest, RtValue::Ref(id))
            }
            AllocValueBuffer { dest, buffer } => {
                let buffer = frame.address(*buffer)?;
                let cell = self.heap.alloc_cell(RtValue::Uninit, storage_hint(frame.ty(*dest)));
                let addr = Addr::root(cell);
                self.heap.write(&buffer, RtValue::Address(addr.clone()))?;
                frame.set(*dest, RtValue::Address(addr))
            }
            ProjectValueBuffer { dest, buffer } => {
                let buffer = frame.address(*buffer)?;
                match self.heap.read(&buffer)? {
                    RtValue::Address(addr) => frame.set(*dest, RtValue::Address(addr)),
                    other => Err(RuntimeError::type_error("allocated value buffer", other.type_name())),
                }
            }
            DeallocValueBuffer { buffer, .. } => {
                let buffer = frame.address(*buffer)?;
                match self.heap.write(&buffer, RtValue::Uninit)? {
                    RtValue::Address(addr) => self.heap.free_cell(addr.cell).map(drop),
                    other => Err(RuntimeError::type_error("allocated value buffer", other.type_name())),
                }
            }
            GlobalAddr { dest, global } => {
                let cell = self
                    .globals
                    .get(global)
                    .ok_or_else(|| RuntimeError::undefined_global(global))?;
                frame.set(*dest, RtValue::Address(Addr::root(*cell)))
            }

            Load {
                dest,
                address,
                qualifier,
            } => {
                let addr = frame.address(*address)?;
                let value = match qualifier {
                    LoadQualifier::Take => self.heap.take(&addr)?,
                    LoadQualifier::Copy | LoadQualifier::Trivial => {
                        let value = self.read_initialized(&addr)?;
                        if *qualifier == LoadQualifier::Copy {
                            self.heap.retain_value(&value)?;
                        }
                        value
                    }
                };
                frame.set(*dest, value)
            }
            LoadBorrow { dest, address } => {
                let value = self.read_initialized(&frame.address(*address)?)?;
                frame.set(*dest, value)
            }
            Store {
                value,
                address,
                qualifier,
            } => {
                let value = frame.get(*value)?;
                let old = self.heap.write(&frame.address(*address)?, value)?;
                if *qualifier == StoreQualifier::Assign {
                    self.heap.release_value(old)?;
                }
                Ok(())
            }
            CopyAddr {
                src,
                dest,
                take,
                initialize,
            } => {
                let src = frame.address(*src)?;
                let value = if *take {
                    self.heap.take(&src)?
                } else {
                    let value = self.read_initialized(&src)?;
                    self.heap.retain_value(&value)?;
                    value
                };
                let old = self.heap.write(&frame.address(*dest)?, value)?;
                if !initialize {
                    self.heap.release_value(old)?;
                }
                Ok(())
            }
            DestroyAddr { address } => {
                let value = self.heap.take(&frame.address(*address)?)?;
                self.heap.release_value(value)
            }
            LoadWeak { dest, address, take } => {
                let addr = frame.address(*address)?;
                let stored = if *take {
                    self.heap.take(&addr)?
                } else {
                    self.read_initialized(&addr)?
                };
                let value = match stored {
                    RtValue::Weak(Some(id)) if self.heap.is_alive(id) => {
                        self.heap.retain(id)?;
                        RtValue::some(RtValue::Ref(id))
                    }
                    RtValue::Weak(_) => RtValue::none(),
                    other => return Err(RuntimeError::type_error("weak reference", other.type_name())),
                };
                frame.set(*dest, value)
            }
            StoreWeak { value, address, .. } => {
                let weak = match frame.get(*value)? {
                    RtValue::Enum { payload: Some(p), .. } => RtValue::Weak(p.as_object()),
                    RtValue::Enum { payload: None, .. } => RtValue::Weak(None),
                    other => return Err(RuntimeError::type_error("optional reference", other.type_name())),
                };
                self.heap.write(&frame.address(*address)?, weak).map(drop)
            }
            RefToUnowned { dest, operand } => {
                let id = frame.object(*operand)?;
                frame.set(*dest, RtValue::Unowned(id))
            }
            StrongCopyUnowned { dest, operand } => {
                let id = frame.object(*operand)?;
                if !self.heap.is_alive(id) {
                    return Err(RuntimeError::new(
                        TrapKind::InvalidMemory,
                        format!("attempted to read an unowned reference but {id} was already deallocated"),
                    ));
                }
                self.heap.retain(id)?;
                frame.set(*dest, RtValue::Ref(id))
            }
            RefToUnmanaged { dest, operand } => {
                let id = frame.object(*operand)?;
                frame.set(*dest, RtValue::Unmanaged(id))
            }
            UnmanagedToRef { dest, operand } => {
                let id = frame.object(*operand)?;
                frame.set(*dest, RtValue::Ref(id))
            }

            EndBorrow { .. } => Ok(()),
            CopyValue { dest, operand } => {
                let value = frame.get(*operand)?;
                self.heap.retain_value(&value)?;
                frame.set(*dest, value)
            }
            DestroyValue { operand } => {
                let value = frame.get(*operand)?;
                self.heap.release_value(value)
            }

            BeginAccess {
                dest,
                address,
                kind,
                enforcement,
            } => {
                let addr = frame.address(*address)?;
                if matches!(enforcement, Enforcement::Dynamic | Enforcement::Unknown) {
                    let id = self.begin_dynamic_access(&addr, *kind)?;
                    frame.accesses.insert(*dest, id);
                }
                frame.set(*dest, RtValue::Address(addr))
            }
            EndAccess { access } => {
                if let Some(id) = frame.accesses.remove(access) {
                    self.accesses.retain(|a| a.id != id);
                }
                Ok(())
            }

            Struct { dest, fields } => {
                let name = storage_hint(frame.ty(*dest)).unwrap_or_default();
                let fields = fields.iter().map(|f| frame.get(*f)).collect::<InterpResult<Vec<_>>>()?;
                frame.set(*dest, RtValue::Struct { name, fields })
            }
            StructExtract { dest, operand, field } => match frame.get(*operand)? {
                RtValue::Struct { mut fields, .. } if field.index < fields.len() => {
                    frame.set(*dest, fields.swap_remove(field.index))
                }
                other => Err(RuntimeError::type_error(&field.to_string(), other.type_name())),
            },
            StructElementAddr { dest, address, field } => {
                let addr = frame.address(*address)?.project(Proj::Field(field.index));
                frame.set(*dest, RtValue::Address(addr))
            }
            Tuple { dest, elements } => {
                let elems = elements.iter().map(|e| frame.get(*e)).collect::<InterpResult<Vec<_>>>()?;
                frame.set(*dest, RtValue::Tuple(elems))
            }
            TupleExtract { dest, operand, index } => match frame.get(*operand)? {
                RtValue::Tuple(mut elems) if *index < elems.len() => frame.set(*dest, elems.swap_remove(*index)),
                other => Err(RuntimeError::type_error("tuple", other.type_name())),
            },
            TupleElementAddr { dest, address, index } => {
                let addr = frame.address(*address)?.project(Proj::Elem(*index));
                frame.set(*dest, RtValue::Address(addr))
            }
            RefElementAddr { dest, operand, field } => {
                let cell = self.heap.object(frame.object(*operand)?)?.cell;
                frame.set(*dest, RtValue::Address(Addr::root(cell).project(Proj::Field(field.index))))
            }

            Enum { dest, case, payload } => {
                let payload = payload.map(|p| frame.get(p)).transpose()?.map(Box::new);
                frame.set(
                    *dest,
                    RtValue::Enum {
                        owner: case.owner.clone(),
                        case: case.name.clone(),
                        payload,
                    },
                )
            }
            InitEnumDataAddr { dest, address, .. } | UncheckedTakeEnumDataAddr { dest, address, .. } => {
                let addr = frame.address(*address)?.project(Proj::Payload);
                frame.set(*dest, RtValue::Address(addr))
            }
            InjectEnumAddr { address, case } => {
                self.heap.inject_case(&frame.address(*address)?, &case.owner, &case.name)
            }

            InitExistentialAddr {
                dest,
                address,
                concrete,
            } => {
                let addr = frame.address(*address)?;
                let existential = RtValue::Existential {
                    concrete: conformance_name(concrete).unwrap_or_else(|| concrete.to_string()),
                    payload: Box::new(RtValue::Uninit),
                };
                self.heap.write(&addr, existential)?;
                frame.set(*dest, RtValue::Address(addr.project(Proj::Payload)))
            }
            OpenExistentialAddr { dest, address, .. } => {
                let addr = frame.address(*address)?;
                match self.heap.read(&addr)? {
                    RtValue::Existential { .. } => frame.set(*dest, RtValue::Address(addr.project(Proj::Payload))),
                    other => Err(RuntimeError::type_error("existential", other.type_name())),
                }
            }
            AllocExistentialBox { dest, concrete } => {
                let name = conformance_name(concrete).unwrap_or_else(|| concrete.to_string());
                let id = self.heap.alloc_object(
                    ObjectKind::ErrorBox {
                        concrete: name.clone(),
                    },
                    RtValue::Uninit,
                    Some(name),
                );
                frame.set(*dest, RtValue::Ref(id))
            }

            PointerToAddress { dest, pointer } => {
                let addr = frame.address(*pointer)?;
                frame.set(*dest, RtValue::Address(addr))
            }
            AddressToPointer { dest, address } => {
                let addr = frame.address(*address)?;
                frame.set(*dest, RtValue::Address(addr))
            }

            StrongPin { dest, operand } => {
                let id = frame.object(*operand)?;
                let object = self.heap.object_mut(id)?;
                let pinned = if object.pinned {
                    RtValue::none()
                } else {
                    object.pinned = true;
                    self.heap.retain(id)?;
                    RtValue::some(RtValue::Ref(id))
                };
                frame.set(*dest, pinned)
            }
            StrongUnpin { operand } => match frame.get(*operand)? {
                RtValue::Enum { payload: Some(p), .. } => {
                    let id = p
                        .as_object()
                        .ok_or_else(|| RuntimeError::type_error("pinned reference", p.type_name()))?;
                    self.heap.object_mut(id)?.pinned = false;
                    self.heap.release_value(RtValue::Ref(id))
                }
                RtValue::Enum { payload: None, .. } => Ok(()),
                other => Err(RuntimeError::type_error("optional pin token", other.type_name())),
            },

            ProjectBlockStorage { dest, storage } => {
                let addr = frame.address(*storage)?;
                frame.set(*dest, RtValue::Address(addr))
            }
            InitBlockStorageHeader { dest, storage, invoke } => {
                let storage = frame.address(*storage)?;
                let invoke = match frame.get(*invoke)? {
                    RtValue::Function { name, .. } => name,
                    other => return Err(RuntimeError::type_error("invoke function", other.type_name())),
                };
                frame.set(*dest, RtValue::BlockHeader { invoke, storage })
            }
            CopyBlock { dest, operand } => {
                let block = match frame.get(*operand)? {
                    RtValue::BlockHeader { invoke, storage } => {
                        let closure = self.read_initialized(&storage)?;
                        self.heap.retain_value(&closure)?;
                        let id = self.heap.alloc_object(ObjectKind::Block { invoke }, closure, None);
                        RtValue::Ref(id)
                    }
                    existing @ RtValue::Ref(_) => {
                        self.heap.retain_value(&existing)?;
                        existing
                    }
                    other => return Err(RuntimeError::type_error("block", other.type_name())),
                };
                frame.set(*dest, block)
            }

            CondFail { operand, message } => {
                if frame.get(*operand)?.is_truthy() {
                    return Err(RuntimeError::condition_failed(message));
                }
                Ok(())
            }
        }
    }

    fn read_initialized(&self, addr: &Addr) -> InterpResult<RtValue> {
        match self.heap.read(addr)? {
            RtValue::Uninit => Err(RuntimeError::invalid_memory(format!("load from uninitialized {addr}"))),
            value => Ok(value),
        }
    }

    fn begin_dynamic_access(&mut self, addr: &Addr, kind: AccessKind) -> InterpResult<u64> {
        if let Some(existing) = self
            .accesses
            .iter()
            .find(|a| a.addr.overlaps(addr) && (a.kind.is_mutating() || kind.is_mutating()))
        {
            tracing::debug!(address = %addr, existing = %existing.kind, requested = %kind, "exclusivity violation");
            return Err(RuntimeError::exclusivity(existing.kind, kind));
        }
        let id = self.next_access;
        self.next_access += 1;
        self.accesses.push(ActiveAccess {
            id,
            addr: addr.clone(),
            kind,
        });
        Ok(id)
    }

    fn builtin(&mut self, name: &str, args: Vec<RtValue>) -> InterpResult<RtValue> {
        match name {
            "once" => {
                let [token, init] = <[RtValue; 2]>::try_from(args)
                    .map_err(|args| RuntimeError::arity_mismatch(name, 2, args.len()))?;
                let token = token
                    .as_address()
                    .ok_or_else(|| RuntimeError::type_error("once token", token.type_name()))?
                    .cell;
                self.run_once(token, &init)?;
                Ok(RtValue::unit())
            }
            "unexpectedError" => Err(RuntimeError::new(
                TrapKind::UnexpectedError,
                format!(
                    "'try!' expression unexpectedly raised an error: {}",
                    args.first().map(|e| self.describe_error(e)).unwrap_or_default()
                ),
            )),
            "unexpectedNil" => Err(RuntimeError::new(
                TrapKind::UnexpectedNil,
                "unexpectedly found nil while unwrapping an Optional value",
            )),
            _ => {
                let (op, width) = name
                    .rsplit_once('_')
                    .ok_or_else(|| RuntimeError::undefined_function(name))?;
                let [lhs, rhs] = <[RtValue; 2]>::try_from(args)
                    .map_err(|args| RuntimeError::arity_mismatch(name, 2, args.len()))?;
                match width {
                    "FPIEEE64" => float_builtin(name, op, &lhs, &rhs),
                    "Int64" | "Int32" | "Int1" => int_builtin(name, op, width, &lhs, &rhs),
                    _ => Err(RuntimeError::undefined_function(name)),
                }
            }
        }
    }

    fn run_once(&mut self, token: CellId, init: &RtValue) -> InterpResult<()> {
        let flag = Arc::clone(self.once.entry(token).or_default());
        match flag.claim() {
            OnceClaim::Done => Ok(()),
            // The interpreter is single threaded, so a running initializer
            // is always further up our own stack.
            OnceClaim::InProgress => Err(RuntimeError::new(
                TrapKind::RecursiveInitialization,
                format!("global initializer {init} re-entered itself"),
            )),
            OnceClaim::Run => {
                tracing::trace!(initializer = %init, "running global initializer");
                match self.call_value(init, Vec::new()) {
                    Ok(_) => {
                        flag.complete();
                        Ok(())
                    }
                    Err(err) => {
                        flag.abandon();
                        Err(err)
                    }
                }
            }
        }
    }
}

fn lookup_block<'f>(func: &'f MirFunction, label: &str) -> InterpResult<&'f BasicBlock> {
    func.block(label).ok_or_else(|| {
        RuntimeError::new(TrapKind::TypeError, format!("{}: no block {label}", func.name))
    })
}

fn switch_default<'a>(func: &MirFunction, default: &'a Option<String>, case: &str) -> InterpResult<&'a String> {
    default.as_ref().ok_or_else(|| {
        RuntimeError::new(
            TrapKind::TypeError,
            format!("{}: switch has no destination for case {case}", func.name),
        )
    })
}

fn int_builtin(name: &str, op: &str, width: &str, lhs: &RtValue, rhs: &RtValue) -> InterpResult<RtValue> {
    let (a, b) = match (lhs.as_int(), rhs.as_int()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(RuntimeError::type_error("integer operands", lhs.type_name())),
    };
    let compare = |result: bool| Ok(RtValue::Bool(result));
    match op {
        "cmp_eq" => return compare(a == b),
        "cmp_ne" => return compare(a != b),
        "cmp_slt" => return compare(a < b),
        "cmp_sle" => return compare(a <= b),
        "cmp_sgt" => return compare(a > b),
        "cmp_sge" => return compare(a >= b),
        _ => {}
    }
    let (result, overflow) = match (op, width) {
        ("sadd_with_overflow", "Int64") => a.overflowing_add(b),
        ("ssub_with_overflow", "Int64") => a.overflowing_sub(b),
        ("smul_with_overflow", "Int64") => a.overflowing_mul(b),
        ("sadd_with_overflow", "Int32") => widen((a as i32).overflowing_add(b as i32)),
        ("ssub_with_overflow", "Int32") => widen((a as i32).overflowing_sub(b as i32)),
        ("smul_with_overflow", "Int32") => widen((a as i32).overflowing_mul(b as i32)),
        _ => return Err(RuntimeError::undefined_function(name)),
    };
    Ok(RtValue::Tuple(vec![RtValue::Int(result), RtValue::Bool(overflow)]))
}

fn widen((value, overflow): (i32, bool)) -> (i64, bool) {
    (i64::from(value), overflow)
}

fn float_builtin(name: &str, op: &str, lhs: &RtValue, rhs: &RtValue) -> InterpResult<RtValue> {
    let (a, b) = match (lhs.as_float(), rhs.as_float()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(RuntimeError::type_error("Double operands", lhs.type_name())),
    };
    let value = match op {
        "fadd" => RtValue::Float(a + b),
        "fsub" => RtValue::Float(a - b),
        "fmul" => RtValue::Float(a * b),
        "fcmp_oeq" => RtValue::Bool(a == b),
        "fcmp_une" => RtValue::Bool(a != b),
        "fcmp_olt" => RtValue::Bool(a < b),
        "fcmp_ole" => RtValue::Bool(a <= b),
        "fcmp_ogt" => RtValue::Bool(a > b),
        "fcmp_oge" => RtValue::Bool(a >= b),
        _ => return Err(RuntimeError::undefined_function(name)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::TableSet;
    use crate::types::{LoweredResult, LoweredSignature, ResultConvention};

    fn signature(result: Type) -> LoweredFunctionType {
        LoweredFunctionType::new(
            FnConvention::Thin,
            LoweredSignature {
                generic_params: Vec::new(),
                params: Vec::new(),
                result: LoweredResult {
                    ty: result,
                    convention: ResultConvention::Unowned,
                },
                throws: false,
            },
        )
    }

    /// Single-block function over the given value types
    fn function(name: &str, values: Vec<MirType>, instructions: Vec<MirInst>, ret: u32) -> MirFunction {
        MirFunction {
            name: name.to_string(),
            ty: signature(Type::Int),
            params: Vec::new(),
            blocks: vec![BasicBlock {
                label: "bb0".to_string(),
                args: Vec::new(),
                instructions,
                terminator: Terminator::Return(Value(ret)),
            }],
            values: values
                .into_iter()
                .map(|ty| ValueInfo {
                    ty,
                    ownership: Ownership::Trivial,
                })
                .collect(),
            is_thunk: false,
        }
    }

    fn module(functions: Vec<MirFunction>, globals: Vec<MirGlobal>) -> MirModule {
        MirModule {
            name: "test".to_string(),
            globals,
            functions,
            tables: Arc::new(TableSet::default()),
        }
    }

    fn int() -> MirType {
        MirType::Object(Type::Int)
    }

    fn addr() -> MirType {
        MirType::Address(Type::Int)
    }

    #[test]
    fn test_overflow_traps() {
        let f = function(
            "f",
            vec![int(), int(), MirType::Object(Type::Tuple(vec![Type::Int, Type::Bool])), int(), MirType::Object(Type::Bool)],
            vec![
                MirInst::IntegerLiteral {
                    dest: Value(0),
                    value: i64::MAX,
                },
                MirInst::IntegerLiteral { dest: Value(1), value: 1 },
                MirInst::Builtin {
                    dest: Value(2),
                    name: "sadd_with_overflow_Int64".to_string(),
                    args: vec![Value(0), Value(1)],
                },
                MirInst::TupleExtract {
                    dest: Value(3),
                    operand: Value(2),
                    index: 0,
                },
                MirInst::TupleExtract {
                    dest: Value(4),
                    operand: Value(2),
                    index: 1,
                },
                MirInst::CondFail {
                    operand: Value(4),
                    message: "arithmetic overflow".to_string(),
                },
            ],
            3,
        );
        let m = module(vec![f], Vec::new());
        let err = Interpreter::new(&m).run("f").unwrap_err();
        assert_eq!(err.kind, TrapKind::ConditionFailed);
    }

    #[test]
    fn test_stack_store_load() {
        let f = function(
            "f",
            vec![int(), addr(), int()],
            vec![
                MirInst::IntegerLiteral { dest: Value(0), value: 42 },
                MirInst::AllocStack { dest: Value(1) },
                MirInst::Store {
                    value: Value(0),
                    address: Value(1),
                    qualifier: StoreQualifier::Trivial,
                },
                MirInst::Load {
                    dest: Value(2),
                    address: Value(1),
                    qualifier: LoadQualifier::Trivial,
                },
                MirInst::DeallocStack { operand: Value(1) },
            ],
            2,
        );
        let m = module(vec![f], Vec::new());
        let mut interp = Interpreter::new(&m);
        assert_eq!(interp.run("f").unwrap(), RtValue::Int(42));
        assert!(interp.leak_report().is_clean());
    }

    #[test]
    fn test_overlapping_dynamic_modify_traps() {
        let f = function(
            "f",
            vec![addr(), addr(), addr(), int()],
            vec![
                MirInst::GlobalAddr {
                    dest: Value(0),
                    global: "counter".to_string(),
                },
                MirInst::BeginAccess {
                    dest: Value(1),
                    address: Value(0),
                    kind: AccessKind::Modify,
                    enforcement: Enforcement::Dynamic,
                },
                MirInst::BeginAccess {
                    dest: Value(2),
                    address: Value(0),
                    kind: AccessKind::Read,
                    enforcement: Enforcement::Dynamic,
                },
            ],
            3,
        );
        let m = module(
            vec![f],
            vec![MirGlobal {
                name: "counter".to_string(),
                ty: Type::Int,
            }],
        );
        let err = Interpreter::new(&m).run("f").unwrap_err();
        assert_eq!(err.kind, TrapKind::ExclusivityViolation);
    }

    #[test]
    fn test_unsafe_accesses_are_not_checked() {
        let f = function(
            "f",
            vec![addr(), addr(), addr(), int()],
            vec![
                MirInst::GlobalAddr {
                    dest: Value(0),
                    global: "counter".to_string(),
                },
                MirInst::BeginAccess {
                    dest: Value(1),
                    address: Value(0),
                    kind: AccessKind::Modify,
                    enforcement: Enforcement::Unsafe,
                },
                MirInst::BeginAccess {
                    dest: Value(2),
                    address: Value(0),
                    kind: AccessKind::Modify,
                    enforcement: Enforcement::Dynamic,
                },
                MirInst::EndAccess { access: Value(2) },
                MirInst::EndAccess { access: Value(1) },
                MirInst::IntegerLiteral { dest: Value(3), value: 0 },
            ],
            3,
        );
        let m = module(
            vec![f],
            vec![MirGlobal {
                name: "counter".to_string(),
                ty: Type::Int,
            }],
        );
        assert_eq!(Interpreter::new(&m).run("f").unwrap(), RtValue::Int(0));
    }

    #[test]
    fn test_once_runs_initializer_a_single_time() {
        let init = function(
            "init",
            vec![addr(), int(), MirType::Object(Type::unit())],
            vec![
                MirInst::GlobalAddr {
                    dest: Value(0),
                    global: "g".to_string(),
                },
                MirInst::IntegerLiteral { dest: Value(1), value: 7 },
                MirInst::Store {
                    value: Value(1),
                    address: Value(0),
                    qualifier: StoreQualifier::Trivial,
                },
                MirInst::Tuple {
                    dest: Value(2),
                    elements: Vec::new(),
                },
            ],
            2,
        );

        let call_once = |dest: u32| {
            vec![
                MirInst::GlobalAddr {
                    dest: Value(dest),
                    global: "g_token".to_string(),
                },
                MirInst::FunctionRef {
                    dest: Value(dest + 1),
                    function: "init".to_string(),
                },
                MirInst::Builtin {
                    dest: Value(dest + 2),
                    name: "once".to_string(),
                    args: vec![Value(dest), Value(dest + 1)],
                },
            ]
        };
        let mut body = call_once(0);
        body.extend(call_once(3));
        body.push(MirInst::GlobalAddr {
            dest: Value(6),
            global: "g".to_string(),
        });
        body.push(MirInst::Load {
            dest: Value(7),
            address: Value(6),
            qualifier: LoadQualifier::Trivial,
        });
        let main = function("main", vec![addr(), int(), int(), addr(), int(), int(), addr(), int()], body, 7);
        let m = module(
            vec![init, main],
            vec![
                MirGlobal {
                    name: "g".to_string(),
                    ty: Type::Int,
                },
                MirGlobal {
                    name: "g_token".to_string(),
                    ty: Type::Int,
                },
            ],
        );
        let mut interp = Interpreter::new(&m);
        assert_eq!(interp.run("main").unwrap(), RtValue::Int(7));
        assert_eq!(interp.once.len(), 1);
        assert!(interp.once.values().all(|flag| flag.is_complete()));
    }

    #[test]
    fn test_int32_overflow_detected_at_32_bits() {
        let result = int_builtin(
            "sadd_with_overflow_Int32",
            "sadd_with_overflow",
            "Int32",
            &RtValue::Int(i64::from(i32::MAX)),
            &RtValue::Int(1),
        )
        .unwrap();
        assert_eq!(
            result,
            RtValue::Tuple(vec![RtValue::Int(i64::from(i32::MIN)), RtValue::Bool(true)])
        );
    }
}
