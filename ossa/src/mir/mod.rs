//! Ownership SSA intermediate representation
//!
//! Functions are lists of basic blocks whose arguments replace phi nodes.
//! Every value carries a type (object `$T`, address `$*T` or lowered
//! function) and an ownership kind. Reference counting and exclusivity are
//! explicit: `copy_value`/`destroy_value`, `begin_borrow`/`end_borrow`,
//! `begin_access`/`end_access`.
//!
//! The textual form follows the SIL syntax closely enough that
//! FileCheck-style assertions written against it read naturally.

pub mod verify;

pub use verify::{verify_function, verify_module};

use crate::ast::Type;
use crate::tables::TableSet;
use crate::types::{ArgConvention, LoweredSignature, ResultConvention};
use std::fmt;
use std::sync::Arc;

/// A lowered module: functions, globals and dispatch tables
#[derive(Debug, Clone)]
pub struct MirModule {
    pub name: String,
    pub globals: Vec<MirGlobal>,
    pub functions: Vec<MirFunction>,
    pub tables: Arc<TableSet>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirGlobal {
    pub name: String,
    pub ty: Type,
}

/// A lowered function
#[derive(Debug, Clone)]
pub struct MirFunction {
    pub name: String,
    pub ty: LoweredFunctionType,
    /// Entry block arguments, in signature order (indirect result first)
    pub params: Vec<Value>,
    /// Basic blocks (first block is entry)
    pub blocks: Vec<BasicBlock>,
    /// Type and ownership of every value, indexed by `Value`
    pub values: Vec<ValueInfo>,
    /// Adapter with no logic of its own (witness, vtable, reabstraction)
    pub is_thunk: bool,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Block label (unique within function)
    pub label: String,
    pub args: Vec<Value>,
    pub instructions: Vec<MirInst>,
    pub terminator: Terminator,
}

/// SSA value id, printed as `%N`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub ty: MirType,
    pub ownership: Ownership,
}

/// Ownership kind of an SSA value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Must be consumed exactly once
    Owned,
    /// Borrowed; valid for an enclosing scope, never destroyed here
    Guaranteed,
    /// No reference counting
    Trivial,
    /// An address; the storage it names has its own lifetime
    Address,
}

/// Lowered type of an SSA value
#[derive(Debug, Clone, PartialEq)]
pub enum MirType {
    Object(Type),
    Address(Type),
    /// Result of `function_ref`, `class_method`, `witness_method`
    Function(Box<LoweredFunctionType>),
}

impl MirType {
    pub fn formal(&self) -> Option<&Type> {
        match self {
            MirType::Object(ty) | MirType::Address(ty) => Some(ty),
            MirType::Function(_) => None,
        }
    }

    pub fn is_address(&self) -> bool {
        matches!(self, MirType::Address(_))
    }
}

impl fmt::Display for MirType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirType::Object(ty) => write!(f, "${ty}"),
            MirType::Address(ty) => write!(f, "$*{ty}"),
            MirType::Function(func) => write!(f, "${func}"),
        }
    }
}

/// Calling convention of a lowered function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FnConvention {
    Thin,
    Method,
    WitnessMethod,
    /// Context-carrying closure, context borrowed by the callee
    Thick,
    Block,
}

/// Convention plus lowered signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoweredFunctionType {
    pub convention: FnConvention,
    pub sig: LoweredSignature,
}

impl LoweredFunctionType {
    pub fn new(convention: FnConvention, sig: LoweredSignature) -> Self {
        LoweredFunctionType { convention, sig }
    }
}

impl fmt::Display for LoweredFunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.convention {
            FnConvention::Thin => write!(f, "@convention(thin) ")?,
            FnConvention::Method => write!(f, "@convention(method) ")?,
            FnConvention::WitnessMethod => write!(f, "@convention(witness_method) ")?,
            FnConvention::Thick => write!(f, "@callee_guaranteed ")?,
            FnConvention::Block => write!(f, "@convention(block) ")?,
        }
        write!(f, "{}", self.sig)
    }
}

/// Field of a struct or class, with its index in the flattened layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub index: usize,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.owner, self.name)
    }
}

/// Enum case, `#Optional.some!enumelt`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaseRef {
    pub owner: String,
    pub name: String,
}

impl CaseRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        CaseRef {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn some() -> Self {
        CaseRef::new("Optional", "some")
    }

    pub fn none() -> Self {
        CaseRef::new("Optional", "none")
    }
}

impl fmt::Display for CaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}!enumelt", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Modify,
    Init,
    Deinit,
}

impl AccessKind {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, AccessKind::Read)
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessKind::Read => "read",
            AccessKind::Modify => "modify",
            AccessKind::Init => "init",
            AccessKind::Deinit => "deinit",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Enforcement {
    /// Proven at compile time
    Static,
    /// Checked at run time
    Dynamic,
    /// Resolved per instantiation; treated as dynamic by the interpreter
    Unknown,
    /// Not checked
    Unsafe,
}

impl fmt::Display for Enforcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Enforcement::Static => "static",
            Enforcement::Dynamic => "dynamic",
            Enforcement::Unknown => "unknown",
            Enforcement::Unsafe => "unsafe",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadQualifier {
    Trivial,
    Copy,
    Take,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreQualifier {
    Trivial,
    Init,
    Assign,
}

/// Non-terminating instruction
#[derive(Debug, Clone, PartialEq)]
pub enum MirInst {
    IntegerLiteral { dest: Value, value: i64 },
    FloatLiteral { dest: Value, value: f64 },
    FunctionRef { dest: Value, function: String },
    /// Vtable dispatch
    ClassMethod { dest: Value, operand: Value, selector: String },
    /// Witness table dispatch on the conformance of `lookup`
    WitnessMethod {
        dest: Value,
        lookup: Type,
        protocol: String,
        requirement: String,
    },
    Apply { dest: Value, callee: Value, args: Vec<Value> },
    /// Closure formation; captured arguments follow the formal ones
    PartialApply {
        dest: Value,
        callee: Value,
        args: Vec<Value>,
        on_stack: bool,
    },
    ThinToThickFunction { dest: Value, operand: Value },
    ConvertFunction { dest: Value, operand: Value },
    Builtin { dest: Value, name: String, args: Vec<Value> },
    Metatype { dest: Value },

    AllocStack { dest: Value },
    DeallocStack { operand: Value },
    AllocBox { dest: Value },
    ProjectBox { dest: Value, operand: Value },
    AllocRef { dest: Value },
    AllocValueBuffer { dest: Value, buffer: Value },
    ProjectValueBuffer { dest: Value, buffer: Value },
    DeallocValueBuffer { buffer: Value, ty: Type },
    GlobalAddr { dest: Value, global: String },

    Load { dest: Value, address: Value, qualifier: LoadQualifier },
    LoadBorrow { dest: Value, address: Value },
    Store { value: Value, address: Value, qualifier: StoreQualifier },
    CopyAddr {
        src: Value,
        dest: Value,
        take: bool,
        initialize: bool,
    },
    DestroyAddr { address: Value },
    LoadWeak { dest: Value, address: Value, take: bool },
    StoreWeak { value: Value, address: Value, initialize: bool },
    RefToUnowned { dest: Value, operand: Value },
    StrongCopyUnowned { dest: Value, operand: Value },
    RefToUnmanaged { dest: Value, operand: Value },
    UnmanagedToRef { dest: Value, operand: Value },

    BeginBorrow { dest: Value, operand: Value },
    EndBorrow { borrowed: Value, original: Value },
    CopyValue { dest: Value, operand: Value },
    DestroyValue { operand: Value },

    BeginAccess {
        dest: Value,
        address: Value,
        kind: AccessKind,
        enforcement: Enforcement,
    },
    EndAccess { access: Value },

    Struct { dest: Value, fields: Vec<Value> },
    StructExtract { dest: Value, operand: Value, field: FieldRef },
    StructElementAddr { dest: Value, address: Value, field: FieldRef },
    Tuple { dest: Value, elements: Vec<Value> },
    TupleExtract { dest: Value, operand: Value, index: usize },
    TupleElementAddr { dest: Value, address: Value, index: usize },
    RefElementAddr { dest: Value, operand: Value, field: FieldRef },

    Enum {
        dest: Value,
        case: CaseRef,
        payload: Option<Value>,
    },
    InitEnumDataAddr { dest: Value, address: Value, case: CaseRef },
    InjectEnumAddr { address: Value, case: CaseRef },
    UncheckedTakeEnumDataAddr { dest: Value, address: Value, case: CaseRef },

    InitExistentialAddr { dest: Value, address: Value, concrete: Type },
    OpenExistentialAddr { dest: Value, address: Value, mutable: bool },
    AllocExistentialBox { dest: Value, concrete: Type },
    ProjectExistentialBox { dest: Value, operand: Value },

    Upcast { dest: Value, operand: Value },
    UncheckedRefCast { dest: Value, operand: Value },
    PointerToAddress { dest: Value, pointer: Value },
    AddressToPointer { dest: Value, address: Value },
    ThinFunctionToPointer { dest: Value, operand: Value },
    PointerToThinFunction { dest: Value, operand: Value },

    StrongPin { dest: Value, operand: Value },
    StrongUnpin { operand: Value },

    ProjectBlockStorage { dest: Value, storage: Value },
    InitBlockStorageHeader {
        dest: Value,
        storage: Value,
        invoke: Value,
    },
    CopyBlock { dest: Value, operand: Value },

    CondFail { operand: Value, message: String },
}

/// Block terminator
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Return(Value),
    Throw(Value),
    Br { target: String, args: Vec<Value> },
    CondBr {
        cond: Value,
        then_target: String,
        else_target: String,
    },
    /// Payload-carrying cases pass the payload as the target's block argument
    SwitchEnum {
        operand: Value,
        cases: Vec<(CaseRef, String)>,
        default: Option<String>,
    },
    SwitchEnumAddr {
        address: Value,
        cases: Vec<(CaseRef, String)>,
        default: Option<String>,
    },
    /// Normal target receives the direct result, error target the error
    TryApply {
        callee: Value,
        args: Vec<Value>,
        normal: String,
        error: String,
    },
    /// Success target receives the cast value, borrowed from the operand
    CheckedCastBranch {
        operand: Value,
        ty: Type,
        success: String,
        failure: String,
    },
    Unreachable,
}

impl MirInst {
    /// Value defined by this instruction
    pub fn dest(&self) -> Option<Value> {
        use MirInst::*;
        match self {
            IntegerLiteral { dest, .. }
            | FloatLiteral { dest, .. }
            | FunctionRef { dest, .. }
            | ClassMethod { dest, .. }
            | WitnessMethod { dest, .. }
            | Apply { dest, .. }
            | PartialApply { dest, .. }
            | ThinToThickFunction { dest, .. }
            | ConvertFunction { dest, .. }
            | Builtin { dest, .. }
            | Metatype { dest }
            | AllocStack { dest }
            | AllocBox { dest }
            | ProjectBox { dest, .. }
            | AllocRef { dest }
            | AllocValueBuffer { dest, .. }
            | ProjectValueBuffer { dest, .. }
            | GlobalAddr { dest, .. }
            | Load { dest, .. }
            | LoadBorrow { dest, .. }
            | LoadWeak { dest, .. }
            | RefToUnowned { dest, .. }
            | StrongCopyUnowned { dest, .. }
            | RefToUnmanaged { dest, .. }
            | UnmanagedToRef { dest, .. }
            | BeginBorrow { dest, .. }
            | CopyValue { dest, .. }
            | BeginAccess { dest, .. }
            | Struct { dest, .. }
            | StructExtract { dest, .. }
            | StructElementAddr { dest, .. }
            | Tuple { dest, .. }
            | TupleExtract { dest, .. }
            | TupleElementAddr { dest, .. }
            | RefElementAddr { dest, .. }
            | Enum { dest, .. }
            | InitEnumDataAddr { dest, .. }
            | UncheckedTakeEnumDataAddr { dest, .. }
            | InitExistentialAddr { dest, .. }
            | OpenExistentialAddr { dest, .. }
            | AllocExistentialBox { dest, .. }
            | ProjectExistentialBox { dest, .. }
            | Upcast { dest, .. }
            | UncheckedRefCast { dest, .. }
            | PointerToAddress { dest, .. }
            | AddressToPointer { dest, .. }
            | ThinFunctionToPointer { dest, .. }
            | PointerToThinFunction { dest, .. }
            | StrongPin { dest, .. }
            | ProjectBlockStorage { dest, .. }
            | InitBlockStorageHeader { dest, .. }
            | CopyBlock { dest, .. } => Some(*dest),
            DeallocStack { .. }
            | DeallocValueBuffer { .. }
            | Store { .. }
            | CopyAddr { .. }
            | DestroyAddr { .. }
            | StoreWeak { .. }
            | EndBorrow { .. }
            | DestroyValue { .. }
            | EndAccess { .. }
            | InjectEnumAddr { .. }
            | StrongUnpin { .. }
            | CondFail { .. } => None,
        }
    }

    /// Instruction mnemonic as printed
    pub fn mnemonic(&self) -> &'static str {
        use MirInst::*;
        match self {
            IntegerLiteral { .. } => "integer_literal",
            FloatLiteral { .. } => "float_literal",
            FunctionRef { .. } => "function_ref",
            ClassMethod { .. } => "class_method",
            WitnessMethod { .. } => "witness_method",
            Apply { .. } => "apply",
            PartialApply { .. } => "partial_apply",
            ThinToThickFunction { .. } => "thin_to_thick_function",
            ConvertFunction { .. } => "convert_function",
            Builtin { .. } => "builtin",
            Metatype { .. } => "metatype",
            AllocStack { .. } => "alloc_stack",
            DeallocStack { .. } => "dealloc_stack",
            AllocBox { .. } => "alloc_box",
            ProjectBox { .. } => "project_box",
            AllocRef { .. } => "alloc_ref",
            AllocValueBuffer { .. } => "alloc_value_buffer",
            ProjectValueBuffer { .. } => "project_value_buffer",
            DeallocValueBuffer { .. } => "dealloc_value_buffer",
            GlobalAddr { .. } => "global_addr",
            Load { .. } => "load",
            LoadBorrow { .. } => "load_borrow",
            Store { .. } => "store",
            CopyAddr { .. } => "copy_addr",
            DestroyAddr { .. } => "destroy_addr",
            LoadWeak { .. } => "load_weak",
            StoreWeak { .. } => "store_weak",
            RefToUnowned { .. } => "ref_to_unowned",
            StrongCopyUnowned { .. } => "strong_copy_unowned_value",
            RefToUnmanaged { .. } => "ref_to_unmanaged",
            UnmanagedToRef { .. } => "unmanaged_to_ref",
            BeginBorrow { .. } => "begin_borrow",
            EndBorrow { .. } => "end_borrow",
            CopyValue { .. } => "copy_value",
            DestroyValue { .. } => "destroy_value",
            BeginAccess { .. } => "begin_access",
            EndAccess { .. } => "end_access",
            Struct { .. } => "struct",
            StructExtract { .. } => "struct_extract",
            StructElementAddr { .. } => "struct_element_addr",
            Tuple { .. } => "tuple",
            TupleExtract { .. } => "tuple_extract",
            TupleElementAddr { .. } => "tuple_element_addr",
            RefElementAddr { .. } => "ref_element_addr",
            Enum { .. } => "enum",
            InitEnumDataAddr { .. } => "init_enum_data_addr",
            InjectEnumAddr { .. } => "inject_enum_addr",
            UncheckedTakeEnumDataAddr { .. } => "unchecked_take_enum_data_addr",
            InitExistentialAddr { .. } => "init_existential_addr",
            OpenExistentialAddr { .. } => "open_existential_addr",
            AllocExistentialBox { .. } => "alloc_existential_box",
            ProjectExistentialBox { .. } => "project_existential_box",
            Upcast { .. } => "upcast",
            UncheckedRefCast { .. } => "unchecked_ref_cast",
            PointerToAddress { .. } => "pointer_to_address",
            AddressToPointer { .. } => "address_to_pointer",
            ThinFunctionToPointer { .. } => "thin_function_to_pointer",
            PointerToThinFunction { .. } => "pointer_to_thin_function",
            StrongPin { .. } => "strong_pin",
            StrongUnpin { .. } => "strong_unpin",
            ProjectBlockStorage { .. } => "project_block_storage",
            InitBlockStorageHeader { .. } => "init_block_storage_header",
            CopyBlock { .. } => "copy_block",
            CondFail { .. } => "cond_fail",
        }
    }

    /// Values read by this instruction, in operand order
    pub fn operands(&self) -> Vec<Value> {
        use MirInst::*;
        match self {
            IntegerLiteral { .. }
            | FloatLiteral { .. }
            | FunctionRef { .. }
            | WitnessMethod { .. }
            | Metatype { .. }
            | AllocStack { .. }
            | AllocBox { .. }
            | AllocRef { .. }
            | GlobalAddr { .. }
            | AllocExistentialBox { .. } => Vec::new(),
            Apply { callee, args, .. } | PartialApply { callee, args, .. } => {
                std::iter::once(*callee).chain(args.iter().copied()).collect()
            }
            Builtin { args, .. } => args.clone(),
            Struct { fields, .. } => fields.clone(),
            Tuple { elements, .. } => elements.clone(),
            Enum { payload, .. } => payload.iter().copied().collect(),
            Store { value, address, .. } | StoreWeak { value, address, .. } => vec![*value, *address],
            CopyAddr { src, dest, .. } => vec![*src, *dest],
            EndBorrow { borrowed, original } => vec![*borrowed, *original],
            InitBlockStorageHeader { storage, invoke, .. } => vec![*storage, *invoke],
            ClassMethod { operand, .. }
            | ThinToThickFunction { operand, .. }
            | ConvertFunction { operand, .. }
            | DeallocStack { operand }
            | ProjectBox { operand, .. }
            | RefToUnowned { operand, .. }
            | StrongCopyUnowned { operand, .. }
            | RefToUnmanaged { operand, .. }
            | UnmanagedToRef { operand, .. }
            | BeginBorrow { operand, .. }
            | CopyValue { operand, .. }
            | DestroyValue { operand }
            | StructExtract { operand, .. }
            | TupleExtract { operand, .. }
            | RefElementAddr { operand, .. }
            | ProjectExistentialBox { operand, .. }
            | Upcast { operand, .. }
            | UncheckedRefCast { operand, .. }
            | ThinFunctionToPointer { operand, .. }
            | PointerToThinFunction { operand, .. }
            | StrongPin { operand, .. }
            | StrongUnpin { operand }
            | CopyBlock { operand, .. }
            | CondFail { operand, .. } => vec![*operand],
            AllocValueBuffer { buffer, .. }
            | ProjectValueBuffer { buffer, .. }
            | DeallocValueBuffer { buffer, .. } => vec![*buffer],
            Load { address, .. }
            | LoadBorrow { address, .. }
            | DestroyAddr { address }
            | LoadWeak { address, .. }
            | BeginAccess { address, .. }
            | StructElementAddr { address, .. }
            | TupleElementAddr { address, .. }
            | InitEnumDataAddr { address, .. }
            | InjectEnumAddr { address, .. }
            | UncheckedTakeEnumDataAddr { address, .. }
            | InitExistentialAddr { address, .. }
            | OpenExistentialAddr { address, .. }
            | AddressToPointer { address, .. } => vec![*address],
            EndAccess { access } => vec![*access],
            PointerToAddress { pointer, .. } => vec![*pointer],
            ProjectBlockStorage { storage, .. } => vec![*storage],
        }
    }
}

impl Terminator {
    /// Values read by the terminator
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Terminator::Return(value) | Terminator::Throw(value) => vec![*value],
            Terminator::Br { args, .. } => args.clone(),
            Terminator::CondBr { cond, .. } => vec![*cond],
            Terminator::SwitchEnum { operand, .. } | Terminator::CheckedCastBranch { operand, .. } => vec![*operand],
            Terminator::SwitchEnumAddr { address, .. } => vec![*address],
            Terminator::TryApply { callee, args, .. } => std::iter::once(*callee).chain(args.iter().copied()).collect(),
            Terminator::Unreachable => Vec::new(),
        }
    }

    /// Successor labels in order
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Terminator::Return(_) | Terminator::Throw(_) | Terminator::Unreachable => Vec::new(),
            Terminator::Br { target, .. } => vec![target.as_str()],
            Terminator::CondBr {
                then_target,
                else_target,
                ..
            } => vec![then_target.as_str(), else_target.as_str()],
            Terminator::SwitchEnum { cases, default, .. }
            | Terminator::SwitchEnumAddr { cases, default, .. } => cases
                .iter()
                .map(|(_, label)| label.as_str())
                .chain(default.as_deref())
                .collect(),
            Terminator::TryApply { normal, error, .. } => vec![normal.as_str(), error.as_str()],
            Terminator::CheckedCastBranch {
                success, failure, ..
            } => vec![success.as_str(), failure.as_str()],
        }
    }
}

impl MirFunction {
    pub fn value_info(&self, value: Value) -> Option<&ValueInfo> {
        self.values.get(value.0 as usize)
    }

    pub fn block(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &MirInst> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    /// Number of instructions with the given mnemonic
    pub fn count(&self, mnemonic: &str) -> usize {
        self.instructions().filter(|i| i.mnemonic() == mnemonic).count()
    }
}

impl MirModule {
    pub fn function(&self, name: &str) -> Option<&MirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&MirGlobal> {
        self.globals.iter().find(|g| g.name == name)
    }
}

/// Instruction stream builder for one function body
#[derive(Debug, Clone)]
pub struct LoweringContext {
    values: Vec<ValueInfo>,
    /// Counter for generating unique block labels
    block_counter: usize,
    /// Finished basic blocks
    pub blocks: Vec<BasicBlock>,
    current_instructions: Vec<MirInst>,
    current_label: String,
    current_args: Vec<Value>,
    terminated: bool,
}

impl LoweringContext {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            block_counter: 1,
            blocks: Vec::new(),
            current_instructions: Vec::new(),
            current_label: "bb0".to_string(),
            current_args: Vec::new(),
            terminated: false,
        }
    }

    pub fn fresh_value(&mut self, ty: MirType, ownership: Ownership) -> Value {
        let value = Value(self.values.len() as u32);
        self.values.push(ValueInfo { ty, ownership });
        value
    }

    /// Generate a fresh block label
    pub fn fresh_label(&mut self) -> String {
        let label = format!("bb{}", self.block_counter);
        self.block_counter += 1;
        label
    }

    /// Add an argument to the block under construction
    pub fn add_block_arg(&mut self, value: Value) {
        self.current_args.push(value);
    }

    /// Add an instruction to the current block.
    ///
    /// Code after a terminator lands in a fresh block with no predecessors.
    pub fn push_inst(&mut self, inst: MirInst) {
        if self.terminated {
            let label = self.fresh_label();
            self.start_block(label, Vec::new());
        }
        self.current_instructions.push(inst);
    }

    /// Finish the current block with a terminator
    pub fn finish_block(&mut self, terminator: Terminator) {
        if self.terminated {
            return;
        }
        let block = BasicBlock {
            label: self.current_label.clone(),
            args: std::mem::take(&mut self.current_args),
            instructions: std::mem::take(&mut self.current_instructions),
            terminator,
        };
        self.blocks.push(block);
        self.terminated = true;
    }

    /// Start a new block
    pub fn start_block(&mut self, label: String, args: Vec<Value>) {
        self.current_label = label;
        self.current_args = args;
        self.current_instructions = Vec::new();
        self.terminated = false;
    }

    pub fn current_block_label(&self) -> &str {
        &self.current_label
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn value_info(&self, value: Value) -> &ValueInfo {
        &self.values[value.0 as usize]
    }

    pub fn value_type(&self, value: Value) -> &MirType {
        &self.value_info(value).ty
    }

    pub fn ownership(&self, value: Value) -> Ownership {
        self.value_info(value).ownership
    }

    /// Hand over the finished blocks and the value table
    pub fn finish(mut self) -> (Vec<BasicBlock>, Vec<ValueInfo>) {
        if !self.terminated && !self.current_instructions.is_empty() {
            self.finish_block(Terminator::Unreachable);
        }
        (self.blocks, self.values)
    }
}

impl Default for LoweringContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Text Formatting
// ============================================================================

/// Format a lowered module: globals, functions, vtables, witness tables
pub fn format_module(module: &MirModule) -> String {
    let mut output = format!("sil_stage raw\n\n// module {}\n", module.name);

    for global in &module.globals {
        output.push_str(&format!("\nsil_global @{} : ${}\n", global.name, global.ty));
    }

    for func in &module.functions {
        output.push('\n');
        output.push_str(&format_function(func));
    }

    let tables = module.tables.format();
    if !tables.is_empty() {
        output.push('\n');
        output.push_str(&tables);
    }

    output
}

/// Format a single function
pub fn format_function(func: &MirFunction) -> String {
    let mut out = String::new();
    let thunk = if func.is_thunk { "[thunk] " } else { "" };
    out.push_str(&format!("sil {thunk}@{} : ${} {{\n", func.name, func.ty));

    for block in &func.blocks {
        if block.args.is_empty() {
            out.push_str(&format!("{}:\n", block.label));
        } else {
            let args: Vec<_> = block.args.iter().map(|a| format_block_arg(func, *a)).collect();
            out.push_str(&format!("{}({}):\n", block.label, args.join(", ")));
        }
        for inst in &block.instructions {
            out.push_str(&format!("  {}\n", format_inst(func, inst)));
        }
        out.push_str(&format!("  {}\n", format_terminator(func, &block.terminator)));
    }

    out.push_str("}\n");
    out
}

fn ty_of(func: &MirFunction, value: Value) -> String {
    match func.value_info(value) {
        Some(info) => info.ty.to_string(),
        None => "$<invalid>".to_string(),
    }
}

fn typed(func: &MirFunction, value: Value) -> String {
    format!("{value} : {}", ty_of(func, value))
}

fn format_block_arg(func: &MirFunction, value: Value) -> String {
    match func.value_info(value) {
        Some(info) => match info.ownership {
            Ownership::Owned => format!("{value} : @owned {}", info.ty),
            Ownership::Guaranteed => format!("{value} : @guaranteed {}", info.ty),
            Ownership::Trivial | Ownership::Address => format!("{value} : {}", info.ty),
        },
        None => format!("{value} : $<invalid>"),
    }
}

fn address_referent(func: &MirFunction, value: Value) -> String {
    match func.value_info(value).map(|i| &i.ty) {
        Some(MirType::Address(ty)) => format!("${ty}"),
        Some(other) => other.to_string(),
        None => "$<invalid>".to_string(),
    }
}

fn format_inst(func: &MirFunction, inst: &MirInst) -> String {
    use MirInst::*;
    match inst {
        IntegerLiteral { dest, value } => {
            format!("{dest} = integer_literal {}, {value}", ty_of(func, *dest))
        }
        FloatLiteral { dest, value } => {
            format!("{dest} = float_literal {}, {value}", ty_of(func, *dest))
        }
        FunctionRef { dest, function } => {
            format!("{dest} = function_ref @{function} : {}", ty_of(func, *dest))
        }
        ClassMethod {
            dest,
            operand,
            selector,
        } => format!(
            "{dest} = class_method {}, {selector} : {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        WitnessMethod {
            dest,
            lookup,
            protocol,
            requirement,
        } => format!(
            "{dest} = witness_method ${lookup}, #{protocol}.{requirement} : {}",
            ty_of(func, *dest)
        ),
        Apply { dest, callee, args } => format!(
            "{dest} = apply {callee}({}) : {}",
            join_values(args),
            ty_of(func, *callee)
        ),
        PartialApply {
            dest,
            callee,
            args,
            on_stack,
        } => {
            let stack = if *on_stack { "[on_stack] " } else { "" };
            format!(
                "{dest} = partial_apply [callee_guaranteed] {stack}{callee}({}) : {}",
                join_values(args),
                ty_of(func, *callee)
            )
        }
        ThinToThickFunction { dest, operand } => format!(
            "{dest} = thin_to_thick_function {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        ConvertFunction { dest, operand } => format!(
            "{dest} = convert_function {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        Builtin { dest, name, args } => {
            let args: Vec<_> = args.iter().map(|a| typed(func, *a)).collect();
            format!("{dest} = builtin \"{name}\"({}) : {}", args.join(", "), ty_of(func, *dest))
        }
        Metatype { dest } => format!("{dest} = metatype {}", ty_of(func, *dest)),
        AllocStack { dest } => format!("{dest} = alloc_stack {}", address_referent(func, *dest)),
        DeallocStack { operand } => format!("dealloc_stack {}", typed(func, *operand)),
        AllocBox { dest } => format!("{dest} = alloc_box {}", ty_of(func, *dest)),
        ProjectBox { dest, operand } => {
            format!("{dest} = project_box {}, 0", typed(func, *operand))
        }
        AllocRef { dest } => format!("{dest} = alloc_ref {}", ty_of(func, *dest)),
        AllocValueBuffer { dest, buffer } => format!(
            "{dest} = alloc_value_buffer {} in {}",
            address_referent(func, *dest),
            typed(func, *buffer)
        ),
        ProjectValueBuffer { dest, buffer } => format!(
            "{dest} = project_value_buffer {} in {}",
            address_referent(func, *dest),
            typed(func, *buffer)
        ),
        DeallocValueBuffer { buffer, ty } => {
            format!("dealloc_value_buffer ${ty} in {}", typed(func, *buffer))
        }
        GlobalAddr { dest, global } => {
            format!("{dest} = global_addr @{global} : {}", ty_of(func, *dest))
        }
        Load {
            dest,
            address,
            qualifier,
        } => {
            let q = match qualifier {
                LoadQualifier::Trivial => "trivial",
                LoadQualifier::Copy => "copy",
                LoadQualifier::Take => "take",
            };
            format!("{dest} = load [{q}] {}", typed(func, *address))
        }
        LoadBorrow { dest, address } => format!("{dest} = load_borrow {}", typed(func, *address)),
        Store {
            value,
            address,
            qualifier,
        } => {
            let q = match qualifier {
                StoreQualifier::Trivial => "trivial",
                StoreQualifier::Init => "init",
                StoreQualifier::Assign => "assign",
            };
            format!("store {value} to [{q}] {}", typed(func, *address))
        }
        CopyAddr {
            src,
            dest,
            take,
            initialize,
        } => {
            let take = if *take { "[take] " } else { "" };
            let init = if *initialize { "[initialization] " } else { "" };
            format!("copy_addr {take}{src} to {init}{}", typed(func, *dest))
        }
        DestroyAddr { address } => format!("destroy_addr {}", typed(func, *address)),
        LoadWeak {
            dest,
            address,
            take,
        } => {
            let take = if *take { "[take] " } else { "" };
            format!("{dest} = load_weak {take}{}", typed(func, *address))
        }
        StoreWeak {
            value,
            address,
            initialize,
        } => {
            let init = if *initialize { "[initialization] " } else { "" };
            format!("store_weak {value} to {init}{}", typed(func, *address))
        }
        RefToUnowned { dest, operand } => format!(
            "{dest} = ref_to_unowned {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        StrongCopyUnowned { dest, operand } => {
            format!("{dest} = strong_copy_unowned_value {}", typed(func, *operand))
        }
        RefToUnmanaged { dest, operand } => format!(
            "{dest} = ref_to_unmanaged {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        UnmanagedToRef { dest, operand } => format!(
            "{dest} = unmanaged_to_ref {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        BeginBorrow { dest, operand } => format!("{dest} = begin_borrow {}", typed(func, *operand)),
        EndBorrow { borrowed, original } => format!(
            "end_borrow {borrowed} from {original} : {}, {}",
            ty_of(func, *borrowed),
            ty_of(func, *original)
        ),
        CopyValue { dest, operand } => format!("{dest} = copy_value {}", typed(func, *operand)),
        DestroyValue { operand } => format!("destroy_value {}", typed(func, *operand)),
        BeginAccess {
            dest,
            address,
            kind,
            enforcement,
        } => format!(
            "{dest} = begin_access [{kind}] [{enforcement}] {}",
            typed(func, *address)
        ),
        EndAccess { access } => format!("end_access {}", typed(func, *access)),
        Struct { dest, fields } => {
            let fields: Vec<_> = fields.iter().map(|v| typed(func, *v)).collect();
            format!("{dest} = struct {} ({})", ty_of(func, *dest), fields.join(", "))
        }
        StructExtract {
            dest,
            operand,
            field,
        } => format!("{dest} = struct_extract {}, {field}", typed(func, *operand)),
        StructElementAddr {
            dest,
            address,
            field,
        } => format!("{dest} = struct_element_addr {}, {field}", typed(func, *address)),
        Tuple { dest, elements } => {
            let elems: Vec<_> = elements.iter().map(|v| typed(func, *v)).collect();
            format!("{dest} = tuple ({})", elems.join(", "))
        }
        TupleExtract {
            dest,
            operand,
            index,
        } => format!("{dest} = tuple_extract {}, {index}", typed(func, *operand)),
        TupleElementAddr {
            dest,
            address,
            index,
        } => format!("{dest} = tuple_element_addr {}, {index}", typed(func, *address)),
        RefElementAddr {
            dest,
            operand,
            field,
        } => format!("{dest} = ref_element_addr {}, {field}", typed(func, *operand)),
        Enum {
            dest,
            case,
            payload,
        } => match payload {
            Some(p) => format!("{dest} = enum {}, {case}, {}", ty_of(func, *dest), typed(func, *p)),
            None => format!("{dest} = enum {}, {case}", ty_of(func, *dest)),
        },
        InitEnumDataAddr {
            dest,
            address,
            case,
        } => format!("{dest} = init_enum_data_addr {}, {case}", typed(func, *address)),
        InjectEnumAddr { address, case } => {
            format!("inject_enum_addr {}, {case}", typed(func, *address))
        }
        UncheckedTakeEnumDataAddr {
            dest,
            address,
            case,
        } => format!(
            "{dest} = unchecked_take_enum_data_addr {}, {case}",
            typed(func, *address)
        ),
        InitExistentialAddr {
            dest,
            address,
            concrete,
        } => format!(
            "{dest} = init_existential_addr {}, ${concrete}",
            typed(func, *address)
        ),
        OpenExistentialAddr {
            dest,
            address,
            mutable,
        } => {
            let access = if *mutable { "mutable_access" } else { "immutable_access" };
            format!(
                "{dest} = open_existential_addr {access} {} to {}",
                typed(func, *address),
                ty_of(func, *dest)
            )
        }
        AllocExistentialBox { dest, concrete } => {
            format!("{dest} = alloc_existential_box {}, ${concrete}", ty_of(func, *dest))
        }
        ProjectExistentialBox { dest, operand } => format!(
            "{dest} = project_existential_box {} in {}",
            address_referent(func, *dest),
            typed(func, *operand)
        ),
        Upcast { dest, operand } => {
            format!("{dest} = upcast {} to {}", typed(func, *operand), ty_of(func, *dest))
        }
        UncheckedRefCast { dest, operand } => format!(
            "{dest} = unchecked_ref_cast {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        PointerToAddress { dest, pointer } => format!(
            "{dest} = pointer_to_address {} to [strict] {}",
            typed(func, *pointer),
            ty_of(func, *dest)
        ),
        AddressToPointer { dest, address } => format!(
            "{dest} = address_to_pointer {} to {}",
            typed(func, *address),
            ty_of(func, *dest)
        ),
        ThinFunctionToPointer { dest, operand } => format!(
            "{dest} = thin_function_to_pointer {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        PointerToThinFunction { dest, operand } => format!(
            "{dest} = pointer_to_thin_function {} to {}",
            typed(func, *operand),
            ty_of(func, *dest)
        ),
        StrongPin { dest, operand } => format!("{dest} = strong_pin {}", typed(func, *operand)),
        StrongUnpin { operand } => format!("strong_unpin {}", typed(func, *operand)),
        ProjectBlockStorage { dest, storage } => {
            format!("{dest} = project_block_storage {}", typed(func, *storage))
        }
        InitBlockStorageHeader {
            dest,
            storage,
            invoke,
        } => format!(
            "{dest} = init_block_storage_header {}, invoke {}, type {}",
            typed(func, *storage),
            typed(func, *invoke),
            ty_of(func, *dest)
        ),
        CopyBlock { dest, operand } => format!("{dest} = copy_block {}", typed(func, *operand)),
        CondFail { operand, message } => {
            format!("cond_fail {}, \"{message}\"", typed(func, *operand))
        }
    }
}

fn format_terminator(func: &MirFunction, term: &Terminator) -> String {
    match term {
        Terminator::Return(v) => format!("return {}", typed(func, *v)),
        Terminator::Throw(v) => format!("throw {}", typed(func, *v)),
        Terminator::Br { target, args } => {
            if args.is_empty() {
                format!("br {target}")
            } else {
                let args: Vec<_> = args.iter().map(|a| typed(func, *a)).collect();
                format!("br {target}({})", args.join(", "))
            }
        }
        Terminator::CondBr {
            cond,
            then_target,
            else_target,
        } => format!("cond_br {cond}, {then_target}, {else_target}"),
        Terminator::SwitchEnum {
            operand,
            cases,
            default,
        } => format!(
            "switch_enum {}{}",
            typed(func, *operand),
            format_cases(cases, default.as_deref())
        ),
        Terminator::SwitchEnumAddr {
            address,
            cases,
            default,
        } => format!(
            "switch_enum_addr {}{}",
            typed(func, *address),
            format_cases(cases, default.as_deref())
        ),
        Terminator::TryApply {
            callee,
            args,
            normal,
            error,
        } => format!(
            "try_apply {callee}({}) : {}, normal {normal}, error {error}",
            join_values(args),
            ty_of(func, *callee)
        ),
        Terminator::CheckedCastBranch {
            operand,
            ty,
            success,
            failure,
        } => format!(
            "checked_cast_br {} to ${ty}, {success}, {failure}",
            typed(func, *operand)
        ),
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

fn format_cases(cases: &[(CaseRef, String)], default: Option<&str>) -> String {
    let mut out = String::new();
    for (case, label) in cases {
        out.push_str(&format!(", case {case}: {label}"));
    }
    if let Some(label) = default {
        out.push_str(&format!(", default {label}"));
    }
    out
}

fn join_values(values: &[Value]) -> String {
    values.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for LoweredSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.generic_params.is_empty() {
            write!(f, "<{}> ", self.generic_params.join(", "))?;
        }
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let prefix = match param.convention {
                ArgConvention::Trivial => "",
                ArgConvention::Owned => "@owned ",
                ArgConvention::Guaranteed => "@guaranteed ",
                ArgConvention::In => "@in ",
                ArgConvention::InGuaranteed => "@in_guaranteed ",
                ArgConvention::InOut => "@inout ",
                ArgConvention::InoutAliasable => "@inout_aliasable ",
            };
            write!(f, "{prefix}{}", param.ty)?;
        }
        write!(f, ") -> ")?;
        let result = match self.result.convention {
            ResultConvention::Unowned => format!("{}", self.result.ty),
            ResultConvention::Owned => format!("@owned {}", self.result.ty),
            ResultConvention::Indirect => format!("@out {}", self.result.ty),
        };
        if self.throws {
            write!(f, "({result}, @error Error)")
        } else {
            write!(f, "{result}")
        }
    }
}
