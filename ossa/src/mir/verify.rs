//! Structural verification of lowered functions
//!
//! A function passes when
//! - every value is defined once and every operand has a definition
//! - branches pass as many arguments as their target block takes
//! - along every path, access scopes and stack allocations close in reverse
//!   order of opening and borrows end before the function exits
//! - blocks reached along several paths agree on what is open

use super::*;
use crate::error::{CompileError, Result};
use std::collections::{HashMap, HashSet};

/// Verify every function and check that function references resolve
pub fn verify_module(module: &MirModule) -> Result<()> {
    let _span = tracing::debug_span!("verify_module", module = %module.name).entered();
    let mut names = HashSet::new();
    for func in &module.functions {
        if !names.insert(func.name.as_str()) {
            return Err(CompileError::verify(&func.name, "function is defined twice"));
        }
    }
    for func in &module.functions {
        verify_function(func)?;
        for inst in func.instructions() {
            if let MirInst::FunctionRef { function, .. } = inst {
                if !names.contains(function.as_str()) {
                    return Err(CompileError::verify(
                        &func.name,
                        format!("function_ref to undefined @{function}"),
                    ));
                }
            }
        }
    }
    tracing::debug!(functions = module.functions.len(), "module verified");
    Ok(())
}

pub fn verify_function(func: &MirFunction) -> Result<()> {
    let checker = Checker::new(func)?;
    checker.check_definitions()?;
    checker.check_arity()?;
    checker.check_scopes()
}

/// Scopes open at a program point, innermost last
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OpenState {
    accesses: Vec<Value>,
    stack: Vec<Value>,
    borrows: Vec<Value>,
}

impl OpenState {
    fn is_empty(&self) -> bool {
        self.accesses.is_empty() && self.stack.is_empty() && self.borrows.is_empty()
    }
}

impl fmt::Display for OpenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |values: &[Value]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
        write!(
            f,
            "accesses [{}], stack [{}], borrows [{}]",
            list(&self.accesses),
            list(&self.stack),
            list(&self.borrows)
        )
    }
}

struct Checker<'f> {
    func: &'f MirFunction,
    blocks: HashMap<&'f str, &'f BasicBlock>,
}

impl<'f> Checker<'f> {
    fn new(func: &'f MirFunction) -> Result<Self> {
        let mut blocks = HashMap::new();
        for block in &func.blocks {
            if blocks.insert(block.label.as_str(), block).is_some() {
                return Err(CompileError::verify(
                    &func.name,
                    format!("block {} is defined twice", block.label),
                ));
            }
        }
        Ok(Checker { func, blocks })
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::verify(&self.func.name, message)
    }

    fn entry(&self) -> Result<&'f BasicBlock> {
        self.func.blocks.first().ok_or_else(|| self.error("function has no blocks"))
    }

    fn check_definitions(&self) -> Result<()> {
        let func = self.func;
        if self.entry()?.args != func.params {
            return Err(self.error("entry block arguments differ from the parameters"));
        }
        let mut defined = HashSet::new();
        let definitions = func.blocks.iter().flat_map(|b| {
            b.args
                .iter()
                .copied()
                .chain(b.instructions.iter().filter_map(MirInst::dest))
        });
        for value in definitions {
            if func.value_info(value).is_none() {
                return Err(self.error(format!("{value} has no type")));
            }
            if !defined.insert(value) {
                return Err(self.error(format!("{value} is defined twice")));
            }
        }
        for block in &func.blocks {
            let used = block
                .instructions
                .iter()
                .flat_map(MirInst::operands)
                .chain(block.terminator.operands());
            for value in used {
                if !defined.contains(&value) {
                    return Err(self.error(format!("{value} is used in {} but never defined", block.label)));
                }
            }
        }
        Ok(())
    }

    fn target(&self, label: &str) -> Result<&'f BasicBlock> {
        self.blocks
            .get(label)
            .copied()
            .ok_or_else(|| self.error(format!("branch to undefined block {label}")))
    }

    fn expect_args(&self, from: &str, label: &str, allowed: &[usize]) -> Result<()> {
        let target = self.target(label)?;
        if allowed.contains(&target.args.len()) {
            return Ok(());
        }
        Err(self.error(format!(
            "{from} branches to {label} with {allowed:?} arguments but it takes {}",
            target.args.len()
        )))
    }

    fn check_arity(&self) -> Result<()> {
        for block in &self.func.blocks {
            let from = block.label.as_str();
            match &block.terminator {
                Terminator::Return(_) | Terminator::Throw(_) | Terminator::Unreachable => {}
                Terminator::Br { target, args } => self.expect_args(from, target, &[args.len()])?,
                Terminator::CondBr {
                    then_target,
                    else_target,
                    ..
                } => {
                    self.expect_args(from, then_target, &[0])?;
                    self.expect_args(from, else_target, &[0])?;
                }
                Terminator::SwitchEnum { cases, default, .. } => {
                    for (_, label) in cases {
                        self.expect_args(from, label, &[0, 1])?;
                    }
                    if let Some(label) = default {
                        self.expect_args(from, label, &[0])?;
                    }
                }
                Terminator::SwitchEnumAddr { cases, default, .. } => {
                    for label in cases.iter().map(|(_, l)| l).chain(default) {
                        self.expect_args(from, label, &[0])?;
                    }
                }
                Terminator::TryApply { normal, error, .. } => {
                    self.expect_args(from, normal, &[1])?;
                    self.expect_args(from, error, &[1])?;
                }
                Terminator::CheckedCastBranch { success, failure, .. } => {
                    self.expect_args(from, success, &[1])?;
                    self.expect_args(from, failure, &[0])?;
                }
            }
        }
        Ok(())
    }

    /// Walk every path from the entry, tracking the open scopes
    fn check_scopes(&self) -> Result<()> {
        let mut seen: HashMap<&str, OpenState> = HashMap::new();
        let mut work = vec![(self.entry()?.label.as_str(), OpenState::default())];
        while let Some((label, state)) = work.pop() {
            if let Some(previous) = seen.get(label) {
                if *previous != state {
                    return Err(self.error(format!(
                        "paths into {label} disagree: {previous} versus {state}"
                    )));
                }
                continue;
            }
            seen.insert(label, state.clone());
            let block = self.target(label)?;
            let mut state = state;
            for inst in &block.instructions {
                self.step(&mut state, inst, label)?;
            }
            if matches!(block.terminator, Terminator::Return(_) | Terminator::Throw(_)) && !state.is_empty() {
                return Err(self.error(format!("{label} exits with open scopes: {state}")));
            }
            for successor in block.terminator.successors() {
                work.push((successor, state.clone()));
            }
        }
        tracing::trace!(function = %self.func.name, blocks = seen.len(), "scopes balanced");
        Ok(())
    }

    fn step(&self, state: &mut OpenState, inst: &MirInst, label: &str) -> Result<()> {
        match inst {
            MirInst::BeginAccess { dest, .. } => state.accesses.push(*dest),
            MirInst::EndAccess { access } => {
                if state.accesses.last() != Some(access) {
                    return Err(self.error(format!(
                        "end_access {access} in {label} does not close the innermost access ({state})"
                    )));
                }
                state.accesses.pop();
            }
            MirInst::AllocStack { dest } | MirInst::PartialApply { dest, on_stack: true, .. } => {
                state.stack.push(*dest)
            }
            MirInst::DeallocStack { operand } => {
                if state.stack.last() != Some(operand) {
                    return Err(self.error(format!(
                        "dealloc_stack {operand} in {label} is not the last stack allocation ({state})"
                    )));
                }
                state.stack.pop();
            }
            MirInst::LoadBorrow { dest, .. } | MirInst::BeginBorrow { dest, .. } => state.borrows.push(*dest),
            MirInst::EndBorrow { borrowed, .. } => {
                let Some(position) = state.borrows.iter().position(|b| b == borrowed) else {
                    return Err(self.error(format!("end_borrow of {borrowed} in {label} without a borrow")));
                };
                state.borrows.remove(position);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LoweredResult, LoweredSignature, ResultConvention};

    fn block(label: &str, args: Vec<u32>, instructions: Vec<MirInst>, terminator: Terminator) -> BasicBlock {
        BasicBlock {
            label: label.to_string(),
            args: args.into_iter().map(Value).collect(),
            instructions,
            terminator,
        }
    }

    fn function(blocks: Vec<BasicBlock>, values: usize) -> MirFunction {
        let sig = LoweredSignature {
            generic_params: Vec::new(),
            params: Vec::new(),
            result: LoweredResult {
                ty: Type::unit(),
                convention: ResultConvention::Unowned,
            },
            throws: false,
        };
        MirFunction {
            name: "f".into(),
            ty: LoweredFunctionType::new(FnConvention::Thin, sig),
            params: Vec::new(),
            blocks,
            values: (0..values)
                .map(|_| ValueInfo {
                    ty: MirType::Object(Type::Int),
                    ownership: Ownership::Trivial,
                })
                .collect(),
            is_thunk: false,
        }
    }

    fn access(dest: u32, address: u32) -> MirInst {
        MirInst::BeginAccess {
            dest: Value(dest),
            address: Value(address),
            kind: AccessKind::Modify,
            enforcement: Enforcement::Static,
        }
    }

    fn unit(dest: u32) -> MirInst {
        MirInst::Tuple {
            dest: Value(dest),
            elements: Vec::new(),
        }
    }

    #[test]
    fn test_balanced_scopes_pass() {
        let f = function(
            vec![block(
                "bb0",
                vec![],
                vec![
                    MirInst::AllocStack { dest: Value(0) },
                    access(1, 0),
                    MirInst::EndAccess { access: Value(1) },
                    MirInst::DeallocStack { operand: Value(0) },
                    unit(2),
                ],
                Terminator::Return(Value(2)),
            )],
            3,
        );
        assert!(verify_function(&f).is_ok());
    }

    #[test]
    fn test_crossed_accesses_rejected() {
        let f = function(
            vec![block(
                "bb0",
                vec![],
                vec![
                    MirInst::AllocStack { dest: Value(0) },
                    access(1, 0),
                    access(2, 0),
                    MirInst::EndAccess { access: Value(1) },
                    MirInst::EndAccess { access: Value(2) },
                    MirInst::DeallocStack { operand: Value(0) },
                    unit(3),
                ],
                Terminator::Return(Value(3)),
            )],
            4,
        );
        let err = verify_function(&f).unwrap_err();
        assert!(err.message().contains("innermost"), "{err}");
    }

    #[test]
    fn test_leaked_stack_allocation_rejected() {
        let f = function(
            vec![block(
                "bb0",
                vec![],
                vec![MirInst::AllocStack { dest: Value(0) }, unit(1)],
                Terminator::Return(Value(1)),
            )],
            2,
        );
        let err = verify_function(&f).unwrap_err();
        assert!(err.message().contains("open scopes"), "{err}");
    }

    #[test]
    fn test_merge_with_different_state_rejected() {
        let f = function(
            vec![
                block(
                    "bb0",
                    vec![],
                    vec![
                        MirInst::AllocStack { dest: Value(0) },
                        MirInst::IntegerLiteral {
                            dest: Value(1),
                            value: 1,
                        },
                    ],
                    Terminator::CondBr {
                        cond: Value(1),
                        then_target: "bb1".into(),
                        else_target: "bb2".into(),
                    },
                ),
                block(
                    "bb1",
                    vec![],
                    vec![MirInst::DeallocStack { operand: Value(0) }],
                    Terminator::Br {
                        target: "bb2".into(),
                        args: vec![],
                    },
                ),
                block("bb2", vec![], vec![unit(2)], Terminator::Return(Value(2))),
            ],
            3,
        );
        let err = verify_function(&f).unwrap_err();
        assert!(err.message().contains("disagree") || err.message().contains("open scopes"), "{err}");
    }

    #[test]
    fn test_branch_arity_checked() {
        let f = function(
            vec![
                block(
                    "bb0",
                    vec![],
                    vec![unit(0)],
                    Terminator::Br {
                        target: "bb1".into(),
                        args: vec![Value(0)],
                    },
                ),
                block("bb1", vec![], vec![unit(1)], Terminator::Return(Value(1))),
            ],
            2,
        );
        let err = verify_function(&f).unwrap_err();
        assert!(err.message().contains("takes 0"), "{err}");
    }

    #[test]
    fn test_undefined_operand_rejected() {
        let f = function(
            vec![block("bb0", vec![], vec![], Terminator::Return(Value(4)))],
            5,
        );
        let err = verify_function(&f).unwrap_err();
        assert!(err.message().contains("never defined"), "{err}");
    }
}
