//! Property tests over randomly generated mutation sequences

mod common;

use common::*;
use ossa::ast::*;
use ossa::interp::Interpreter;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Target {
    Local,
    Global,
    Property,
}

fn target_strategy() -> impl Strategy<Value = Target> {
    prop_oneof![Just(Target::Local), Just(Target::Global), Just(Target::Property)]
}

fn lvalue(target: Target) -> Expr {
    match target {
        Target::Local => Expr::var("local", Type::Int),
        Target::Global => Expr::global("g", Type::Int),
        Target::Property => Expr::member(Expr::var("c", named("Counter")), "x", Type::Int),
    }
}

/// Applies `target += amount` for every step, then returns the sum of all
/// three targets
fn mutation_module(steps: &[(Target, i64)]) -> Module {
    let mut body = vec![
        Stmt::Var {
            name: "local".into(),
            init: Expr::int(0),
        },
        Stmt::Let {
            pattern: Pattern::Named("c".into()),
            init: Expr::construct(named("Counter"), vec![Expr::int(0)]),
        },
    ];
    for (target, amount) in steps {
        body.push(Stmt::Expr(Expr::compound_assign(BinOp::Add, lvalue(*target), Expr::int(*amount))));
    }
    let sum = Expr::binary(
        BinOp::Add,
        Expr::binary(BinOp::Add, lvalue(Target::Local), lvalue(Target::Global)),
        lvalue(Target::Property),
    );
    body.push(ret(sum));

    Module {
        name: "mutations".into(),
        classes: vec![class("Counter", vec![stored("x", Type::Int)], vec![])],
        globals: vec![GlobalDecl {
            name: "g".into(),
            ty: Type::Int,
            initial: Expr::int(0),
            span: Span::default(),
        }],
        functions: vec![func("test", vec![], Type::Int, body)],
        ..Default::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn access_scopes_balance(steps in prop::collection::vec((target_strategy(), -100i64..100), 0..12)) {
        let mir = lower(&mutation_module(&steps));
        for func in &mir.functions {
            prop_assert_eq!(func.count("begin_access"), func.count("end_access"), "{}", func.name);
        }
    }

    #[test]
    fn mutations_sum_and_release(steps in prop::collection::vec((target_strategy(), -100i64..100), 0..12)) {
        let mir = lower(&mutation_module(&steps));
        let mut interp = Interpreter::new(&mir);
        let expected: i64 = steps.iter().map(|(_, amount)| amount).sum();
        let result = interp.run("test").map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(result.as_int(), Some(expected));
        prop_assert!(interp.leak_report().is_clean());
    }
}
