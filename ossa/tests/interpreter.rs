//! Lowered modules executed by the reference interpreter
//!
//! These check the runtime properties lowering has to preserve: balanced
//! reference counts, one-time global initialization, accessor round trips
//! and witness dispatch.

mod common;

use common::*;
use ossa::ast::*;
use ossa::interp::{Interpreter, Outcome, RtValue, TrapKind};

fn counter_class() -> ClassDecl {
    class("Counter", vec![stored("x", Type::Int)], vec![])
}

fn new_counter(value: i64) -> Stmt {
    Stmt::Let {
        pattern: Pattern::Named("c".into()),
        init: Expr::construct(named("Counter"), vec![Expr::int(value)]),
    }
}

fn counter_x() -> Expr {
    Expr::member(Expr::var("c", named("Counter")), "x", Type::Int)
}

fn class_module(body: Vec<Stmt>) -> Module {
    Module {
        name: "classes".into(),
        classes: vec![counter_class()],
        functions: vec![func("test", vec![], Type::Int, body)],
        ..Default::default()
    }
}

#[test]
fn test_global_initializer_runs_once() {
    let mir = lower(&global_module());
    let mut interp = Interpreter::new(&mir);
    assert_eq!(interp.run("bump").unwrap().as_int(), Some(8));
    assert_eq!(interp.run("bump").unwrap().as_int(), Some(9));
    assert_eq!(interp.global("counter").unwrap().as_int(), Some(9));
    assert!(interp.leak_report().is_clean());
}

#[test]
fn test_get_then_set_leaves_property_unchanged() {
    let module = class_module(vec![
        new_counter(5),
        Stmt::Expr(Expr::assign(counter_x(), counter_x())),
        ret(counter_x()),
    ]);
    let mir = lower(&module);
    let mut interp = Interpreter::new(&mir);
    assert_eq!(interp.run("test").unwrap().as_int(), Some(5));
    let report = interp.leak_report();
    assert!(report.is_clean(), "{report}");
    let stats = interp.stats();
    assert_eq!(stats.objects_allocated, 1);
    assert_eq!(stats.objects_freed, 1);
}

#[test]
fn test_modify_without_change_is_identity() {
    let module = class_module(vec![
        new_counter(5),
        Stmt::Expr(Expr::compound_assign(BinOp::Add, counter_x(), Expr::int(0))),
        ret(counter_x()),
    ]);
    let mir = lower(&module);
    let mut interp = Interpreter::new(&mir);
    assert_eq!(interp.run("test").unwrap().as_int(), Some(5));
    assert!(interp.leak_report().is_clean());
}

#[test]
fn test_compound_assign_updates_class_property() {
    let module = class_module(vec![
        new_counter(5),
        Stmt::Expr(Expr::compound_assign(BinOp::Add, counter_x(), Expr::int(3))),
        ret(counter_x()),
    ]);
    let mir = lower(&module);
    let mut interp = Interpreter::new(&mir);
    assert_eq!(interp.run("test").unwrap().as_int(), Some(8));
    assert!(interp.leak_report().is_clean());
}

#[test]
fn test_overflow_in_compound_assign_traps() {
    let module = class_module(vec![
        new_counter(i64::MAX),
        Stmt::Expr(Expr::compound_assign(BinOp::Add, counter_x(), Expr::int(1))),
        ret(counter_x()),
    ]);
    let mir = lower(&module);
    let mut interp = Interpreter::new(&mir);
    let err = interp.run("test").unwrap_err();
    assert_eq!(err.kind, TrapKind::ConditionFailed);
}

// ============================================
// Addressors
// ============================================

fn returned(outcome: Outcome) -> RtValue {
    match outcome {
        Outcome::Return(value) => value,
        Outcome::Throw(error) => panic!("unexpected throw of {error}"),
    }
}

#[test]
fn test_struct_addressor_reads_back_written_value() {
    let mir = lower(&addressor_readback_module());
    let mut interp = Interpreter::new(&mir);
    let result = returned(interp.call("test", vec![RtValue::Int(7)]).unwrap());
    assert_eq!(result.as_int(), Some(7));
    let report = interp.leak_report();
    assert!(report.is_clean(), "{report}");
}

#[test]
fn test_class_addressors_read_back_without_leaks() {
    for kind in [AddressorKind::Unsafe, AddressorKind::NativeOwner, AddressorKind::PinnedNativeOwner] {
        let mir = lower(&class_addressor_module(kind));
        let mut interp = Interpreter::new(&mir);
        assert_eq!(interp.run("read_back").unwrap().as_int(), Some(7), "{kind:?}");
        let report = interp.leak_report();
        assert!(report.is_clean(), "{kind:?}: {report}");
        let stats = interp.stats();
        assert_eq!(stats.objects_allocated, 1, "{kind:?}");
        assert_eq!(stats.objects_freed, 1, "{kind:?}");
    }
}

#[test]
fn test_pinned_owner_released_when_callee_throws() {
    let mir = lower(&class_addressor_module(AddressorKind::PinnedNativeOwner));
    let mut interp = Interpreter::new(&mir);
    let error = match interp.call("touch_through", Vec::new()).unwrap() {
        Outcome::Throw(error) => error,
        Outcome::Return(value) => panic!("expected a throw, got {value}"),
    };
    interp.destroy(error).unwrap();
    let report = interp.leak_report();
    assert!(report.is_clean(), "{report}");
    // the buffer and the error box
    let stats = interp.stats();
    assert_eq!(stats.objects_allocated, 2);
    assert_eq!(stats.objects_freed, 2);
}

#[test]
fn test_try_optional_success_releases_everything() {
    let mir = lower(&try_tuple_module());
    let mut interp = Interpreter::new(&mir);
    interp.run("test").unwrap();
    let report = interp.leak_report();
    assert!(report.is_clean(), "{report}");
    let stats = interp.stats();
    assert_eq!(stats.objects_allocated, 2);
    assert_eq!(stats.objects_freed, 2);
}

/// `(try f1(), try f2(), try f3(), try f4())` where `f3` throws
fn unwinding_module() -> Module {
    let c = named("C");
    let make = |name: &str| throwing(func(name, vec![], c.clone(), vec![ret(Expr::construct(c.clone(), vec![]))]));
    let fail = throwing(func(
        "f3",
        vec![],
        c.clone(),
        vec![Stmt::Throw(Expr::erase(Expr::construct(named("E"), vec![]), Type::error()))],
    ));
    let calls = ["f1", "f2", "f3", "f4"]
        .iter()
        .map(|name| Expr::try_(TryMode::Plain, Expr::call(*name, vec![], c.clone())))
        .collect();
    let all = Expr::tuple(calls);
    let result = all.ty.clone();
    Module {
        name: "unwind".into(),
        structs: vec![structure("E", vec![])],
        classes: vec![class("C", vec![], vec![])],
        functions: vec![
            make("f1"),
            make("f2"),
            fail,
            make("f4"),
            throwing(func("test", vec![], result, vec![ret(all)])),
        ],
        ..Default::default()
    }
}

#[test]
fn test_error_unwind_releases_earlier_results() {
    let mir = lower(&unwinding_module());
    let mut interp = Interpreter::new(&mir);
    let error = match interp.call("test", Vec::new()).unwrap() {
        Outcome::Throw(error) => error,
        Outcome::Return(value) => panic!("expected a throw, got {value}"),
    };
    assert!(interp.is_alive(&error));
    interp.destroy(error).unwrap();

    let report = interp.leak_report();
    assert!(report.is_clean(), "{report}");
    // two instances and the error box; f4 never ran
    let stats = interp.stats();
    assert_eq!(stats.objects_allocated, 3);
    assert_eq!(stats.objects_freed, 3);
}

#[test]
fn test_uncaught_error_is_a_trap() {
    let mir = lower(&unwinding_module());
    let mut interp = Interpreter::new(&mir);
    let err = interp.run("test").unwrap_err();
    assert_eq!(err.kind, TrapKind::UncaughtError);
}

/// `protocol P { func value() -> Int }` satisfied by `struct S { n }`, with
/// a generic caller and a direct one
fn witness_module() -> Module {
    let s = named("S");
    let mut decl = structure("S", vec![stored("n", Type::Int)]);
    decl.methods.push(func(
        "value",
        vec![],
        Type::Int,
        vec![ret(Expr::member(Expr::var("self", s.clone()), "n", Type::Int))],
    ));

    let t = Type::Param("T".into());
    let mut via = func(
        "via",
        vec![param("t", t.clone())],
        Type::Int,
        vec![ret(Expr::new(
            ExprKind::Call {
                callee: Callee::Witness {
                    base: Box::new(Expr::var("t", t)),
                    protocol: "P".into(),
                    requirement: "value".into(),
                },
                args: vec![],
            },
            Type::Int,
        ))],
    );
    via.generic_params.push(GenericParam {
        name: "T".into(),
        conforms_to: vec!["P".into()],
    });

    let make_s = || Expr::construct(s.clone(), vec![Expr::int(4)]);
    Module {
        name: "witnesses".into(),
        structs: vec![decl],
        protocols: vec![ProtocolDecl {
            name: "P".into(),
            requirements: vec![Requirement {
                name: "value".into(),
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
            ty: s.clone(),
            protocol: "P".into(),
            witnesses: vec![],
            associated_types: vec![],
        }],
        functions: vec![
            via,
            func("generic", vec![], Type::Int, vec![ret(Expr::call("via", vec![make_s()], Type::Int))]),
            func(
                "direct",
                vec![],
                Type::Int,
                vec![ret(Expr::method(make_s(), "value", vec![], Type::Int))],
            ),
        ],
        ..Default::default()
    }
}

#[test]
fn test_witness_thunk_matches_direct_call() {
    let mir = lower(&witness_module());
    assert!(mir.function("protocol witness for P.value in S").is_some_and(|f| f.is_thunk));

    let mut interp = Interpreter::new(&mir);
    let generic = interp.run("generic").unwrap();
    let direct = interp.run("direct").unwrap();
    assert_eq!(generic.as_int(), Some(4));
    assert_eq!(generic.as_int(), direct.as_int());
    assert!(interp.leak_report().is_clean());
}

// ============================================
// Lowered features end to end
// ============================================

fn assert_clean(interp: &Interpreter) {
    let report = interp.leak_report();
    assert!(report.is_clean(), "{report}");
}

fn thrown(outcome: Outcome) -> RtValue {
    match outcome {
        Outcome::Throw(error) => error,
        Outcome::Return(value) => panic!("expected a throw, got {value}"),
    }
}

#[test]
fn test_address_only_enum_payloads_are_released() {
    let mir = lower(&shape_module());
    let mut interp = Interpreter::new(&mir);
    assert_eq!(interp.run("make_shape").unwrap().as_int(), Some(1));
    assert_clean(&interp);
}

#[test]
fn test_tuple_patterns_release_every_element() {
    for name in ["keep_first", "skip_all"] {
        let mir = lower(&pair_loop_module());
        let mut interp = Interpreter::new(&mir);
        assert_eq!(interp.run(name).unwrap().as_int(), Some(0), "{name}");
        assert_clean(&interp);
        let stats = interp.stats();
        assert_eq!(stats.objects_allocated, 4, "{name}");
        assert_eq!(stats.objects_freed, 4, "{name}");
    }
}

#[test]
fn test_materialize_for_set_writes_back_through_setter() {
    for name in ["bump_reading", "bump_wide"] {
        let mir = lower(&meter_module());
        let mut interp = Interpreter::new(&mir);
        assert_eq!(interp.run(name).unwrap().as_int(), Some(7), "{name}");
        assert_clean(&interp);
    }
}

#[test]
fn test_closures_share_captured_state() {
    let mir = lower(&closure_module());
    for (name, expected) in [("stack_counter", 5), ("boxed_counter", 5), ("reabstract", 4), ("bridge", 4)] {
        let mut interp = Interpreter::new(&mir);
        assert_eq!(interp.run(name).unwrap().as_int(), Some(expected), "{name}");
        let report = interp.leak_report();
        assert!(report.is_clean(), "{name}: {report}");
    }
}

#[test]
fn test_catch_clauses_select_by_error_type() {
    let mir = lower(&catch_module());
    let mut interp = Interpreter::new(&mir);
    let mut classify = |which: i64| interp.call("classify", vec![RtValue::Int(which)]).unwrap();
    assert_eq!(returned(classify(1)).as_int(), Some(10));
    assert_eq!(returned(classify(2)).as_int(), Some(2));
    assert_eq!(returned(classify(0)).as_int(), Some(0));
    let error = thrown(classify(3));
    assert!(interp.is_alive(&error));
    interp.destroy(error).unwrap();
    assert_clean(&interp);
}

#[test]
fn test_catch_all_handles_remaining_errors() {
    let mir = lower(&catch_module());
    let mut interp = Interpreter::new(&mir);
    let all = returned(interp.call("classify_all", vec![RtValue::Int(3)]).unwrap());
    assert_eq!(all.as_int(), Some(99));
    let typed = returned(interp.call("classify_all", vec![RtValue::Int(1)]).unwrap());
    assert_eq!(typed.as_int(), Some(10));
    let first = returned(interp.call("catch_all_first", vec![RtValue::Int(1)]).unwrap());
    assert_eq!(first.as_int(), Some(1));
    assert_clean(&interp);
}

#[test]
fn test_try_optional_unwinds_three_results() {
    let mir = lower(&try_triple_module());
    let mut interp = Interpreter::new(&mir);
    interp.run("test").unwrap();
    assert_clean(&interp);
    // f and g results plus the error box
    let stats = interp.stats();
    assert_eq!(stats.objects_allocated, 3);
    assert_eq!(stats.objects_freed, 3);
}

#[test]
fn test_distinct_inout_arguments_swap() {
    let mir = lower(&exclusivity_module());
    let mut interp = Interpreter::new(&mir);
    assert_eq!(interp.run("distinct_locals").unwrap().as_int(), Some(21));
}

#[test]
fn test_overlapping_dynamic_access_traps() {
    let mir = lower(&exclusivity_module());
    for name in ["same_global", "same_property"] {
        let mut interp = Interpreter::new(&mir);
        let err = interp.run(name).unwrap_err();
        assert_eq!(err.kind, TrapKind::ExclusivityViolation, "{name}");
    }
}
