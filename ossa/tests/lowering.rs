//! End-to-end lowering tests
//!
//! Each test builds a declaration graph, lowers it and matches the printed
//! IR against check directives.

mod common;

use common::*;
use ossa::ast::*;
use ossa::config::{EnforcementMode, LoweringConfig};
use ossa::filecheck;
use ossa::format_module;

fn assert_checks(checks: &str, module: &Module) {
    let text = format_module(&lower(module));
    if let Err(e) = filecheck::check(checks, &text) {
        panic!("{e}\n--- lowered module ---\n{text}");
    }
}

// ============================================
// Accessors and access scopes
// ============================================

#[test]
fn test_compound_assign_through_unsafe_addressor() {
    let checks = r#"
// CHECK-LABEL: sil @test
// CHECK: integer_literal $Int, 5
// CHECK: [[ACC:%[0-9]+]] = begin_access [modify] [static]
// CHECK: function_ref @A.subscript!unsafeMutableAddressor
// CHECK: apply
// CHECK: struct_extract {{.*}}._rawValue
// CHECK-NEXT: [[ADDR:%[0-9]+]] = pointer_to_address
// CHECK: [[OLD:%[0-9]+]] = load [trivial] [[ADDR]]
// CHECK: builtin "sadd_with_overflow_Int32"([[OLD]] : $Int32
// CHECK: cond_fail {{.*}}"arithmetic overflow"
// CHECK: store {{%[0-9]+}} to [trivial] [[ADDR]]
// CHECK: end_access [[ACC]]
"#;
    assert_checks(checks, &addressor_module());
}

#[test]
fn test_addressors_are_emitted_for_both_access_kinds() {
    let mir = lower(&addressor_module());
    assert!(mir.function("A.subscript!unsafeAddressor").is_some());
    assert!(mir.function("A.subscript!unsafeMutableAddressor").is_some());
}

#[test]
fn test_every_access_scope_is_closed() {
    let mir = lower(&addressor_module());
    for func in &mir.functions {
        assert_eq!(
            func.count("begin_access"),
            func.count("end_access"),
            "unbalanced access scopes in {}",
            func.name
        );
    }
}

#[test]
fn test_struct_read_addressor_borrows_caller_storage() {
    let checks = r#"
// CHECK-LABEL: sil @A.subscript!unsafeAddressor : $@convention(method) (Int, @in_guaranteed A)
// CHECK-NOT: alloc_stack
// CHECK: struct_element_addr {{%[0-9]+}} : $*A, #A.storage
// CHECK: address_to_pointer
// CHECK-LABEL: sil @A.subscript!unsafeMutableAddressor : $@convention(method) (Int, @inout A)
// CHECK-LABEL: sil @test
// CHECK: [[READ:%[0-9]+]] = begin_access [read] [static] {{%[0-9]+}} : $*A
// CHECK: function_ref @A.subscript!unsafeAddressor
// CHECK: apply {{%[0-9]+}}({{%[0-9]+}}, [[READ]])
// CHECK-NOT: end_access [[READ]]
// CHECK: load [trivial]
// CHECK: end_access [[READ]]
"#;
    assert_checks(checks, &addressor_readback_module());
}

#[test]
fn test_class_addressor_projects_stored_field_directly() {
    let checks = r#"
// CHECK-LABEL: sil @Buf.subscript!unsafeAddressor : $@convention(method) (Int, @guaranteed Buf)
// CHECK-NOT: class_method
// CHECK-NOT: alloc_stack
// CHECK: ref_element_addr {{%[0-9]+}} : $Buf, #Buf.storage
// CHECK-NEXT: begin_access [read] [dynamic]
// CHECK: address_to_pointer
// CHECK-LABEL: sil @Buf.subscript!unsafeMutableAddressor
// CHECK-NOT: class_method
// CHECK: ref_element_addr {{%[0-9]+}} : $Buf, #Buf.storage
// CHECK-NEXT: begin_access [modify] [dynamic]
"#;
    assert_checks(checks, &class_addressor_module(AddressorKind::NativeOwner));
}

#[test]
fn test_address_of_temporary_is_rejected() {
    let a = named("A");
    let pointer = Type::UnsafePointer(Box::new(Type::Int32));
    let mut module = addressor_module();
    module.functions.push(func(
        "make",
        vec![],
        a.clone(),
        vec![ret(Expr::construct(a.clone(), vec![Expr::int32(1)]))],
    ));
    let temporary = Expr::member(Expr::call("make", vec![], a), "storage", Type::Int32);
    module.functions.push(func(
        "escape",
        vec![],
        pointer.clone(),
        vec![ret(Expr::new(ExprKind::AddressOf(Box::new(temporary)), pointer))],
    ));
    let err = ossa::lower_module(&module, &LoweringConfig::default()).unwrap_err();
    assert!(err.to_string().contains("cannot take the address of a temporary"), "{err}");
}

#[test]
fn test_pinned_owner_is_unpinned_on_error_edge() {
    let checks = r#"
// CHECK-LABEL: sil @touch_through
// CHECK: function_ref @Buf.subscript!unsafeMutableAddressor
// CHECK: function_ref @touch
// CHECK: try_apply
// CHECK-NEXT: ([[ERR:%[0-9]+]] : @owned $Error):
// CHECK-NEXT: strong_unpin
// CHECK: br {{bb[0-9]+}}([[ERR]]
// CHECK: strong_unpin
// CHECK: return
"#;
    assert_checks(checks, &class_addressor_module(AddressorKind::PinnedNativeOwner));
}

#[test]
fn test_global_access_is_dynamic_by_default() {
    let checks = r#"
// CHECK-LABEL: sil @bump
// CHECK: function_ref @counter!unsafeMutableAddressor
// CHECK: pointer_to_address
// CHECK: begin_access [modify] [dynamic]
// CHECK: end_access
// CHECK: begin_access [read] [dynamic]
"#;
    assert_checks(checks, &global_module());
}

#[test]
fn test_unchecked_mode_marks_accesses_unsafe() {
    let config = LoweringConfig {
        enforcement: EnforcementMode::Unchecked,
        ..Default::default()
    };
    let text = format_module(&lower_with(&global_module(), &config));
    let checks = r#"
// CHECK-LABEL: sil @bump
// CHECK-NOT: [dynamic]
// CHECK: begin_access [modify] [unsafe]
"#;
    if let Err(e) = filecheck::check(checks, &text) {
        panic!("{e}\n{text}");
    }
}

#[test]
fn test_global_initializer_runs_under_once() {
    let checks = r#"
// CHECK: sil_global @counter : $Int
// CHECK-LABEL: sil @counter!unsafeMutableAddressor
// CHECK: global_addr @globalinit_counter_token
// CHECK: function_ref @globalinit_counter_func
// CHECK: builtin "once"
// CHECK: global_addr @counter
// CHECK-LABEL: sil @globalinit_counter_func
// CHECK: global_addr @counter
// CHECK: integer_literal $Int, 7
"#;
    assert_checks(checks, &global_module());
}

// ============================================
// Errors
// ============================================

#[test]
fn test_try_optional_tuple_destroys_earlier_element_on_error() {
    let checks = r#"
// CHECK-LABEL: sil @test
// CHECK: function_ref @f
// CHECK: try_apply
// CHECK: ([[FRES:%[0-9]+]] : @owned $C):
// CHECK: function_ref @g
// CHECK: try_apply
// CHECK-NEXT: ([[GERR:%[0-9]+]] : @owned $Error):
// CHECK-NEXT: destroy_value [[FRES]] : $C
// CHECK-NEXT: br [[FAIL:bb[0-9]+]]([[GERR]]
// CHECK: ([[GRES:%[0-9]+]] : @owned $C):
// CHECK-NEXT: tuple ([[FRES]] : $C, [[GRES]] : $C)
// CHECK-NEXT: #Optional.some!enumelt
// CHECK: [[FAIL]]([[ERR:%[0-9]+]] : @owned $Error):
// CHECK-NEXT: destroy_value [[ERR]] : $Error
// CHECK-NEXT: #Optional.none!enumelt
"#;
    assert_checks(checks, &try_tuple_module());
}

#[test]
fn test_first_call_error_edge_has_nothing_to_destroy() {
    let checks = r#"
// CHECK-LABEL: sil @test
// CHECK: try_apply
// CHECK-NEXT: ([[ERR:%[0-9]+]] : @owned $Error):
// CHECK-NEXT: br {{bb[0-9]+}}([[ERR]]
"#;
    assert_checks(checks, &try_tuple_module());
}

#[test]
fn test_try_forced_traps_instead_of_wrapping() {
    let mut module = try_tuple_module();
    let pair = Expr::tuple(vec![
        Expr::call("f", vec![], named("C")),
        Expr::call("g", vec![], named("C")),
    ]);
    module.functions[2].body = vec![Stmt::Let {
        pattern: Pattern::Wildcard,
        init: Expr::try_(TryMode::Forced, pair),
    }];
    let checks = r#"
// CHECK-LABEL: sil @test
// CHECK-NOT: #Optional
// CHECK: builtin "unexpectedError"
// CHECK-NEXT: unreachable
"#;
    assert_checks(checks, &module);
}

#[test]
fn test_throwing_function_types_carry_error_result() {
    let mir = lower(&try_tuple_module());
    let f = mir.function("f").unwrap();
    assert!(f.ty.sig.throws);
    let test = mir.function("test").unwrap();
    assert!(!test.ty.sig.throws);
    assert_eq!(test.count("try_apply"), 0, "try_apply is a terminator, not an instruction");
}

#[test]
fn test_try_optional_unwinds_earlier_results_right_to_left() {
    let checks = r#"
// CHECK-LABEL: sil @test
// CHECK: ([[F:%[0-9]+]] : @owned $C):
// CHECK: ([[G:%[0-9]+]] : @owned $C):
// CHECK-NEXT: [[H:%[0-9]+]] = function_ref @h
// CHECK-NEXT: try_apply [[H]]()
// CHECK-NEXT: ([[ERR:%[0-9]+]] : @owned $Error):
// CHECK-NEXT: destroy_value [[G]] : $C
// CHECK-NEXT: destroy_value [[F]] : $C
// CHECK-NEXT: br [[FAIL:bb[0-9]+]]([[ERR]]
// CHECK: tuple ([[F]] : $C, [[G]] : $C, {{%[0-9]+}} : $C)
// CHECK: [[FAIL]]([[CAUGHT:%[0-9]+]] : @owned $Error):
// CHECK-NEXT: destroy_value [[CAUGHT]] : $Error
"#;
    assert_checks(checks, &try_triple_module());
}

#[test]
fn test_catch_clauses_are_tried_in_order_then_rethrown() {
    let checks = r#"
// CHECK-LABEL: sil @classify :
// CHECK: checked_cast_br [[ERR:%[0-9]+]] : $Error to $E1, [[IS_E1:bb[0-9]+]], [[NOT_E1:bb[0-9]+]]
// CHECK: [[IS_E1]]({{%[0-9]+}} : $E1):
// CHECK: destroy_value [[ERR]]
// CHECK: [[NOT_E1]]:
// CHECK-NEXT: checked_cast_br [[ERR]] : $Error to $E2, [[IS_E2:bb[0-9]+]], [[NOT_E2:bb[0-9]+]]
// CHECK: [[IS_E2]]({{%[0-9]+}} : $E2):
// CHECK: destroy_value [[ERR]]
// CHECK: [[NOT_E2]]:
// CHECK-NEXT: br [[RETHROW:bb[0-9]+]]([[ERR]] : $Error)
// CHECK: [[RETHROW]]([[OUT:%[0-9]+]] : @owned $Error):
// CHECK-NEXT: throw [[OUT]]
"#;
    assert_checks(checks, &catch_module());
}

#[test]
fn test_catch_all_clause_ends_the_chain() {
    let checks = r#"
// CHECK-LABEL: sil @catch_all_first :
// CHECK-NOT: checked_cast_br
// CHECK: integer_literal $Int, 1
// CHECK-NOT: integer_literal $Int, 2
// CHECK-LABEL: sil @classify :
// CHECK-LABEL: sil @classify_all :
// CHECK: checked_cast_br [[ERR:%[0-9]+]] : $Error to $E1, {{bb[0-9]+}}, [[NOT_E1:bb[0-9]+]]
// CHECK: [[NOT_E1]]:
// CHECK-NEXT: integer_literal $Int, 99
// CHECK: destroy_value [[ERR]]
// CHECK-NOT: throw
// CHECK-LABEL: sil @fail :
"#;
    assert_checks(checks, &catch_module());
    let mir = lower(&catch_module());
    assert!(!mir.function("classify_all").unwrap().ty.sig.throws);
}

// ============================================
// Construction
// ============================================

#[test]
fn test_fieldless_class_construction_skips_borrow() {
    let checks = r#"
// CHECK-LABEL: sil @f
// CHECK: alloc_ref $C
// CHECK-NOT: begin_borrow
// CHECK: return
"#;
    assert_checks(checks, &try_tuple_module());
}

#[test]
fn test_class_construction_borrows_to_initialize_fields() {
    let checks = r#"
// CHECK-LABEL: sil @read_back
// CHECK: [[OBJ:%[0-9]+]] = alloc_ref $Buf
// CHECK-NEXT: [[B:%[0-9]+]] = begin_borrow [[OBJ]]
// CHECK-NEXT: ref_element_addr [[B]] : $Buf, #Buf.storage
// CHECK: end_borrow
"#;
    assert_checks(checks, &class_addressor_module(AddressorKind::Unsafe));
}

#[test]
fn test_address_only_enum_is_built_in_memory() {
    let checks = r#"
// CHECK-LABEL: sil @make_shape
// CHECK: [[SLOT:%[0-9]+]] = alloc_stack $Shape
// CHECK-NEXT: [[DATA:%[0-9]+]] = init_enum_data_addr [[SLOT]] : $*Shape, #Shape.boxed!enumelt
// CHECK-NEXT: [[PAYLOAD:%[0-9]+]] = init_existential_addr [[DATA]] : $*P, $S
// CHECK: store {{%[0-9]+}} to [trivial] [[PAYLOAD]]
// CHECK: inject_enum_addr [[SLOT]] : $*Shape, #Shape.boxed!enumelt
// CHECK: [[TEMP:%[0-9]+]] = alloc_stack $Shape
// CHECK: inject_enum_addr [[TEMP]] : $*Shape, #Shape.boxed!enumelt
// CHECK-NEXT: destroy_addr [[TEMP]]
// CHECK-NEXT: dealloc_stack [[TEMP]]
// CHECK: [[EMPTY:%[0-9]+]] = alloc_stack $Shape
// CHECK-NEXT: inject_enum_addr [[EMPTY]] : $*Shape, #Shape.empty!enumelt
// CHECK: destroy_addr [[EMPTY]]
// CHECK-NEXT: dealloc_stack [[EMPTY]]
// CHECK-NEXT: destroy_addr [[SLOT]]
// CHECK-NEXT: dealloc_stack [[SLOT]]
// CHECK-NEXT: return
"#;
    assert_checks(checks, &shape_module());

    let mir = lower(&shape_module());
    let make = mir.function("make_shape").unwrap();
    assert_eq!(make.count("alloc_stack"), 3);
    assert_eq!(make.count("alloc_stack"), make.count("dealloc_stack"));
    assert_eq!(make.count("enum"), 0, "address-only cases are never built as values");
}

// ============================================
// Patterns
// ============================================

#[test]
fn test_for_tuple_pattern_destroys_skipped_element() {
    let checks = r#"
// CHECK-LABEL: sil @keep_first
// CHECK: function_ref @next_pair
// CHECK: switch_enum
// CHECK: ([[PAIR:%[0-9]+]] : @owned $(C, C)):
// CHECK-NEXT: [[B:%[0-9]+]] = begin_borrow [[PAIR]]
// CHECK-NEXT: [[FIRST:%[0-9]+]] = tuple_extract [[B]] : $(C, C), 0
// CHECK-NEXT: [[A:%[0-9]+]] = copy_value [[FIRST]]
// CHECK-NEXT: [[SECOND:%[0-9]+]] = tuple_extract [[B]] : $(C, C), 1
// CHECK-NEXT: [[SKIPPED:%[0-9]+]] = copy_value [[SECOND]]
// CHECK-NEXT: end_borrow [[B]]
// CHECK-NEXT: destroy_value [[PAIR]]
// CHECK-NEXT: destroy_value [[SKIPPED]]
// CHECK-NEXT: destroy_value [[A]]
// CHECK-NEXT: br
"#;
    assert_checks(checks, &pair_loop_module());
}

#[test]
fn test_for_all_wildcard_pattern_copies_nothing() {
    let checks = r#"
// CHECK-LABEL: sil @skip_all
// CHECK: switch_enum
// CHECK: ([[PAIR:%[0-9]+]] : @owned $(C, C)):
// CHECK-NEXT: destroy_value [[PAIR]]
// CHECK-NEXT: br
"#;
    assert_checks(checks, &pair_loop_module());
    let mir = lower(&pair_loop_module());
    let skip = mir.function("skip_all").unwrap();
    assert_eq!(skip.count("copy_value"), 0);
    assert_eq!(skip.count("tuple_extract"), 0);
}

// ============================================
// materializeForSet
// ============================================

#[test]
fn test_materialize_for_set_uses_inline_buffer_for_small_values() {
    let checks = r#"
// CHECK-LABEL: sil @Meter.reading!materializeForSet :
// CHECK-NOT: alloc_value_buffer
// CHECK: [[TEMP:%[0-9]+]] = pointer_to_address
// CHECK: address_to_pointer [[TEMP]]
// CHECK: function_ref @Meter.reading!materializeForSet.callback
// CHECK-NEXT: thin_function_to_pointer
// CHECK: #Optional.some!enumelt
// CHECK-LABEL: sil @Meter.reading!materializeForSet.callback :
// CHECK-NOT: project_value_buffer
// CHECK: [[SLOT:%[0-9]+]] = pointer_to_address
// CHECK-NEXT: load [trivial] [[SLOT]]
// CHECK: apply
// CHECK-NOT: dealloc_value_buffer
// CHECK: return
"#;
    assert_checks(checks, &meter_module());
}

#[test]
fn test_materialize_for_set_allocates_buffer_for_large_values() {
    let checks = r#"
// CHECK-LABEL: sil @Meter.wide!materializeForSet :
// CHECK: [[TEMP:%[0-9]+]] = alloc_value_buffer $(Int, Int, Int, Int) in
// CHECK: address_to_pointer [[TEMP]]
// CHECK: function_ref @Meter.wide!materializeForSet.callback
// CHECK-LABEL: sil @Meter.wide!materializeForSet.callback :
// CHECK: [[SLOT:%[0-9]+]] = project_value_buffer $(Int, Int, Int, Int) in
// CHECK-NEXT: load [trivial] [[SLOT]]
// CHECK: apply
// CHECK-NEXT: dealloc_value_buffer $(Int, Int, Int, Int) in
"#;
    assert_checks(checks, &meter_module());
}

#[test]
fn test_dispatched_modify_invokes_returned_callback() {
    let checks = r#"
// CHECK-LABEL: sil @bump_reading
// CHECK: class_method {{.*}}#Meter.reading!materializeForSet
// CHECK: apply
// CHECK: builtin "sadd_with_overflow_Int64"
// CHECK: switch_enum {{%[0-9]+}} : $Optional<Builtin.RawPointer>
// CHECK: pointer_to_thin_function
// CHECK: apply
"#;
    assert_checks(checks, &meter_module());
}

// ============================================
// Closures
// ============================================

#[test]
fn test_non_escaping_closure_captures_stack_address() {
    let checks = r#"
// CHECK-LABEL: sil @bump_stack : $@convention(thin) (@inout_aliasable Int) -> ()
// CHECK-LABEL: sil @stack_counter :
// CHECK-NOT: alloc_box
// CHECK: [[TOTAL:%[0-9]+]] = alloc_stack $Int
// CHECK: function_ref @bump_stack
// CHECK-NEXT: [[F:%[0-9]+]] = partial_apply [callee_guaranteed] [on_stack] {{%[0-9]+}}([[TOTAL]])
// CHECK: function_ref @apply_twice
// CHECK-NEXT: apply {{%[0-9]+}}([[F]])
// CHECK-NEXT: dealloc_stack [[F]]
"#;
    assert_checks(checks, &closure_module());
}

#[test]
fn test_escaping_closure_boxes_captured_var() {
    let checks = r#"
// CHECK-LABEL: sil @boxed_counter :
// CHECK-NOT: alloc_stack $Int
// CHECK: [[BOX:%[0-9]+]] = alloc_box
// CHECK-NEXT: project_box [[BOX]]
// CHECK: [[COPY:%[0-9]+]] = copy_value [[BOX]]
// CHECK-NEXT: function_ref @bump_boxed
// CHECK-NEXT: partial_apply [callee_guaranteed] {{%[0-9]+}}([[COPY]])
// CHECK: destroy_value [[BOX]]
// CHECK-LABEL: sil @bump_boxed : $@convention(thin) (@guaranteed { var Int }) -> ()
// CHECK: project_box {{%[0-9]+}}
// CHECK: begin_access [modify] [dynamic]
"#;
    assert_checks(checks, &closure_module());
}

#[test]
fn test_function_conversion_goes_through_reabstraction_thunk() {
    let thunk = "reabstraction thunk from @callee_guaranteed (Int) -> Int to @callee_guaranteed (@in Int) -> @out Int";
    let checks = format!(
        r#"
// CHECK-LABEL: sil @reabstract :
// CHECK: thin_to_thick_function
// CHECK: function_ref @{thunk}
// CHECK-NEXT: partial_apply [callee_guaranteed] {{{{%[0-9]+}}}}(
// CHECK-LABEL: sil [thunk] @{thunk} :
// CHECK: load [trivial]
// CHECK: apply
// CHECK: store {{{{%[0-9]+}}}} to [trivial]
"#
    );
    assert_checks(&checks, &closure_module());
    let mir = lower(&closure_module());
    assert!(mir.function(thunk).is_some_and(|f| f.is_thunk));
}

#[test]
fn test_block_bridge_copies_closure_through_block_storage() {
    let checks = r#"
// CHECK-LABEL: sil @bridge :
// CHECK: partial_apply [callee_guaranteed] {{%[0-9]+}}({{%[0-9]+}})
// CHECK: [[STORAGE:%[0-9]+]] = alloc_stack $@block_storage @callee_guaranteed () -> Int
// CHECK-NEXT: [[CAPTURE:%[0-9]+]] = project_block_storage [[STORAGE]]
// CHECK: store {{%[0-9]+}} to [init] [[CAPTURE]]
// CHECK: [[INVOKE:%[0-9]+]] = function_ref @block invoke thunk for @callee_guaranteed () -> Int
// CHECK: [[HEADER:%[0-9]+]] = init_block_storage_header [[STORAGE]] {{.*}}, invoke [[INVOKE]]
// CHECK-NEXT: copy_block [[HEADER]]
// CHECK-NEXT: destroy_addr [[CAPTURE]]
// CHECK-NEXT: dealloc_stack [[STORAGE]]
"#;
    assert_checks(checks, &closure_module());
    let mir = lower(&closure_module());
    let invoke = mir.function("block invoke thunk for @callee_guaranteed () -> Int").unwrap();
    assert!(invoke.is_thunk);
    assert_eq!(invoke.count("project_block_storage"), 1);
}

// ============================================
// Exclusivity
// ============================================

#[test]
fn test_overlapping_inout_locals_are_rejected() {
    let mut module = exclusivity_module();
    let x = || Expr::var("x", Type::Int);
    module.functions.push(func(
        "same_local",
        vec![],
        Type::unit(),
        vec![
            Stmt::Var {
                name: "x".into(),
                init: Expr::int(1),
            },
            Stmt::Expr(swap2_call(Expr::inout(x()), Expr::inout(x()))),
        ],
    ));
    match ossa::lower_module(&module, &LoweringConfig::default()) {
        Err(ossa::CompileError::Exclusivity { message, .. }) => {
            assert_eq!(
                message,
                "overlapping accesses to 'x': modify access conflicts with an open modify access"
            );
        }
        Err(other) => panic!("expected an exclusivity error, got {other}"),
        Ok(_) => panic!("overlapping inout arguments were accepted"),
    }
}

#[test]
fn test_overlapping_dynamic_accesses_are_left_to_runtime() {
    let checks = r#"
// CHECK-LABEL: sil @same_global
// CHECK: [[FIRST:%[0-9]+]] = begin_access [modify] [dynamic]
// CHECK: [[SECOND:%[0-9]+]] = begin_access [modify] [dynamic]
// CHECK: apply {{%[0-9]+}}([[FIRST]], [[SECOND]])
// CHECK: end_access [[SECOND]]
// CHECK: end_access [[FIRST]]
// CHECK-LABEL: sil @same_property
// CHECK: ref_element_addr {{%[0-9]+}} : $Cell, #Cell.x
// CHECK-NEXT: [[FIRST:%[0-9]+]] = begin_access [modify] [dynamic]
// CHECK: ref_element_addr {{%[0-9]+}} : $Cell, #Cell.x
// CHECK-NEXT: [[SECOND:%[0-9]+]] = begin_access [modify] [dynamic]
// CHECK: apply {{%[0-9]+}}([[FIRST]], [[SECOND]])
"#;
    assert_checks(checks, &exclusivity_module());
}

// ============================================
// Module surface
// ============================================

#[test]
fn test_module_json_round_trip_lowers_identically() {
    let module = addressor_module();
    let json = serde_json::to_string(&module).unwrap();
    let parsed = ossa::parse_module(&json).unwrap();
    assert_eq!(format_module(&lower(&module)), format_module(&lower(&parsed)));
}

#[test]
fn test_lowered_function_names() {
    let mir = lower(&global_module());
    let names: Vec<&str> = mir.functions.iter().map(|f| f.name.as_str()).collect();
    insta::assert_debug_snapshot!(names, @r#"
    [
        "bump",
        "counter!unsafeMutableAddressor",
        "globalinit_counter_func",
    ]
    "#);
}

#[test]
fn test_lowered_global_names() {
    let mir = lower(&global_module());
    let globals: Vec<String> = mir.globals.iter().map(|g| format!("{} : {}", g.name, g.ty)).collect();
    insta::assert_debug_snapshot!(globals, @r#"
    [
        "counter : Int",
        "globalinit_counter_token : Int",
    ]
    "#);
}
