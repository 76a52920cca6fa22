//! Declaration-graph builders shared by the integration tests

#![allow(dead_code)]

use ossa::ast::*;
use ossa::{LoweringConfig, MirModule};

pub fn named(name: &str) -> Type {
    Type::Named(name.to_string())
}

pub fn param(name: &str, ty: Type) -> Param {
    Param {
        name: name.to_string(),
        ty,
        convention: ParamConvention::Owned,
    }
}

pub fn inout_param(name: &str, ty: Type) -> Param {
    Param {
        name: name.to_string(),
        ty,
        convention: ParamConvention::InOut,
    }
}

pub fn func(name: &str, params: Vec<Param>, result: Type, body: Vec<Stmt>) -> FnDecl {
    FnDecl {
        name: name.to_string(),
        generic_params: vec![],
        params,
        result,
        throws: false,
        kind: MethodKind::Instance,
        is_final: false,
        is_override: false,
        body,
        span: Span::default(),
    }
}

pub fn throwing(mut decl: FnDecl) -> FnDecl {
    decl.throws = true;
    decl
}

pub fn stored(name: &str, ty: Type) -> PropertyDecl {
    PropertyDecl {
        name: name.to_string(),
        ty,
        is_static: false,
        is_final: false,
        is_override: false,
        storage: Storage::Stored { initial: None },
        span: Span::default(),
    }
}

pub fn class(name: &str, properties: Vec<PropertyDecl>, methods: Vec<FnDecl>) -> ClassDecl {
    ClassDecl {
        name: name.to_string(),
        superclass: None,
        is_final: false,
        properties,
        subscripts: vec![],
        methods,
        span: Span::default(),
    }
}

pub fn structure(name: &str, properties: Vec<PropertyDecl>) -> StructDecl {
    StructDecl {
        name: name.to_string(),
        generic_params: vec![],
        properties,
        subscripts: vec![],
        methods: vec![],
        span: Span::default(),
    }
}

pub fn ret(expr: Expr) -> Stmt {
    Stmt::Return(Some(expr))
}

pub fn lower(module: &Module) -> MirModule {
    lower_with(module, &LoweringConfig::default())
}

pub fn lower_with(module: &Module, config: &LoweringConfig) -> MirModule {
    match ossa::lower_module(module, config) {
        Ok(mir) => mir,
        Err(e) => panic!("lowering {} failed: {e}", module.name),
    }
}

/// `struct A { var storage: Int32; subscript(i: Int) -> Int32 }` with
/// unsafe addressors, and `test(z)` doing `var a = A(0); a[5] += z`
pub fn addressor_module() -> Module {
    let a = named("A");
    let storage = |pointer: Type| {
        vec![ret(Expr::new(
            ExprKind::AddressOf(Box::new(Expr::member(Expr::var("self", a.clone()), "storage", Type::Int32))),
            pointer,
        ))]
    };
    let mut decl = structure("A", vec![stored("storage", Type::Int32)]);
    decl.subscripts.push(SubscriptDecl {
        index: param("i", Type::Int),
        element: Type::Int32,
        is_final: false,
        storage: Storage::Addressed {
            kind: AddressorKind::Unsafe,
            read: storage(Type::UnsafePointer(Box::new(Type::Int32))),
            modify: Some(storage(Type::UnsafeMutablePointer(Box::new(Type::Int32)))),
        },
        span: Span::default(),
    });

    let body = vec![
        Stmt::Var {
            name: "a".into(),
            init: Expr::construct(a.clone(), vec![Expr::int32(0)]),
        },
        Stmt::Expr(Expr::compound_assign(
            BinOp::Add,
            Expr::subscript(Expr::var("a", a.clone()), Expr::int(5), Type::Int32),
            Expr::var("z", Type::Int32),
        )),
    ];
    Module {
        name: "addressors".into(),
        structs: vec![decl],
        functions: vec![func("test", vec![param("z", Type::Int32)], Type::unit(), body)],
        ..Default::default()
    }
}

/// [`addressor_module`] where `test(z)` also returns `a[5]`
pub fn addressor_readback_module() -> Module {
    let mut module = addressor_module();
    let test = &mut module.functions[0];
    test.result = Type::Int32;
    test.body.push(ret(Expr::subscript(
        Expr::var("a", named("A")),
        Expr::int(5),
        Type::Int32,
    )));
    module
}

/// `class Buf { var storage: Int; subscript(i: Int) -> Int }` addressed
/// through `kind` addressors, with
/// - `read_back()`: `let b = Buf(3); b[0] += 4; return b[0]`
/// - `touch_through()`: `let b = Buf(3); try touch(&b[0])`, where `touch`
///   bumps its inout argument and then throws
pub fn class_addressor_module(kind: AddressorKind) -> Module {
    let buf = named("Buf");
    let this = || Expr::var("self", buf.clone());
    let body = |pointer: Type| {
        let address = Expr::new(
            ExprKind::AddressOf(Box::new(Expr::member(this(), "storage", Type::Int))),
            pointer,
        );
        let result = match kind {
            AddressorKind::Unsafe => address,
            AddressorKind::NativeOwner | AddressorKind::PinnedNativeOwner => Expr::tuple(vec![
                address,
                Expr::new(ExprKind::NativeOwner(Box::new(this())), Type::NativeObject),
            ]),
        };
        vec![ret(result)]
    };
    let mut decl = class("Buf", vec![stored("storage", Type::Int)], vec![]);
    decl.subscripts.push(SubscriptDecl {
        index: param("i", Type::Int),
        element: Type::Int,
        is_final: false,
        storage: Storage::Addressed {
            kind,
            read: body(Type::UnsafePointer(Box::new(Type::Int))),
            modify: Some(body(Type::UnsafeMutablePointer(Box::new(Type::Int)))),
        },
        span: Span::default(),
    });

    let new_buf = || Stmt::Let {
        pattern: Pattern::Named("b".into()),
        init: Expr::construct(buf.clone(), vec![Expr::int(3)]),
    };
    let element = || Expr::subscript(Expr::var("b", buf.clone()), Expr::int(0), Type::Int);
    let touch = throwing(func(
        "touch",
        vec![inout_param("x", Type::Int)],
        Type::unit(),
        vec![
            Stmt::Expr(Expr::compound_assign(BinOp::Add, Expr::var("x", Type::Int), Expr::int(1))),
            Stmt::Throw(Expr::erase(Expr::construct(named("E"), vec![]), Type::error())),
        ],
    ));
    Module {
        name: "class_addressors".into(),
        structs: vec![structure("E", vec![])],
        classes: vec![decl],
        functions: vec![
            func(
                "read_back",
                vec![],
                Type::Int,
                vec![
                    new_buf(),
                    Stmt::Expr(Expr::compound_assign(BinOp::Add, element(), Expr::int(4))),
                    ret(element()),
                ],
            ),
            touch,
            throwing(func(
                "touch_through",
                vec![],
                Type::unit(),
                vec![
                    new_buf(),
                    Stmt::Expr(Expr::try_(
                        TryMode::Plain,
                        Expr::call("touch", vec![Expr::inout(element())], Type::unit()),
                    )),
                ],
            )),
        ],
        ..Default::default()
    }
}

/// Throwing `f` and `g` returning class instances, and `test` doing
/// `_ = try? (f(), g())`
pub fn try_tuple_module() -> Module {
    let c = named("C");
    let make = |name: &str| throwing(func(name, vec![], c.clone(), vec![ret(Expr::construct(c.clone(), vec![]))]));
    let pair = Expr::tuple(vec![Expr::call("f", vec![], c.clone()), Expr::call("g", vec![], c.clone())]);
    let body = vec![Stmt::Let {
        pattern: Pattern::Wildcard,
        init: Expr::try_(TryMode::Optional, pair),
    }];
    Module {
        name: "errors".into(),
        classes: vec![class("C", vec![], vec![])],
        functions: vec![make("f"), make("g"), func("test", vec![], Type::unit(), body)],
        ..Default::default()
    }
}

/// `var counter: Int = 7` and `bump()` doing `counter += 1; return counter`
pub fn global_module() -> Module {
    let counter = || Expr::global("counter", Type::Int);
    Module {
        name: "globals".into(),
        globals: vec![GlobalDecl {
            name: "counter".into(),
            ty: Type::Int,
            initial: Expr::int(7),
            span: Span::default(),
        }],
        functions: vec![func(
            "bump",
            vec![],
            Type::Int,
            vec![
                Stmt::Expr(Expr::compound_assign(BinOp::Add, counter(), Expr::int(1))),
                ret(counter()),
            ],
        )],
        ..Default::default()
    }
}

pub fn computed(name: &str, ty: Type, get: Vec<Stmt>, set: Vec<Stmt>) -> PropertyDecl {
    PropertyDecl {
        storage: Storage::Computed { get, set: Some(set) },
        ..stored(name, ty)
    }
}

pub fn closure(name: &str, params: Vec<Param>, result: Type, escaping: bool, captures: &[&str], body: Vec<Stmt>) -> Expr {
    let ty = Type::Function(Box::new(FunctionType {
        escaping,
        ..FunctionType::new(params.iter().map(|p| p.ty.clone()).collect(), result.clone())
    }));
    Expr::new(
        ExprKind::Closure(Box::new(ClosureExpr {
            name: name.to_string(),
            params,
            result,
            throws: false,
            escaping,
            captures: captures.iter().map(|c| c.to_string()).collect(),
            body,
        })),
        ty,
    )
}

pub fn call_value(function: Expr, args: Vec<Expr>, result: Type) -> Expr {
    Expr::new(
        ExprKind::Call {
            callee: Callee::Value(Box::new(function)),
            args,
        },
        result,
    )
}

pub fn let_(name: &str, init: Expr) -> Stmt {
    Stmt::Let {
        pattern: Pattern::Named(name.into()),
        init,
    }
}

fn throw_new(error: &str, args: Vec<Expr>) -> Stmt {
    Stmt::Throw(Expr::erase(Expr::construct(named(error), args), Type::error()))
}

/// `enum Shape { case boxed(P), case empty }`, address-only through its
/// existential payload, and `make_shape()` building each case:
/// `let s = .boxed(S(4)); _ = .boxed(S(5)); let e = .empty; return 1`
pub fn shape_module() -> Module {
    let shape = named("Shape");
    let p = Type::Existential("P".into());
    let boxed = |n: i64| {
        Expr::enum_case(
            shape.clone(),
            "boxed",
            Some(Expr::erase(Expr::construct(named("S"), vec![Expr::int(n)]), p.clone())),
        )
    };
    Module {
        name: "shapes".into(),
        structs: vec![structure("S", vec![stored("n", Type::Int)])],
        enums: vec![EnumDecl {
            name: "Shape".into(),
            generic_params: vec![],
            cases: vec![
                EnumCaseDecl {
                    name: "boxed".into(),
                    payload: Some(p.clone()),
                },
                EnumCaseDecl {
                    name: "empty".into(),
                    payload: None,
                },
            ],
            methods: vec![],
            span: Span::default(),
        }],
        protocols: vec![ProtocolDecl {
            name: "P".into(),
            requirements: vec![],
            associated_types: vec![],
        }],
        conformances: vec![Conformance {
            ty: named("S"),
            protocol: "P".into(),
            witnesses: vec![],
            associated_types: vec![],
        }],
        functions: vec![func(
            "make_shape",
            vec![],
            Type::Int,
            vec![
                let_("s", boxed(4)),
                Stmt::Expr(boxed(5)),
                let_("e", Expr::enum_case(shape.clone(), "empty", None)),
                ret(Expr::int(1)),
            ],
        )],
        ..Default::default()
    }
}

/// An iterator `It` yielding `count` pairs of fresh `C` instances, walked by
/// `keep_first()` as `for (a, _) in 2 {}` and by `skip_all()` as
/// `for (_, _) in 2 {}`
pub fn pair_loop_module() -> Module {
    let it = named("It");
    let c = named("C");
    let pair = Type::Tuple(vec![c.clone(), c.clone()]);
    let remaining = || Expr::member(Expr::var("it", it.clone()), "n", Type::Int);
    let next = func(
        "next_pair",
        vec![inout_param("it", it.clone())],
        Type::optional(pair.clone()),
        vec![
            Stmt::If {
                cond: Expr::binary(BinOp::Eq, remaining(), Expr::int(0)),
                then_body: vec![ret(Expr::new(ExprKind::Nil, Type::optional(pair.clone())))],
                else_body: vec![],
            },
            Stmt::Expr(Expr::compound_assign(BinOp::Sub, remaining(), Expr::int(1))),
            ret(Expr::some(Expr::tuple(vec![
                Expr::construct(c.clone(), vec![]),
                Expr::construct(c.clone(), vec![]),
            ]))),
        ],
    );
    let make = func(
        "make_pairs",
        vec![param("count", Type::Int)],
        it.clone(),
        vec![ret(Expr::construct(it.clone(), vec![Expr::var("count", Type::Int)]))],
    );
    let walk = |name: &str, pattern: Pattern| {
        func(
            name,
            vec![],
            Type::Int,
            vec![
                Stmt::For {
                    pattern,
                    sequence: Expr::int(2),
                    iterator: IteratorInfo {
                        make_iterator: "make_pairs".into(),
                        next: "next_pair".into(),
                        iterator_ty: it.clone(),
                        element_ty: pair.clone(),
                    },
                    body: vec![],
                },
                ret(Expr::int(0)),
            ],
        )
    };
    Module {
        name: "loops".into(),
        structs: vec![structure("It", vec![stored("n", Type::Int)])],
        classes: vec![class("C", vec![], vec![])],
        functions: vec![
            next,
            make,
            walk(
                "keep_first",
                Pattern::Tuple(vec![Pattern::Named("a".into()), Pattern::Wildcard]),
            ),
            walk("skip_all", Pattern::Tuple(vec![Pattern::Wildcard, Pattern::Wildcard])),
        ],
        ..Default::default()
    }
}

/// `class Meter { var raw: Int }` with two computed properties over `raw`:
/// `reading: Int` fits the inline value buffer, `wide: (Int, Int, Int, Int)`
/// does not. `bump_reading()` does `m.reading += 5` and `bump_wide()` does
/// `m.wide.0 += 5` on `Meter(2)`, both returning `m.raw`.
pub fn meter_module() -> Module {
    let meter = named("Meter");
    let wide = Type::Tuple(vec![Type::Int; 4]);
    let raw_of = |base: &str| Expr::member(Expr::var(base, meter.clone()), "raw", Type::Int);
    let reading = computed(
        "reading",
        Type::Int,
        vec![ret(raw_of("self"))],
        vec![Stmt::Expr(Expr::assign(raw_of("self"), Expr::var("newValue", Type::Int)))],
    );
    let first = Expr::new(
        ExprKind::TupleElement {
            base: Box::new(Expr::var("newValue", wide.clone())),
            index: 0,
        },
        Type::Int,
    );
    let wide_decl = computed(
        "wide",
        wide.clone(),
        vec![ret(Expr::tuple(vec![raw_of("self"); 4]))],
        vec![Stmt::Expr(Expr::assign(raw_of("self"), first))],
    );
    let new_meter = let_("m", Expr::construct(meter.clone(), vec![Expr::int(2)]));
    let wide_first = Expr::new(
        ExprKind::TupleElement {
            base: Box::new(Expr::member(Expr::var("m", meter.clone()), "wide", wide.clone())),
            index: 0,
        },
        Type::Int,
    );
    Module {
        name: "meters".into(),
        classes: vec![class(
            "Meter",
            vec![stored("raw", Type::Int), reading, wide_decl],
            vec![],
        )],
        functions: vec![
            func(
                "bump_reading",
                vec![],
                Type::Int,
                vec![
                    new_meter.clone(),
                    Stmt::Expr(Expr::compound_assign(
                        BinOp::Add,
                        Expr::member(Expr::var("m", meter.clone()), "reading", Type::Int),
                        Expr::int(5),
                    )),
                    ret(raw_of("m")),
                ],
            ),
            func(
                "bump_wide",
                vec![],
                Type::Int,
                vec![
                    new_meter,
                    Stmt::Expr(Expr::compound_assign(BinOp::Add, wide_first, Expr::int(5))),
                    ret(raw_of("m")),
                ],
            ),
        ],
        ..Default::default()
    }
}

/// Closures over a counter starting at 1 and bumped twice by 2:
/// - `stack_counter()` passes a non-escaping closure to `apply_twice`
/// - `boxed_counter()` keeps an escaping closure in a `let`, which boxes
///   the counter
/// - `reabstract()` calls `{ x in x + 1 }` through an opaque signature
/// - `bridge()` calls a closure capturing `n = 4` through a block
pub fn closure_module() -> Module {
    let unit_fn = |escaping| {
        Type::Function(Box::new(FunctionType {
            escaping,
            ..FunctionType::new(vec![], Type::unit())
        }))
    };
    let total = || Expr::var("total", Type::Int);
    let bump_body = || vec![Stmt::Expr(Expr::compound_assign(BinOp::Add, total(), Expr::int(2)))];
    let start = || Stmt::Var {
        name: "total".into(),
        init: Expr::int(1),
    };

    let apply_twice = {
        let f = || Expr::var("f", unit_fn(false));
        func(
            "apply_twice",
            vec![param("f", unit_fn(false))],
            Type::unit(),
            vec![
                Stmt::Expr(call_value(f(), vec![], Type::unit())),
                Stmt::Expr(call_value(f(), vec![], Type::unit())),
            ],
        )
    };
    let stack_counter = func(
        "stack_counter",
        vec![],
        Type::Int,
        vec![
            start(),
            Stmt::Expr(Expr::call(
                "apply_twice",
                vec![closure("bump_stack", vec![], Type::unit(), false, &["total"], bump_body())],
                Type::unit(),
            )),
            ret(total()),
        ],
    );
    let bump = || Stmt::Expr(call_value(Expr::var("bump", unit_fn(true)), vec![], Type::unit()));
    let boxed_counter = func(
        "boxed_counter",
        vec![],
        Type::Int,
        vec![
            start(),
            let_(
                "bump",
                closure("bump_boxed", vec![], Type::unit(), true, &["total"], bump_body()),
            ),
            bump(),
            bump(),
            ret(total()),
        ],
    );

    let add_one = closure(
        "add_one",
        vec![param("x", Type::Int)],
        Type::Int,
        true,
        &[],
        vec![ret(Expr::binary(BinOp::Add, Expr::var("x", Type::Int), Expr::int(1)))],
    );
    let opaque = Type::Function(Box::new(FunctionType {
        abstraction: Abstraction::Opaque,
        ..FunctionType::new(vec![Type::Int], Type::Int)
    }));
    let reabstract = func(
        "reabstract",
        vec![],
        Type::Int,
        vec![
            let_("f", add_one.clone()),
            let_(
                "g",
                Expr::new(
                    ExprKind::FunctionConversion(Box::new(Expr::var("f", add_one.ty.clone()))),
                    opaque.clone(),
                ),
            ),
            ret(call_value(Expr::var("g", opaque), vec![Expr::int(3)], Type::Int)),
        ],
    );

    let read_n = closure(
        "read_n",
        vec![],
        Type::Int,
        true,
        &["n"],
        vec![ret(Expr::var("n", Type::Int))],
    );
    let block = Type::Function(Box::new(FunctionType {
        representation: Representation::Block,
        ..FunctionType::new(vec![], Type::Int)
    }));
    let bridge = func(
        "bridge",
        vec![],
        Type::Int,
        vec![
            let_("n", Expr::int(4)),
            let_("f", read_n.clone()),
            let_(
                "b",
                Expr::new(
                    ExprKind::FunctionConversion(Box::new(Expr::var("f", read_n.ty.clone()))),
                    block.clone(),
                ),
            ),
            ret(call_value(Expr::var("b", block), vec![], Type::Int)),
        ],
    );

    Module {
        name: "closures".into(),
        functions: vec![apply_twice, stack_counter, boxed_counter, reabstract, bridge],
        ..Default::default()
    }
}

/// Errors `E1 { code }`, `E2` and `E3`, thrown by `fail(which)` for
/// `which` 1 to 3, caught by
/// - `classify(which)`: `catch E1 as e { e.code }`, `catch E2 { 2 }`,
///   anything else rethrown
/// - `classify_all(which)`: `catch E1 as e { e.code }`, `catch { 99 }`
/// - `catch_all_first(which)`: `catch { 1 }` ahead of `catch E1 { 2 }`
pub fn catch_module() -> Module {
    let which = || Expr::var("which", Type::Int);
    let fail = throwing(func(
        "fail",
        vec![param("which", Type::Int)],
        Type::Int,
        vec![
            Stmt::If {
                cond: Expr::binary(BinOp::Eq, which(), Expr::int(1)),
                then_body: vec![throw_new("E1", vec![Expr::int(10)])],
                else_body: vec![],
            },
            Stmt::If {
                cond: Expr::binary(BinOp::Eq, which(), Expr::int(2)),
                then_body: vec![throw_new("E2", vec![])],
                else_body: vec![],
            },
            Stmt::If {
                cond: Expr::binary(BinOp::Eq, which(), Expr::int(3)),
                then_body: vec![throw_new("E3", vec![])],
                else_body: vec![],
            },
            ret(Expr::int(0)),
        ],
    ));
    let attempt = || {
        vec![ret(Expr::try_(
            TryMode::Plain,
            Expr::call("fail", vec![which()], Type::Int),
        ))]
    };
    let typed = |ty: &str, binding: Option<&str>, body: Vec<Stmt>| CatchClause {
        ty: Some(named(ty)),
        binding: binding.map(str::to_string),
        body,
    };
    let any = |value: i64| CatchClause {
        ty: None,
        binding: None,
        body: vec![ret(Expr::int(value))],
    };
    let code = || vec![ret(Expr::member(Expr::var("e", named("E1")), "code", Type::Int))];
    let handler = |name: &str, catches: Vec<CatchClause>| {
        func(
            name,
            vec![param("which", Type::Int)],
            Type::Int,
            vec![Stmt::Do {
                body: attempt(),
                catches,
            }],
        )
    };
    Module {
        name: "catches".into(),
        structs: vec![
            structure("E1", vec![stored("code", Type::Int)]),
            structure("E2", vec![]),
            structure("E3", vec![]),
        ],
        functions: vec![
            fail,
            throwing(handler(
                "classify",
                vec![
                    typed("E1", Some("e"), code()),
                    typed("E2", None, vec![ret(Expr::int(2))]),
                ],
            )),
            handler("classify_all", vec![typed("E1", Some("e"), code()), any(99)]),
            handler(
                "catch_all_first",
                vec![any(1), typed("E1", None, vec![ret(Expr::int(2))])],
            ),
        ],
        ..Default::default()
    }
}

/// Throwing `f`, `g` and `h` returning class instances, where `h` throws,
/// and `test` doing `_ = try? (f(), g(), h())`
pub fn try_triple_module() -> Module {
    let c = named("C");
    let make = |name: &str| throwing(func(name, vec![], c.clone(), vec![ret(Expr::construct(c.clone(), vec![]))]));
    let fail = throwing(func("h", vec![], c.clone(), vec![throw_new("E", vec![])]));
    let calls = ["f", "g", "h"]
        .iter()
        .map(|name| Expr::call(*name, vec![], c.clone()))
        .collect();
    let body = vec![Stmt::Let {
        pattern: Pattern::Wildcard,
        init: Expr::try_(TryMode::Optional, Expr::tuple(calls)),
    }];
    Module {
        name: "triple".into(),
        structs: vec![structure("E", vec![])],
        classes: vec![class("C", vec![], vec![])],
        functions: vec![make("f"), make("g"), fail, func("test", vec![], Type::unit(), body)],
        ..Default::default()
    }
}

/// `swap2(a: inout Int, b: inout Int)` called with overlapping arguments
/// on dynamically enforced storage, plus a well-formed call:
/// - `distinct_locals()`: `var x = 1; var y = 2; swap2(&x, &y); return x * 10 + y`
/// - `same_global()`: `swap2(&g, &g)`
/// - `same_property()`: `let c = Cell(1); swap2(&c.x, &c.x)` on a final class
pub fn exclusivity_module() -> Module {
    let a = || Expr::var("a", Type::Int);
    let b = || Expr::var("b", Type::Int);
    let swap2 = func(
        "swap2",
        vec![inout_param("a", Type::Int), inout_param("b", Type::Int)],
        Type::unit(),
        vec![
            let_("t", a()),
            Stmt::Expr(Expr::assign(a(), b())),
            Stmt::Expr(Expr::assign(b(), Expr::var("t", Type::Int))),
        ],
    );
    let var = |name: &str, value: i64| Stmt::Var {
        name: name.into(),
        init: Expr::int(value),
    };
    let x = || Expr::var("x", Type::Int);
    let y = || Expr::var("y", Type::Int);
    let cell_x = || Expr::member(Expr::var("c", named("Cell")), "x", Type::Int);
    let g = || Expr::global("g", Type::Int);
    let mut cell = class("Cell", vec![stored("x", Type::Int)], vec![]);
    cell.is_final = true;
    Module {
        name: "exclusivity".into(),
        classes: vec![cell],
        globals: vec![GlobalDecl {
            name: "g".into(),
            ty: Type::Int,
            initial: Expr::int(1),
            span: Span::default(),
        }],
        functions: vec![
            swap2,
            func(
                "distinct_locals",
                vec![],
                Type::Int,
                vec![
                    var("x", 1),
                    var("y", 2),
                    Stmt::Expr(swap2_call(Expr::inout(x()), Expr::inout(y()))),
                    ret(Expr::binary(
                        BinOp::Add,
                        Expr::binary(BinOp::Mul, x(), Expr::int(10)),
                        y(),
                    )),
                ],
            ),
            func(
                "same_global",
                vec![],
                Type::unit(),
                vec![Stmt::Expr(swap2_call(Expr::inout(g()), Expr::inout(g())))],
            ),
            func(
                "same_property",
                vec![],
                Type::unit(),
                vec![
                    let_("c", Expr::construct(named("Cell"), vec![Expr::int(1)])),
                    Stmt::Expr(swap2_call(Expr::inout(cell_x()), Expr::inout(cell_x()))),
                ],
            ),
        ],
        ..Default::default()
    }
}

pub fn swap2_call(a: Expr, b: Expr) -> Expr {
    Expr::call("swap2", vec![a, b], Type::unit())
}
