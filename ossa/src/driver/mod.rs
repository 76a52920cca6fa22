//! Module lowering pipeline
//!
//! decls → [`TypeLowering`] → dispatch tables → one job per function →
//! lowered bodies (in parallel) → verified [`MirModule`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::ast::{Module, Storage};
use crate::config::LoweringConfig;
use crate::error::{CompileError, Result};
use crate::lower::{LowerEnv, LoweringJob, StorageDecl, lower_job, token_type};
use crate::mir::{MirFunction, MirGlobal, MirInst, MirModule, verify_module};
use crate::tables::build_tables;
use crate::types::{OwnerKind, TypeLowering, accessor_kinds, names};

/// Summary numbers of a lowered module, printed by `ossa lower --stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleStats {
    pub functions: usize,
    pub thunks: usize,
    pub globals: usize,
    pub vtables: usize,
    pub witness_tables: usize,
    pub instructions: usize,
    pub access_scopes: usize,
}

impl ModuleStats {
    pub fn of(module: &MirModule) -> Self {
        ModuleStats {
            functions: module.functions.len(),
            thunks: module.functions.iter().filter(|f| f.is_thunk).count(),
            globals: module.globals.len(),
            vtables: module.tables.vtables.len(),
            witness_tables: module.tables.witness_tables.len(),
            instructions: module
                .functions
                .iter()
                .flat_map(|f| &f.blocks)
                .map(|b| b.instructions.len())
                .sum(),
            access_scopes: module.functions.iter().map(|f| f.count("begin_access")).sum(),
        }
    }
}

/// Read a resolved module from its JSON form
pub fn load_module(path: &Path) -> Result<Module> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CompileError::io_error(format!("{}: {e}", path.display())))?;
    parse_module(&text)
}

pub fn parse_module(json: &str) -> Result<Module> {
    Ok(serde_json::from_str(json)?)
}

/// Lower a whole module
pub fn lower_module(module: &Module, config: &LoweringConfig) -> Result<MirModule> {
    let _span = tracing::debug_span!("lower_module", module = %module.name).entered();

    let tl = TypeLowering::new(module)?;
    let (tables, thunk_requests) = build_tables(&tl, config, &module.name)?;
    let env = LowerEnv {
        tl: &tl,
        tables: &tables,
        config,
    };

    let mut jobs = collect_jobs(module)?;
    let mut requested = HashSet::new();
    for request in thunk_requests {
        if requested.insert(request.name().to_string()) {
            jobs.push(LoweringJob::Thunk(request));
        }
    }
    tracing::debug!(jobs = jobs.len(), parallel = config.parallel, "lowering functions");

    let lowered: Vec<Vec<MirFunction>> = if config.parallel {
        jobs.par_iter().map(|job| lower_job(&env, job)).collect::<Result<_>>()?
    } else {
        jobs.iter().map(|job| lower_job(&env, job)).collect::<Result<_>>()?
    };

    let mut functions: Vec<MirFunction> = lowered.into_iter().flatten().collect();
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    functions.dedup_by(|later, earlier| later.name == earlier.name);

    let mir = MirModule {
        name: module.name.clone(),
        globals: collect_globals(module),
        functions,
        tables: Arc::new(tables),
    };
    warn_unreferenced_thunks(&mir);

    if config.verify {
        verify_module(&mir)?;
    }
    tracing::debug!(functions = mir.functions.len(), "module lowered");
    Ok(mir)
}

fn collect_jobs(module: &Module) -> Result<Vec<LoweringJob<'_>>> {
    let mut jobs: Vec<LoweringJob<'_>> = module.functions.iter().map(LoweringJob::Function).collect();

    for s in &module.structs {
        jobs.extend(s.methods.iter().map(|decl| LoweringJob::Method {
            owner: &s.name,
            owner_kind: OwnerKind::Struct,
            decl,
        }));
        member_jobs(&mut jobs, &s.name, OwnerKind::Struct, &s.properties, &s.subscripts)?;
    }
    for e in &module.enums {
        jobs.extend(e.methods.iter().map(|decl| LoweringJob::Method {
            owner: &e.name,
            owner_kind: OwnerKind::Enum,
            decl,
        }));
    }
    for c in &module.classes {
        jobs.extend(c.methods.iter().map(|decl| LoweringJob::Method {
            owner: &c.name,
            owner_kind: OwnerKind::Class,
            decl,
        }));
        member_jobs(&mut jobs, &c.name, OwnerKind::Class, &c.properties, &c.subscripts)?;
    }
    for g in &module.globals {
        jobs.push(LoweringJob::GlobalAddressor {
            global: g.name.clone(),
            ty: g.ty.clone(),
        });
        jobs.push(LoweringJob::GlobalInit {
            global: g.name.clone(),
            ty: g.ty.clone(),
            initial: &g.initial,
        });
    }
    Ok(jobs)
}

fn member_jobs<'m>(
    jobs: &mut Vec<LoweringJob<'m>>,
    owner: &'m str,
    owner_kind: OwnerKind,
    properties: &'m [crate::ast::PropertyDecl],
    subscripts: &'m [crate::ast::SubscriptDecl],
) -> Result<()> {
    for p in properties {
        if p.is_static {
            let initial = match &p.storage {
                Storage::Stored { initial: Some(e) } | Storage::Observed { initial: Some(e), .. } => e,
                Storage::Lazy { initial } => initial,
                _ => {
                    return Err(CompileError::lowering(
                        format!("static property {owner}.{} has no initial value", p.name),
                        p.span,
                    ));
                }
            };
            let global = names::static_property_global(owner, &p.name);
            jobs.push(LoweringJob::GlobalAddressor {
                global: global.clone(),
                ty: p.ty.clone(),
            });
            jobs.push(LoweringJob::GlobalInit {
                global,
                ty: p.ty.clone(),
                initial,
            });
            continue;
        }
        for kind in accessor_kinds(&p.storage, &p.ty) {
            jobs.push(LoweringJob::Accessor {
                storage: StorageDecl {
                    owner,
                    owner_kind,
                    member: &p.name,
                    ty: &p.ty,
                    index: None,
                    storage: &p.storage,
                    span: p.span,
                },
                kind,
            });
        }
    }
    for s in subscripts {
        for kind in accessor_kinds(&s.storage, &s.element) {
            jobs.push(LoweringJob::Accessor {
                storage: StorageDecl {
                    owner,
                    owner_kind,
                    member: names::SUBSCRIPT,
                    ty: &s.element,
                    index: Some(&s.index),
                    storage: &s.storage,
                    span: s.span,
                },
                kind,
            });
        }
    }
    Ok(())
}

/// Every global with its `once` token, static stored properties included
fn collect_globals(module: &Module) -> Vec<MirGlobal> {
    let statics = module
        .structs
        .iter()
        .map(|s| (&s.name, &s.properties))
        .chain(module.classes.iter().map(|c| (&c.name, &c.properties)))
        .flat_map(|(owner, props)| {
            props
                .iter()
                .filter(|p| p.is_static)
                .map(move |p| (names::static_property_global(owner, &p.name), p.ty.clone()))
        });
    let declared = module.globals.iter().map(|g| (g.name.clone(), g.ty.clone()));

    let mut globals = Vec::new();
    for (name, ty) in declared.chain(statics) {
        globals.push(MirGlobal {
            name: names::global_token(&name),
            ty: token_type(),
        });
        globals.push(MirGlobal { name, ty });
    }
    globals.sort_by(|a, b| a.name.cmp(&b.name));
    globals
}

fn warn_unreferenced_thunks(module: &MirModule) {
    let mut referenced: HashSet<&str> = HashSet::new();
    for vtable in &module.tables.vtables {
        referenced.extend(vtable.entries.iter().map(|e| e.implementation.as_str()));
    }
    for table in &module.tables.witness_tables {
        referenced.extend(table.entries.iter().map(|e| e.thunk.as_str()));
    }
    for inst in module.functions.iter().flat_map(|f| &f.blocks).flat_map(|b| &b.instructions) {
        if let MirInst::FunctionRef { function, .. } = inst {
            referenced.insert(function);
        }
    }
    for thunk in module.functions.iter().filter(|f| f.is_thunk) {
        if !referenced.contains(thunk.name.as_str()) {
            tracing::warn!(thunk = %thunk.name, "thunk is never referenced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;

    fn global_module() -> Module {
        Module {
            name: "m".into(),
            globals: vec![GlobalDecl {
                name: "counter".into(),
                ty: Type::Int,
                initial: Expr::int(7),
                span: Span::default(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_global_gets_token_addressor_and_initializer() {
        let mir = lower_module(&global_module(), &LoweringConfig::default()).unwrap();
        let names: Vec<&str> = mir.globals.iter().map(|g| g.name.as_str()).collect();
        assert!(names.contains(&"counter"));
        assert!(names.contains(&names::global_token("counter").as_str()));
        assert!(mir.function(&names::global_addressor("counter")).is_some());
        assert!(mir.function(&names::global_init_func("counter")).is_some());
    }

    #[test]
    fn test_parallel_and_serial_agree() {
        let serial = LoweringConfig {
            parallel: false,
            ..Default::default()
        };
        let a = crate::mir::format_module(&lower_module(&global_module(), &serial).unwrap());
        let b = crate::mir::format_module(&lower_module(&global_module(), &LoweringConfig::default()).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_stats_count_functions() {
        let mir = lower_module(&global_module(), &LoweringConfig::default()).unwrap();
        let stats = ModuleStats::of(&mir);
        assert_eq!(stats.functions, 2);
        assert_eq!(stats.globals, 2);
        assert_eq!(stats.thunks, 0);
    }

    #[test]
    fn test_static_property_without_initial_value_is_rejected() {
        let module = Module {
            name: "m".into(),
            structs: vec![StructDecl {
                name: "S".into(),
                generic_params: vec![],
                properties: vec![PropertyDecl {
                    name: "shared".into(),
                    ty: Type::Int,
                    is_static: true,
                    is_final: false,
                    is_override: false,
                    storage: Storage::Stored { initial: None },
                    span: Span::default(),
                }],
                subscripts: vec![],
                methods: vec![],
                span: Span::default(),
            }],
            ..Default::default()
        };
        let err = lower_module(&module, &LoweringConfig::default()).unwrap_err();
        assert!(err.message().contains("no initial value"));
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        assert!(matches!(parse_module("{"), Err(CompileError::Parse { .. })));
    }
}
