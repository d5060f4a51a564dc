//! Static field reference / modification analysis.
//!
//! The [`StaticFieldAnalyzer`] decides which static fields hold state that differs between
//! independent logical instances of a program. It traces every stack value backwards to the
//! static fields it may originate from, recording the member-access chain from each field
//! ([`StaticOrigin`]), and classifies every store, element store and mutating call by the
//! static roots of the location it writes.
//!
//! # Tracing
//!
//! Origins flow through field loads, element loads, enumerators, locals, overwritten
//! arguments and casts within a method. Across methods they flow through return summaries
//! (callee origins rooted at its own parameters are re-rooted at the caller's arguments) and
//! modified-parameter summaries (a callee writing into `param.field` writes into whatever the
//! caller passed). Chains that re-enter a recursive type-flow component are collapsed into one
//! [`MemberStep::CycleLoop`]; a depth limit bounds chains through untyped values.
//!
//! # Conversion set
//!
//! [`StaticFieldAnalyzer::report`] restricts the per-method results to what is reachable from
//! the entry points (and, separately, from the init-only methods) and derives the
//! [`StaticFieldReport::converted`] set from them.

mod chain;
mod report;
mod tracer;

use std::collections::BTreeSet;

use crate::{
    analysis::{CallGraph, Diagnostics, JumpSiteCache, TypeFlowIndex},
    assembly::Opcode,
    metadata::{Module, Token},
    Result,
};

pub use chain::{MemberStep, StaticOrigin};
pub use report::{ModificationRecord, StaticFieldReport};

use chain::ChainContext;
use tracer::Tracer;

/// Limits of the static field analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerConfig {
    /// Maximum number of sweeps over all bodies
    pub max_iterations: usize,
    /// Maximum number of member steps kept in a chain
    pub max_chain_depth: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            max_iterations: 64,
            max_chain_depth: 8,
        }
    }
}

/// Statistics of an analyzer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerStats {
    /// Sweeps performed
    pub iterations: usize,
    /// `false` if the iteration limit stopped the fixed point
    pub converged: bool,
    /// Instructions whose pushed value has at least one origin
    pub traced_values: usize,
    /// Methods with a non-empty return or modified-parameter summary
    pub summaries: usize,
}

/// Fixed-point static field analyzer over one module snapshot.
pub struct StaticFieldAnalyzer<'a> {
    module: &'a Module,
    callgraph: &'a CallGraph,
    tracer: Tracer<'a>,
    stats: AnalyzerStats,
}

impl<'a> StaticFieldAnalyzer<'a> {
    /// Runs the analysis to its fixed point.
    ///
    /// Reaching `config.max_iterations` records an
    /// [`crate::analysis::DiagnosticKind::IterationLimit`] diagnostic; the partial result is
    /// kept.
    ///
    /// # Errors
    /// Returns an error if a method body cannot be read.
    pub fn run(
        module: &'a Module,
        callgraph: &'a CallGraph,
        typeflow: &'a TypeFlowIndex,
        jumps: &JumpSiteCache,
        diagnostics: &Diagnostics,
        config: AnalyzerConfig,
    ) -> Result<Self> {
        let chains = ChainContext {
            module,
            typeflow,
            max_depth: config.max_chain_depth,
        };
        let mut tracer = Tracer::new(chains, callgraph, jumps)?;
        let (iterations, converged) = tracer.solve(config.max_iterations, diagnostics)?;

        let summaries = tracer
            .state
            .returns
            .keys()
            .chain(tracer.state.modified_params.keys())
            .collect::<BTreeSet<_>>()
            .len();
        let stats = AnalyzerStats {
            iterations,
            converged,
            traced_values: tracer.traced_values(),
            summaries,
        };
        log::debug!(
            "static field analysis: {} sweeps, {} traced values, {} summaries",
            stats.iterations,
            stats.traced_values,
            stats.summaries
        );
        Ok(StaticFieldAnalyzer {
            module,
            callgraph,
            tracer,
            stats,
        })
    }

    /// Static fields the value pushed by the instruction at `index` of `method` may originate
    /// from, with access chains. Parameter origins are resolved through every caller.
    #[must_use]
    pub fn trace(&self, method: Token, index: usize) -> BTreeSet<StaticOrigin> {
        match self.tracer.state.values.get(&(method, index)) {
            Some(origins) => self.tracer.resolve_to_statics(method, origins),
            None => BTreeSet::new(),
        }
    }

    /// Static-rooted locations written inside `method`, including writes performed by callees
    /// on arguments the method passed.
    #[must_use]
    pub fn modifications_in(&self, method: Token) -> Vec<ModificationRecord> {
        self.tracer
            .state
            .modifications
            .get(&method)
            .into_iter()
            .flatten()
            .filter_map(|(offset, origin)| {
                origin.to_static().map(|origin| ModificationRecord {
                    method,
                    offset: *offset,
                    origin,
                })
            })
            .collect()
    }

    /// Returns `true` if `method` writes into state reachable from its parameter `arg`.
    #[must_use]
    pub fn modifies_param(&self, method: Token, arg: u16) -> bool {
        self.tracer
            .state
            .modified_params
            .get(&method)
            .is_some_and(|written| written.iter().any(|o| o.param() == Some(arg)))
    }

    /// Builds the report for the given entry points and init-only methods.
    ///
    /// Static constructors are always treated as init-only when `include_static_constructors`
    /// is set.
    #[must_use]
    pub fn report(
        &self,
        entry_points: &[Token],
        init_only: &[Token],
        include_static_constructors: bool,
    ) -> StaticFieldReport {
        let mut report = StaticFieldReport::default();

        let reachable = self.callgraph.reachable_from(entry_points);
        let mut init_roots = init_only.to_vec();
        if include_static_constructors {
            init_roots.extend(
                self.module
                    .methods()
                    .filter(|m| m.is_static_constructor() && m.has_body())
                    .map(|m| m.token),
            );
        }
        let init_reachable = self.callgraph.reachable_from(&init_roots);

        for method in &reachable {
            let Ok(body) = self.module.body(*method) else {
                continue;
            };
            for instr in &body.instructions {
                if matches!(instr.opcode, Opcode::Ldsfld | Opcode::Stsfld) {
                    if let Some(field) = instr.token().filter(|f| self.is_tracked(*f)) {
                        report.referenced.insert(field);
                    }
                }
            }
        }

        let mut records = BTreeSet::new();
        for (methods, into_init) in [(&reachable, false), (&init_reachable, true)] {
            for method in methods {
                for record in self.modifications_in(*method) {
                    if !self.is_tracked(record.origin.field) {
                        continue;
                    }
                    if into_init {
                        report.init_only_modified.insert(record.origin.field);
                    } else {
                        report.modified.insert(record.origin.field);
                    }
                    records.insert(record);
                }
            }
        }
        report.modifications = records.into_iter().collect();

        report.converted = report
            .init_only_modified
            .intersection(&report.referenced)
            .chain(report.modified.iter())
            .copied()
            .collect();

        log::info!(
            "static fields: {} referenced, {} modified, {} init-only, {} converted",
            report.referenced.len(),
            report.modified.len(),
            report.init_only_modified.len(),
            report.converted.len()
        );
        report
    }

    /// Statistics of the run.
    #[must_use]
    pub fn stats(&self) -> AnalyzerStats {
        self.stats
    }

    /// Mutable static fields declared by the program itself.
    fn is_tracked(&self, field: Token) -> bool {
        let Ok(def) = self.module.field(field) else {
            return false;
        };
        def.is_static()
            && !def.is_literal()
            && self
                .module
                .type_def(def.declaring_type)
                .is_ok_and(|ty| !ty.is_runtime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{CallbackGraph, InheritanceGraph},
        metadata::{MethodModifiers, ModuleBuilder, TypeSig},
    };

    struct Fixture {
        module: Module,
        inheritance: InheritanceGraph,
        jumps: JumpSiteCache,
        diagnostics: Diagnostics,
    }

    impl Fixture {
        fn new(module: Module) -> Self {
            Fixture {
                inheritance: InheritanceGraph::new(&module),
                module,
                jumps: JumpSiteCache::new(),
                diagnostics: Diagnostics::new(),
            }
        }

        fn run<R>(&self, check: impl FnOnce(&StaticFieldAnalyzer<'_>) -> R) -> R {
            let callbacks = CallbackGraph::build(
                &self.module,
                &self.inheritance,
                &self.jumps,
                &self.diagnostics,
                16,
            )
            .unwrap();
            let callgraph = CallGraph::build(
                &self.module,
                &self.inheritance,
                &callbacks,
                &self.jumps,
                &self.diagnostics,
            )
            .unwrap();
            let typeflow = TypeFlowIndex::build(&self.module).unwrap();
            let analyzer = StaticFieldAnalyzer::run(
                &self.module,
                &callgraph,
                &typeflow,
                &self.jumps,
                &self.diagnostics,
                AnalyzerConfig::default(),
            )
            .unwrap();
            check(&analyzer)
        }
    }

    /// `static Player player; Main() { var p = player; p.<member> ... }`
    fn player_module(write: bool) -> (Module, Token, Token, Token) {
        let mut builder = ModuleBuilder::new("Players").unwrap();
        let player = builder.class("Game", "Player");
        let score = builder.field(player, "score", TypeSig::I4).unwrap();
        let program = builder.static_class("Game", "Program");
        let current = builder
            .static_field(program, "current", TypeSig::Class(player))
            .unwrap();
        let main = builder
            .method(program, "Main")
            .flags(MethodModifiers::STATIC)
            .local(TypeSig::Class(player))
            .implementation(move |asm| {
                asm.ldsfld(current)?.stloc(0)?;
                if write {
                    asm.ldloc(0)?.ldc_i4(10)?.stfld(score)?;
                } else {
                    asm.ldloc(0)?.ldfld(score)?.pop()?;
                }
                asm.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        (builder.build(), current, score, main)
    }

    #[test]
    fn test_write_through_local_marks_field_modified() {
        let (module, current, score, main) = player_module(true);
        let fixture = Fixture::new(module);
        fixture.run(|analyzer| {
            let report = analyzer.report(&[main], &[], true);
            assert!(report.referenced.contains(&current));
            assert!(report.modified.contains(&current));
            assert!(report.is_converted(current));
            let record = report.modifications_of(current).next().unwrap();
            assert_eq!(record.method, main);
            assert_eq!(record.offset, 4);
            assert_eq!(record.origin.chain, vec![MemberStep::Field(score)]);
            assert!(analyzer.stats().converged);
        });
    }

    #[test]
    fn test_read_through_local_is_not_a_modification() {
        let (module, current, score, main) = player_module(false);
        let fixture = Fixture::new(module);
        fixture.run(|analyzer| {
            let report = analyzer.report(&[main], &[], true);
            assert!(report.referenced.contains(&current));
            assert!(report.modified.is_empty());
            assert!(report.converted.is_empty());
            assert_eq!(
                analyzer.trace(main, 3),
                BTreeSet::from([StaticOrigin {
                    field: current,
                    chain: vec![MemberStep::Field(score)],
                }])
            );
        });
    }

    #[test]
    fn test_modification_through_callee_parameter() {
        let mut builder = ModuleBuilder::new("Inventory").unwrap();
        let core = *builder.core();
        let items = core.list_of(TypeSig::I4);
        let program = builder.static_class("Game", "Program");
        let stock = builder.static_field(program, "stock", items.clone()).unwrap();
        let add_one = builder
            .method(program, "AddOne")
            .flags(MethodModifiers::STATIC)
            .param("target", items)
            .implementation(move |asm| {
                asm.ldarg(0)?.ldc_i4(1)?.callvirt(core.list_add)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let main = builder
            .method(program, "Main")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.ldsfld(stock)?.call(add_one)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let fixture = Fixture::new(builder.build());
        fixture.run(|analyzer| {
            assert!(analyzer.modifies_param(add_one, 0));
            let report = analyzer.report(&[main], &[], true);
            assert!(report.modified.contains(&stock));
            let record = report.modifications_of(stock).next().unwrap();
            assert_eq!(record.method, main);
            assert_eq!(record.offset, 1);
            assert_eq!(record.origin.chain, vec![MemberStep::Element]);
            assert_eq!(
                analyzer.trace(add_one, 0),
                BTreeSet::from([StaticOrigin {
                    field: stock,
                    chain: Vec::new(),
                }])
            );
        });
    }

    #[test]
    fn test_getter_return_summary_and_init_only_fields() {
        let mut builder = ModuleBuilder::new("Config").unwrap();
        let settings = builder.class("Game", "Settings");
        let volume = builder.field(settings, "volume", TypeSig::I4).unwrap();
        let settings_ctor = builder.default_constructor(settings).unwrap();
        let program = builder.static_class("Game", "Program");
        let active = builder
            .static_field(program, "active", TypeSig::Class(settings))
            .unwrap();
        let limit = builder.static_field(program, "limit", TypeSig::I4).unwrap();
        builder
            .static_constructor(program)
            .implementation(move |asm| {
                asm.newobj(settings_ctor)?
                    .stsfld(active)?
                    .ldc_i4(3)?
                    .stsfld(limit)?
                    .ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let get_active = builder
            .method(program, "GetActive")
            .flags(MethodModifiers::STATIC)
            .returns(TypeSig::Class(settings))
            .implementation(move |asm| {
                asm.ldsfld(active)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let main = builder
            .method(program, "Main")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.call(get_active)?
                    .ldc_i4(5)?
                    .stfld(volume)?
                    .ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let fixture = Fixture::new(builder.build());
        fixture.run(|analyzer| {
            let report = analyzer.report(&[main], &[], true);
            assert!(report.modified.contains(&active));
            assert!(report.init_only_modified.contains(&limit));
            assert!(!report.referenced.contains(&limit));
            assert!(!report.is_converted(limit));
            assert!(report.is_converted(active));

            let without_cctors = analyzer.report(&[main], &[], false);
            assert!(without_cctors.init_only_modified.is_empty());
        });
    }
}
