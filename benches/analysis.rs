//! Benchmarks for whole-program analysis and the full weave.
//!
//! The synthetic program has `width` static classes, each with a counter, a static
//! initializer and a `Bump` method, and a `Program.Main` that calls every `Bump`:
//! - Call graph construction (inheritance, callbacks, call graph)
//! - Static field analysis from `Main`
//! - Full weave through the standard pipeline

extern crate ctxweave;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ctxweave::{
    analysis::{
        AnalyzerConfig, CallGraph, CallbackGraph, Diagnostics, InheritanceGraph, JumpSiteCache,
        StaticFieldAnalyzer, TypeFlowIndex,
    },
    prelude::*,
};
use std::hint::black_box;

fn synthetic_module(width: usize) -> (Module, Token) {
    let mut builder = ModuleBuilder::new("Bench").unwrap();
    let mut bumps = Vec::with_capacity(width);
    for i in 0..width {
        let ty = builder.static_class("Bench", &format!("Counter{i}"));
        let n = builder.static_field(ty, "n", TypeSig::I4).unwrap();
        builder
            .static_constructor(ty)
            .implementation(move |asm| {
                asm.ldc_i4(1)?.stsfld(n)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        let bump = builder
            .method(ty, "Bump")
            .flags(MethodModifiers::STATIC)
            .implementation(move |asm| {
                asm.ldsfld(n)?.ldc_i4(1)?.add()?.stsfld(n)?.ret()?;
                Ok(())
            })
            .build()
            .unwrap();
        bumps.push(bump);
    }
    let program = builder.static_class("Bench", "Program");
    let main = builder
        .method(program, "Main")
        .flags(MethodModifiers::STATIC)
        .implementation(move |asm| {
            for bump in &bumps {
                asm.call(*bump)?;
            }
            asm.ret()?;
            Ok(())
        })
        .build()
        .unwrap();
    (builder.build(), main)
}

fn bench_call_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_graph");
    for width in [16usize, 128] {
        let (module, _) = synthetic_module(width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &module, |b, module| {
            b.iter(|| {
                let diagnostics = Diagnostics::new();
                let jumps = JumpSiteCache::new();
                let inheritance = InheritanceGraph::new(module);
                let callbacks =
                    CallbackGraph::build(module, &inheritance, &jumps, &diagnostics, 64).unwrap();
                let graph =
                    CallGraph::build(module, &inheritance, &callbacks, &jumps, &diagnostics)
                        .unwrap();
                black_box(graph)
            });
        });
    }
    group.finish();
}

fn bench_static_fields(c: &mut Criterion) {
    let (module, main) = synthetic_module(128);
    let diagnostics = Diagnostics::new();
    let jumps = JumpSiteCache::new();
    let inheritance = InheritanceGraph::new(&module);
    let callbacks = CallbackGraph::build(&module, &inheritance, &jumps, &diagnostics, 64).unwrap();
    let graph = CallGraph::build(&module, &inheritance, &callbacks, &jumps, &diagnostics).unwrap();
    let typeflow = TypeFlowIndex::build(&module).unwrap();

    c.bench_function("static_fields_128", |b| {
        b.iter(|| {
            let analyzer = StaticFieldAnalyzer::run(
                &module,
                &graph,
                &typeflow,
                &jumps,
                &diagnostics,
                AnalyzerConfig::default(),
            )
            .unwrap();
            black_box(analyzer.report(black_box(&[main]), &[], true))
        });
    });
}

fn bench_weave(c: &mut Criterion) {
    let mut group = c.benchmark_group("weave");
    group.sample_size(20);
    for width in [16usize, 64] {
        let (module, main) = synthetic_module(width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &module, |b, module| {
            b.iter(|| {
                let config = WeaveConfig::default().with_entry_points([main]);
                let output = PatchPipeline::standard()
                    .weave(module.clone(), config)
                    .unwrap();
                black_box(output)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_call_graph, bench_static_fields, bench_weave);
criterion_main!(benches);
