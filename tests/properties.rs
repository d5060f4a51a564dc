//! Behavioural properties of a weave: evaluation order, singleton reuse and id maps.

use ctxweave::{
    analysis::{DiagnosticKind, StackDepths},
    context::{IdMap, ROOT_FIELD},
    metadata::method::CTOR_NAME,
    prelude::*,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `n = n * 10 + Tick()` where `Tick` increments `n` and returns it.
///
/// The old value of `n` is read before `Tick` runs, so starting from 1 the result is
/// `1 * 10 + 2 = 12`. A rewrite that evaluates the context load after the call, or reads `n`
/// through a different instance, produces a different number.
fn ordered_program() -> (Module, Token, Token, Token) {
    let mut builder = ModuleBuilder::new("Order").unwrap();
    let counter = builder.static_class("Game", "Counter");
    let n = builder.static_field(counter, "n", TypeSig::I4).unwrap();
    builder
        .static_constructor(counter)
        .implementation(move |asm| {
            asm.ldc_i4(1)?.stsfld(n)?.ret()?;
            Ok(())
        })
        .build()
        .unwrap();
    let tick = builder
        .method(counter, "Tick")
        .flags(MethodModifiers::STATIC)
        .returns(TypeSig::I4)
        .implementation(move |asm| {
            asm.ldsfld(n)?
                .ldc_i4(1)?
                .add()?
                .stsfld(n)?
                .ldsfld(n)?
                .ret()?;
            Ok(())
        })
        .build()
        .unwrap();
    let run = builder
        .method(counter, "Run")
        .flags(MethodModifiers::STATIC)
        .implementation(move |asm| {
            asm.ldsfld(n)?
                .ldc_i4(10)?
                .mul()?
                .call(tick)?
                .add()?
                .stsfld(n)?
                .ret()?;
            Ok(())
        })
        .build()
        .unwrap();
    (builder.build(), counter, n, run)
}

#[test]
fn test_evaluation_order_is_preserved() {
    init_logging();
    let (module, counter, n, run) = ordered_program();

    let mut original = Interpreter::new(&module);
    original.call(run, &[]).unwrap();
    let expected = original.static_field(n).unwrap();
    assert_eq!(expected, EmValue::I32(12));

    let config = WeaveConfig::default().with_entry_points([run]);
    let output = PatchPipeline::standard().weave(module, config).unwrap();
    let record = output.context_of(counter).unwrap();
    let link = record.link_field().unwrap();
    let bound_n = output.field_map.get(n).unwrap();
    let bound_run = output.method_map.get(run).unwrap();
    let root_ctor = output
        .module
        .find_method(output.root_type.unwrap(), CTOR_NAME)
        .unwrap();

    let mut rewritten = Interpreter::new(&output.module);
    let root = rewritten.construct(root_ctor, &[]).unwrap();
    let ctx = rewritten.field(&root, link).unwrap();
    rewritten.call(bound_run, &[ctx.clone()]).unwrap();
    assert_eq!(rewritten.field(&ctx, bound_n).unwrap(), expected);
}

/// `class Log { int trace; int A() { trace = trace * 10 + 1; return trace; } int B() { ... + 2 } }`
/// `static class Sink { static int total; static void Take(int a, int b) { total = a*100 + b; } }`
/// `static class Program { static void Run() { var l = new Log(); Sink.Take(l.A(), l.B()); } }`
struct ArgumentProgram {
    module: Module,
    sink: Token,
    total: Token,
    take: Token,
    run: Token,
}

/// `int name() { trace = trace * 10 + digit; return trace; }` on `log`.
fn log_step(
    builder: &mut ModuleBuilder,
    log: Token,
    trace: Token,
    name: &str,
    digit: i32,
) -> Token {
    builder
        .method(log, name)
        .returns(TypeSig::I4)
        .implementation(move |asm| {
            asm.ldarg(0)?
                .ldarg(0)?
                .ldfld(trace)?
                .ldc_i4(10)?
                .mul()?
                .ldc_i4(digit)?
                .add()?
                .stfld(trace)?
                .ldarg(0)?
                .ldfld(trace)?
                .ret()?;
            Ok(())
        })
        .build()
        .unwrap()
}

fn argument_program() -> ArgumentProgram {
    let mut builder = ModuleBuilder::new("Arguments").unwrap();
    let log = builder.class("Game", "Log");
    let log_ctor = builder.default_constructor(log).unwrap();
    let trace = builder.field(log, "trace", TypeSig::I4).unwrap();
    let a = log_step(&mut builder, log, trace, "A", 1);
    let b = log_step(&mut builder, log, trace, "B", 2);

    let sink = builder.static_class("Game", "Sink");
    let total = builder.static_field(sink, "total", TypeSig::I4).unwrap();
    let take = builder
        .method(sink, "Take")
        .flags(MethodModifiers::STATIC)
        .param("a", TypeSig::I4)
        .param("b", TypeSig::I4)
        .implementation(move |asm| {
            asm.ldarg(0)?
                .ldc_i4(100)?
                .mul()?
                .ldarg(1)?
                .add()?
                .stsfld(total)?
                .ret()?;
            Ok(())
        })
        .build()
        .unwrap();

    let program = builder.static_class("Game", "Program");
    let run = builder
        .method(program, "Run")
        .flags(MethodModifiers::STATIC)
        .local(TypeSig::Class(log))
        .implementation(move |asm| {
            asm.newobj(log_ctor)?
                .stloc(0)?
                .ldloc(0)?
                .callvirt(a)?
                .ldloc(0)?
                .callvirt(b)?
                .call(take)?
                .ret()?;
            Ok(())
        })
        .build()
        .unwrap();

    ArgumentProgram {
        module: builder.build(),
        sink,
        total,
        take,
        run,
    }
}

#[test]
fn test_call_arguments_keep_their_order() {
    init_logging();
    let program = argument_program();
    let original = program.module.clone();
    let original_body = original.body(program.run).unwrap().clone();
    let original_depths = StackDepths::compute(&original, program.run).unwrap();

    let mut interpreter = Interpreter::new(&original);
    interpreter.call(program.run, &[]).unwrap();
    let expected = interpreter.static_field(program.total).unwrap();
    assert_eq!(expected, EmValue::I32(112));

    let config = WeaveConfig::default().with_entry_points([program.run]);
    let output = PatchPipeline::standard()
        .weave(program.module, config)
        .unwrap();
    let bound_run = output.method_map.get(program.run).unwrap();
    let bound_take = output.method_map.get(program.take).unwrap();
    let rewritten = output.module.body(bound_run).unwrap();
    let rewritten_depths = StackDepths::compute(&output.module, bound_run).unwrap();

    // Every original instruction survives, in order, with calls pointing at bound methods.
    let translated: Vec<Instruction> = original_body
        .instructions
        .iter()
        .map(|instr| match (instr.opcode, instr.token()) {
            (Opcode::Call | Opcode::Callvirt | Opcode::Newobj, Some(token)) => {
                Instruction::with_token(instr.opcode, output.method_map.translate(token))
            }
            _ => instr.clone(),
        })
        .collect();
    let mut positions = Vec::with_capacity(translated.len());
    let mut cursor = 0;
    for instr in &translated {
        let found = rewritten.instructions[cursor..]
            .iter()
            .position(|candidate| candidate == instr)
            .map(|offset| cursor + offset)
            .unwrap_or_else(|| panic!("{instr:?} missing or out of order"));
        positions.push(found);
        cursor = found + 1;
    }

    // `ldloc 0; callvirt A; ldloc 0; callvirt B; call Take`
    let take_at = translated
        .iter()
        .position(|i| i.token() == Some(bound_take))
        .unwrap();
    let arguments = 2..=take_at;
    assert_eq!(rewritten.instructions.len(), translated.len() + 2);
    assert_eq!(positions[2] - positions[1], 3);

    // The context instance sits below both arguments until the call consumes it.
    for (index, position) in positions.iter().enumerate() {
        let before = original_depths.depth(index).unwrap();
        let after = rewritten_depths.depth(*position).unwrap();
        let held = u16::from(arguments.contains(&index));
        assert_eq!(after, before + held, "depth at original instruction {index}");
    }

    let record = output.context_of(program.sink).unwrap();
    let link = record.link_field().unwrap();
    let bound_total = output.field_map.get(program.total).unwrap();
    let root_ctor = output
        .module
        .find_method(output.root_type.unwrap(), CTOR_NAME)
        .unwrap();
    let mut rewritten_run = Interpreter::new(&output.module);
    let root = rewritten_run.construct(root_ctor, &[]).unwrap();
    rewritten_run.call(bound_run, &[root.clone()]).unwrap();
    let ctx = rewritten_run.field(&root, link).unwrap();
    assert_eq!(rewritten_run.field(&ctx, bound_total).unwrap(), expected);
}

struct SingletonProgram {
    module: Module,
    engine: Token,
    instance: Token,
    frames: Token,
    setup: Token,
    count: Token,
}

/// `class Engine { static int frames; static void Count() { frames++; } }`
/// `static class Registry { static Engine engine; static void Setup() { engine = new Engine(); } }`
fn singleton_program(second_site: bool) -> SingletonProgram {
    let mut builder = ModuleBuilder::new("Singleton").unwrap();
    let engine = builder.class("Game", "Engine");
    let ctor = builder.default_constructor(engine).unwrap();
    let frames = builder.static_field(engine, "frames", TypeSig::I4).unwrap();
    let count = builder
        .method(engine, "Count")
        .flags(MethodModifiers::STATIC)
        .implementation(move |asm| {
            asm.ldsfld(frames)?.ldc_i4(1)?.add()?.stsfld(frames)?.ret()?;
            Ok(())
        })
        .build()
        .unwrap();

    let registry = builder.static_class("Services", "Registry");
    let instance = builder
        .static_field(registry, "engine", TypeSig::Class(engine))
        .unwrap();
    let setup = builder
        .method(registry, "Setup")
        .flags(MethodModifiers::STATIC)
        .implementation(move |asm| {
            asm.newobj(ctor)?.stsfld(instance)?;
            if second_site {
                asm.newobj(ctor)?.pop()?;
            }
            asm.ret()?;
            Ok(())
        })
        .build()
        .unwrap();

    SingletonProgram {
        module: builder.build(),
        engine,
        instance,
        frames,
        setup,
        count,
    }
}

#[test]
fn test_single_site_singleton_is_reused() {
    init_logging();
    let program = singleton_program(false);
    let config = WeaveConfig::default().with_entry_points([program.setup, program.count]);
    let output = PatchPipeline::standard()
        .weave(program.module, config)
        .unwrap();

    let record = output.context_of(program.engine).unwrap();
    assert!(record.reused);
    assert_eq!(record.context_type, program.engine);
    assert_eq!(record.chain.len(), 2);
    assert_eq!(
        record.link_field(),
        output.field_map.get(program.instance)
    );

    // State of a reused type stays on the type itself.
    assert_eq!(output.field_map.get(program.frames), Some(program.frames));
    assert!(!output.module.field(program.frames).unwrap().is_static());
    let bound_count = output.method_map.get(program.count).unwrap();
    assert_eq!(
        output.module.method(bound_count).unwrap().declaring_type,
        program.engine
    );
    let root_field = output.module.find_field(program.engine, ROOT_FIELD).unwrap();

    let registry_record = output
        .context_types
        .iter()
        .find(|r| r.chain.len() == 1)
        .unwrap();
    let registry_link = registry_record.link_field().unwrap();
    let bound_instance = output.field_map.get(program.instance).unwrap();
    let bound_setup = output.method_map.get(program.setup).unwrap();
    let root_ctor = output
        .module
        .find_method(output.root_type.unwrap(), CTOR_NAME)
        .unwrap();

    let mut interpreter = Interpreter::new(&output.module);
    let root = interpreter.construct(root_ctor, &[]).unwrap();
    let registry_ctx = interpreter.field(&root, registry_link).unwrap();
    interpreter.call(bound_setup, &[registry_ctx.clone()]).unwrap();

    let engine = interpreter.field(&registry_ctx, bound_instance).unwrap();
    assert!(!engine.is_null());
    assert_eq!(interpreter.field(&engine, root_field).unwrap(), root);

    interpreter.call(bound_count, &[engine.clone()]).unwrap();
    assert_eq!(
        interpreter.field(&engine, program.frames).unwrap(),
        EmValue::I32(1)
    );
}

/// `class Engine { static Engine instance; static int frames; static void Init() { instance =
/// new Engine(); } static void Count() { frames++; } }`
#[test]
fn test_self_held_singleton_is_reused() {
    init_logging();
    let mut builder = ModuleBuilder::new("SelfHeld").unwrap();
    let engine = builder.class("Game", "Engine");
    let ctor = builder.default_constructor(engine).unwrap();
    let instance = builder
        .static_field(engine, "instance", TypeSig::Class(engine))
        .unwrap();
    let frames = builder.static_field(engine, "frames", TypeSig::I4).unwrap();
    let init = builder
        .method(engine, "Init")
        .flags(MethodModifiers::STATIC)
        .implementation(move |asm| {
            asm.newobj(ctor)?.stsfld(instance)?.ret()?;
            Ok(())
        })
        .build()
        .unwrap();
    let count = builder
        .method(engine, "Count")
        .flags(MethodModifiers::STATIC)
        .implementation(move |asm| {
            asm.ldsfld(frames)?.ldc_i4(1)?.add()?.stsfld(frames)?.ret()?;
            Ok(())
        })
        .build()
        .unwrap();

    let config = WeaveConfig::default().with_entry_points([init, count]);
    let output = PatchPipeline::standard()
        .weave(builder.build(), config)
        .unwrap();
    let root_type = output.root_type.unwrap();

    let record = output.context_of(engine).unwrap();
    assert!(record.reused);
    assert_eq!(record.context_type, engine);
    assert_eq!(record.chain.len(), 1);
    let link = record.link_field().unwrap();
    assert_eq!(output.field_map.get(instance), Some(link));
    assert_eq!(output.module.field(link).unwrap().declaring_type, root_type);
    assert!(!output
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::BorderlineSingleton));

    // Init creates the instance, so it takes the root instead of running on it.
    let bound_init = output.method_map.get(init).unwrap();
    let init_def = output.module.method(bound_init).unwrap();
    assert!(init_def.is_static());
    assert_eq!(init_def.params.len(), 1);
    assert_eq!(init_def.params[0].sig, TypeSig::Class(root_type));
    let bound_count = output.method_map.get(count).unwrap();
    let count_def = output.module.method(bound_count).unwrap();
    assert!(!count_def.is_static());
    assert_eq!(count_def.declaring_type, engine);
    assert_eq!(output.field_map.get(frames), Some(frames));
    let root_field = output.module.find_field(engine, ROOT_FIELD).unwrap();

    let root_ctor = output.module.find_method(root_type, CTOR_NAME).unwrap();
    let mut interpreter = Interpreter::new(&output.module);
    let first = interpreter.construct(root_ctor, &[]).unwrap();
    let second = interpreter.construct(root_ctor, &[]).unwrap();
    interpreter.call(bound_init, &[first.clone()]).unwrap();
    interpreter.call(bound_init, &[second.clone()]).unwrap();

    let first_engine = interpreter.field(&first, link).unwrap();
    let second_engine = interpreter.field(&second, link).unwrap();
    assert!(!first_engine.is_null());
    assert_ne!(first_engine, second_engine);
    assert_eq!(interpreter.field(&first_engine, root_field).unwrap(), first);

    interpreter.call(bound_count, &[first_engine.clone()]).unwrap();
    interpreter.call(bound_count, &[first_engine.clone()]).unwrap();
    interpreter.call(bound_count, &[second_engine.clone()]).unwrap();
    assert_eq!(interpreter.field(&first_engine, frames).unwrap(), EmValue::I32(2));
    assert_eq!(interpreter.field(&second_engine, frames).unwrap(), EmValue::I32(1));
}

#[test]
fn test_second_construction_site_synthesizes_context_type() {
    init_logging();
    let program = singleton_program(true);
    let config = WeaveConfig::default().with_entry_points([program.setup, program.count]);
    let output = PatchPipeline::standard()
        .weave(program.module, config)
        .unwrap();

    let record = output.context_of(program.engine).unwrap();
    assert!(!record.reused);
    assert_ne!(record.context_type, program.engine);
    assert_ne!(output.field_map.get(program.frames), Some(program.frames));
    assert!(output
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::BorderlineSingleton));
}

#[test]
fn test_id_maps_survive_json() {
    init_logging();
    let program = singleton_program(false);
    let config = WeaveConfig::default().with_entry_points([program.setup, program.count]);
    let output = PatchPipeline::standard()
        .weave(program.module, config)
        .unwrap();

    let json: serde_json::Value = serde_json::from_str(&output.id_maps_json().unwrap()).unwrap();
    let methods = IdMap::from_json(&json["methods"].to_string()).unwrap();
    let fields = IdMap::from_json(&json["fields"].to_string()).unwrap();
    assert_eq!(methods, output.method_map);
    assert_eq!(fields, output.field_map);

    for (original, bound) in methods.iter() {
        assert_eq!(methods.original_of(bound), Some(original));
        // Translating twice changes nothing.
        assert_eq!(methods.translate(methods.translate(original)), bound);
    }
}

#[test]
fn test_weave_is_deterministic() {
    init_logging();
    let first = singleton_program(false);
    let second = singleton_program(false);
    let config = |p: &SingletonProgram| {
        WeaveConfig::default().with_entry_points([p.setup, p.count])
    };
    let config_first = config(&first);
    let config_second = config(&second);

    let a = PatchPipeline::standard()
        .weave(first.module, config_first)
        .unwrap();
    let b = PatchPipeline::standard()
        .weave(second.module, config_second)
        .unwrap();

    assert_eq!(a.id_maps_json().unwrap(), b.id_maps_json().unwrap());
    assert_eq!(a.module.methods().count(), b.module.methods().count());
    assert_eq!(a.report.converted, b.report.converted);
}
