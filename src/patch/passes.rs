//! The standard patch passes.

use crate::{
    analysis::{StackDepths, StaticFieldAnalyzer},
    context::{finalize, ContextInjector, ContextModel, Planner, SingletonIndex},
    patch::{PatchArguments, PatchPass},
    Result,
};

/// Builds the whole-program analyses and computes the static field report.
#[derive(Debug, Default)]
pub struct AnalyzeStaticStatePass;

impl PatchPass for AnalyzeStaticStatePass {
    fn name(&self) -> &'static str {
        "analyze-static-state"
    }

    fn description(&self) -> &'static str {
        "Finds the static fields that must become per-context state"
    }

    fn run(&mut self, args: &mut PatchArguments) -> Result<bool> {
        args.callgraph()?;
        args.typeflow()?;
        let (Some(callgraph), Some(typeflow)) = (&args.callgraph, &args.typeflow) else {
            return Ok(false);
        };
        let stats = callgraph.stats();
        log::info!(
            "Call graph: {} method(s), {} edge(s), {:.1}% of {} call site(s) resolved",
            stats.method_count,
            stats.edge_count,
            stats.resolution_rate() * 100.0,
            stats.total_call_sites
        );

        let analyzer = StaticFieldAnalyzer::run(
            &args.snapshot,
            callgraph,
            typeflow,
            &args.jumps,
            &args.diagnostics,
            args.config.analyzer,
        )?;
        let entry_points = if args.config.entry_points.is_empty() {
            callgraph.entry_points().to_vec()
        } else {
            args.config.entry_points.clone()
        };
        let report = analyzer.report(
            &entry_points,
            &args.config.init_only,
            args.config.include_static_constructors,
        );
        args.report = Some(report);
        Ok(false)
    }
}

/// Creates the root context and binds every converted field to a context-bound slot.
#[derive(Debug, Default)]
pub struct BuildContextModelPass;

impl PatchPass for BuildContextModelPass {
    fn name(&self) -> &'static str {
        "build-context-model"
    }

    fn description(&self) -> &'static str {
        "Synthesizes context types or reuses singletons for converted state"
    }

    fn run(&mut self, args: &mut PatchArguments) -> Result<bool> {
        let converted = args.report()?.converted.clone();
        let singletons = SingletonIndex::build(&args.snapshot, &args.jumps)?;
        let mut model = ContextModel::new(
            &mut args.module,
            singletons,
            converted.clone(),
            args.config.names.clone(),
        )?;
        for field in &converted {
            model.bind_field(&mut args.module, *field, &args.diagnostics)?;
        }
        log::info!(
            "Context model: {} record(s) for {} converted field(s)",
            model.len(),
            converted.len()
        );
        args.model = Some(model);
        Ok(true)
    }
}

/// Decides how every method reaches the root context.
#[derive(Debug, Default)]
pub struct PlanBoundnessPass;

impl PatchPass for PlanBoundnessPass {
    fn name(&self) -> &'static str {
        "plan-boundness"
    }

    fn description(&self) -> &'static str {
        "Derives the boundness of every method and the root-carrying types"
    }

    fn run(&mut self, args: &mut PatchArguments) -> Result<bool> {
        let converted = args.report()?.converted.clone();
        args.inheritance();
        let (Some(inheritance), Some(model)) = (&args.inheritance, &mut args.model) else {
            return Err(crate::Error::Pipeline(
                "boundness planning needs a context model".to_string(),
            ));
        };
        let planner = Planner::new(
            &args.snapshot,
            &converted,
            inheritance,
            &args.cache,
            &args.diagnostics,
            args.config.max_binding_rounds,
        )?;
        let plan = planner.run(&mut args.module, model)?;
        log::info!(
            "{} bound method(s), {} carrier type(s)",
            args.cache.bound().len(),
            plan.carriers().len()
        );
        args.plan = Some(plan);
        Ok(true)
    }
}

/// Rewrites bound methods so the root context reaches every use.
#[derive(Debug, Default)]
pub struct InjectContextPass;

impl PatchPass for InjectContextPass {
    fn name(&self) -> &'static str {
        "inject-context"
    }

    fn description(&self) -> &'static str {
        "Threads the root context through every bound method"
    }

    fn run(&mut self, args: &mut PatchArguments) -> Result<bool> {
        let (Some(plan), Some(model)) = (&args.plan, &mut args.model) else {
            return Err(crate::Error::Pipeline(
                "context injection needs a binding plan".to_string(),
            ));
        };
        let injector = ContextInjector::new(&args.snapshot, plan, &args.cache, &args.jumps);
        let (methods, stats) = injector.run(&mut args.module, model)?;
        args.methods = methods;
        args.injection = stats;
        Ok(stats.methods_rewritten > 0)
    }
}

/// Emits context constructors and removes replaced definitions.
#[derive(Debug, Default)]
pub struct FinalizeContextPass;

impl PatchPass for FinalizeContextPass {
    fn name(&self) -> &'static str {
        "finalize-context"
    }

    fn description(&self) -> &'static str {
        "Builds context constructors and retires replaced definitions"
    }

    fn run(&mut self, args: &mut PatchArguments) -> Result<bool> {
        let model = args.model.as_ref().ok_or_else(|| {
            crate::Error::Pipeline("finalization needs a context model".to_string())
        })?;
        finalize(&mut args.module, model, &args.methods)?;
        Ok(true)
    }
}

/// Checks the stack depth of every rewritten body.
#[derive(Debug, Default)]
pub struct VerifyStackPass;

impl PatchPass for VerifyStackPass {
    fn name(&self) -> &'static str {
        "verify-stack"
    }

    fn description(&self) -> &'static str {
        "Rejects rewritten bodies with inconsistent stack depths"
    }

    fn run(&mut self, args: &mut PatchArguments) -> Result<bool> {
        let methods = args.rewritten_methods();
        let mut verified = 0usize;
        for method in methods {
            if !args.module.method(method)?.has_body() {
                continue;
            }
            StackDepths::compute(&args.module, method)?;
            verified += 1;
        }
        log::debug!("Verified stack depths of {verified} rewritten method(s)");
        Ok(false)
    }
}
