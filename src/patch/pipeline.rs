//! Ordered execution of patch passes.

use crate::{
    metadata::Module,
    patch::{
        AnalyzeStaticStatePass, BuildContextModelPass, FinalizeContextPass, InjectContextPass,
        PatchArguments, PatchOutput, PatchPass, PlanBoundnessPass, VerifyStackPass, WeaveConfig,
    },
    Result,
};

/// Runs patch passes in declared order over one shared [`PatchArguments`].
///
/// Every pass runs exactly once. The first failing pass aborts the pipeline and its error is
/// returned unchanged; passes that already ran are not undone.
#[derive(Default)]
pub struct PatchPipeline {
    passes: Vec<Box<dyn PatchPass>>,
}

impl PatchPipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full weave: analyze, model, plan, inject, finalize and verify.
    #[must_use]
    pub fn standard() -> Self {
        let mut pipeline = Self::new();
        pipeline
            .add_pass(Box::new(AnalyzeStaticStatePass))
            .add_pass(Box::new(BuildContextModelPass))
            .add_pass(Box::new(PlanBoundnessPass))
            .add_pass(Box::new(InjectContextPass))
            .add_pass(Box::new(FinalizeContextPass))
            .add_pass(Box::new(VerifyStackPass));
        pipeline
    }

    /// Only the static field analysis; the module is left untouched.
    #[must_use]
    pub fn analysis_only() -> Self {
        let mut pipeline = Self::new();
        pipeline.add_pass(Box::new(AnalyzeStaticStatePass));
        pipeline
    }

    /// Appends `pass`.
    pub fn add_pass(&mut self, pass: Box<dyn PatchPass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    /// Names of the passes in execution order.
    #[must_use]
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Number of passes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Returns `true` if the pipeline has no passes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Runs every pass over `args`.
    ///
    /// Returns `true` if any pass modified the module.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing pass.
    pub fn run(&mut self, args: &mut PatchArguments) -> Result<bool> {
        let verify = args.config().verify_stack;
        let mut changed = false;
        for pass in &mut self.passes {
            if !verify && pass.name() == VerifyStackPass.name() {
                log::debug!("Skipping {}", pass.name());
                continue;
            }
            log::debug!("Running {}: {}", pass.name(), pass.description());
            pass.initialize(args)?;
            let modified = pass.run(args).inspect_err(|e| {
                log::error!("Pass {} failed: {e}", pass.name());
            })?;
            pass.finalize(args)?;
            changed |= modified;
        }
        Ok(changed)
    }

    /// Runs the pipeline over `module` and returns the rewritten module with its id maps,
    /// report and diagnostics.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing pass, or [`crate::Error::Pipeline`] if the
    /// pipeline does not compute a static field report.
    pub fn weave(&mut self, module: Module, config: WeaveConfig) -> Result<PatchOutput> {
        let mut args = PatchArguments::new(module, config);
        let changed = self.run(&mut args)?;
        log::info!(
            "Weave finished ({}), {} diagnostic(s)",
            if changed { "module rewritten" } else { "no changes" },
            args.diagnostics().len()
        );
        args.into_output()
    }
}
