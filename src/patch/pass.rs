//! Pass trait for the patch pipeline.
//!
//! This module defines the `PatchPass` trait that every rewrite stage implements. Passes run
//! in the order they were added to a [`crate::patch::PatchPipeline`], each exactly once, over
//! one shared [`PatchArguments`]:
//!
//! 1. **Analyze**: call graph, type-flow index and static field report
//! 2. **Model**: context records and bound field slots
//! 3. **Plan**: boundness of every method
//! 4. **Inject**: instruction-level rewrite
//! 5. **Finalize**: context constructors, retire replaced definitions
//! 6. **Verify**: stack depth check of every rewritten body
//!
//! A pass that fails aborts the pipeline; there is no rollback.

use crate::{patch::PatchArguments, Result};

/// A rewrite stage of the patch pipeline.
///
/// Passes receive mutable access to the shared arguments. Analyses stored there are built on
/// first use and shared by every later pass.
pub trait PatchPass {
    /// Unique name for logging and debugging.
    fn name(&self) -> &'static str;

    /// Runs the pass.
    ///
    /// Returns `true` if the module was modified, `false` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass cannot complete; the pipeline stops.
    fn run(&mut self, args: &mut PatchArguments) -> Result<bool>;

    /// Called once before [`PatchPass::run`].
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    fn initialize(&mut self, _args: &PatchArguments) -> Result<()> {
        Ok(())
    }

    /// Called once after [`PatchPass::run`] succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if finalization fails.
    fn finalize(&mut self, _args: &PatchArguments) -> Result<()> {
        Ok(())
    }

    /// Get a description of what this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }
}
