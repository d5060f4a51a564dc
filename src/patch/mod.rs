//! Patch pipeline framework.
//!
//! A weave is a sequence of [`PatchPass`]es over one shared [`PatchArguments`] object. The
//! arguments own the frozen input snapshot, the module being rewritten and every analysis
//! built so far; analyses are built on first access and shared by every later pass.
//!
//! # Key Components
//!
//! - [`PatchPipeline`] - Ordered pass execution, [`PatchPipeline::standard`] for the full weave
//! - [`PatchPass`] - Trait implemented by every pass
//! - [`PatchArguments`] - Lazily built shared state
//! - [`PatchOutput`] - Rewritten module, id maps, report and diagnostics
//! - [`WeaveConfig`] - Entry points, naming, iteration limits and boundness overrides
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use ctxweave::patch::{PatchPipeline, WeaveConfig};
//!
//! let config = WeaveConfig::default().with_entry_points([main]);
//! let output = PatchPipeline::standard().weave(module, config)?;
//! std::fs::write("idmaps.json", output.id_maps_json()?)?;
//! ```

mod arguments;
mod config;
mod pass;
mod passes;
mod pipeline;

pub use arguments::{PatchArguments, PatchOutput};
pub use config::WeaveConfig;
pub use pass::PatchPass;
pub use passes::{
    AnalyzeStaticStatePass, BuildContextModelPass, FinalizeContextPass, InjectContextPass,
    PlanBoundnessPass, VerifyStackPass,
};
pub use pipeline::PatchPipeline;
