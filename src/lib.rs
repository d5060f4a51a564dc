// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # ctxweave
//!
//! Whole-program static-state analysis and root-context injection for stack-based bytecode
//! modules.
//!
//! A program written around mutable static state can only run once per process. `ctxweave`
//! finds the static fields that are actually mutated by code reachable from the program's entry
//! points, moves that state into per-instance "context" objects hanging off a single root
//! context, and rewrites every method so the root reaches each use. Constructing two root
//! contexts then yields two fully independent copies of the program state.
//!
//! ## Features
//!
//! - **Call graph with polymorphism** - virtual dispatch, interface dispatch and callback values
//!   resolved to concrete bodies
//! - **Static state analysis** - fixed-point tracing of values back to static fields through
//!   locals, fields, arrays, collections, enumerators and calls
//! - **Context synthesis** - one context type per owning type, nested like the original types;
//!   existing singletons are reused in place
//! - **Instruction-level injection** - evaluation order preserved, join points handled by
//!   spilling, constructor prefixes relocated when needed
//! - **Reference interpreter** - run rewritten modules to confirm per-context isolation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ctxweave::prelude::*;
//!
//! let mut builder = ModuleBuilder::new("Game")?;
//! let counter = builder.static_class("Game", "Counter");
//! let n = builder.static_field(counter, "n", TypeSig::I4)?;
//! let bump = builder
//!     .method(counter, "Bump")
//!     .flags(MethodModifiers::STATIC)
//!     .implementation(move |asm| {
//!         asm.ldsfld(n)?.ldc_i4(1)?.add()?.stsfld(n)?.ret()?;
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let config = WeaveConfig::default().with_entry_points([bump]);
//! let output = PatchPipeline::standard().weave(builder.build(), config)?;
//! assert!(output.report.converted.contains(&n));
//! println!("{}", output.id_maps_json()?);
//! # Ok::<(), ctxweave::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - The bytecode module model: types, fields, methods, signatures, builders
//! - [`assembly`] - Instructions, method bodies and the label-based assembler
//! - [`analysis`] - Inheritance, callback and call graphs, type-flow index, static field
//!   analysis, stack maps
//! - [`context`] - Context data model, boundness decisions and the injection engine
//! - [`patch`] - The pass pipeline tying analysis and rewrite together
//! - [`emulation`] - Reference interpreter
//! - [`Error`] and [`Result`] - Error handling
//!
//! Non-fatal findings never surface as errors; they are collected as
//! [`analysis::Diagnostic`]s and returned with the output.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
pub mod prelude;

/// Whole-program analyses over a module snapshot.
pub mod analysis;

/// Instructions, method bodies and the instruction assembler.
pub mod assembly;

/// Context-type synthesis and context injection.
pub mod context;

/// Reference interpreter for rewritten modules.
pub mod emulation;

/// The bytecode module model.
pub mod metadata;

/// The patch pass pipeline.
pub mod patch;

/// Generic graph infrastructure and DOT export.
pub mod utils;

/// `ctxweave` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `ctxweave` Error type
///
/// See [`error::Error`] for the error categories.
pub use error::Error;
