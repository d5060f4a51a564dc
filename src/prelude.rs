//! # ctxweave Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the ctxweave library. Import this module to get quick access to the types needed to
//! build a module, weave it and run the result.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all ctxweave operations
pub use crate::Error;

/// The result type used throughout ctxweave
pub use crate::Result;

// ================================================================================================
// Module Model
// ================================================================================================

/// Metadata token type for referencing module entities
pub use crate::metadata::Token;

/// Types, fields, methods and signatures
pub use crate::metadata::{
    FieldAttributes, FieldDef, Intrinsic, MethodDef, MethodModifiers, Module, Param,
    TypeAttributes, TypeDef, TypeSig,
};

/// Module construction
pub use crate::metadata::{CoreLibrary, DelegateType, MethodBuilder, ModuleBuilder};

// ================================================================================================
// Instructions
// ================================================================================================

/// Instruction model and assembler
pub use crate::assembly::{Instruction, InstructionAssembler, MethodBody, Opcode, Operand};

// ================================================================================================
// Analysis
// ================================================================================================

/// Whole-program graphs
pub use crate::analysis::{CallGraph, CallbackGraph, InheritanceGraph, TypeFlowIndex};

/// Static field analysis
pub use crate::analysis::{AnalyzerConfig, StaticFieldAnalyzer, StaticFieldReport};

/// Non-fatal findings
pub use crate::analysis::{Diagnostic, DiagnosticKind, Diagnostics};

// ================================================================================================
// Context Injection
// ================================================================================================

/// Context model and boundness decisions
pub use crate::context::{Boundness, ContextModel, ContextNames, ContextTypeRecord, IdMap};

// ================================================================================================
// Patch Pipeline
// ================================================================================================

/// Pipeline, passes, configuration and output
pub use crate::patch::{PatchArguments, PatchOutput, PatchPass, PatchPipeline, WeaveConfig};

// ================================================================================================
// Emulation
// ================================================================================================

/// Reference interpreter
pub use crate::emulation::{EmValue, EmulationConfig, Interpreter};
