//! Reference interpreter for module bytecode.
//!
//! This module provides a small, controlled execution environment for the bytecode model. It
//! exists to check rewritten modules by running them: two root contexts built from the same
//! rewritten module must not observe each other's state.
//!
//! # Key Components
//!
//! - [`Interpreter`] - Executes methods with lazily run static initializers, virtual dispatch
//!   and runtime intrinsics, bounded by an [`EmulationConfig`]
//! - [`EmValue`] - Runtime value representation
//! - [`ManagedHeap`] - Objects, strings, arrays, callbacks and collections
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use ctxweave::emulation::{EmValue, Interpreter};
//!
//! let mut interpreter = Interpreter::new(&output.module);
//! let root = interpreter.construct(root_ctor, &[])?;
//! interpreter.call(bump, &[counter_ctx])?;
//! assert_eq!(interpreter.field(&counter_ctx, n)?, EmValue::I32(1));
//! ```

mod heap;
mod interpreter;
mod value;

pub use heap::{HeapObject, ManagedHeap};
pub use interpreter::{EmulationConfig, Interpreter};
pub use value::{EmValue, HeapRef};
