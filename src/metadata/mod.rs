//! Module model: types, fields, methods and their identities.
//!
//! This module contains the in-memory representation of a bytecode module that every analysis
//! and rewrite operates on.
//!
//! # Key Components
//!
//! - [`Token`] - Table/row identity of a definition
//! - [`Module`] - Owner of all definitions, allocates tokens, derives call stack effects
//! - [`TypeDef`], [`FieldDef`], [`MethodDef`] - Definitions with their attribute flags
//! - [`TypeSig`] - Declared types of fields, parameters, locals and returns
//! - [`Intrinsic`] - Runtime-provided behaviour the analyses understand natively
//! - [`ModuleBuilder`], [`MethodBuilder`] - Programmatic construction
//!
//! # Examples
//!
//! ```rust
//! use ctxweave::metadata::{ModuleBuilder, TypeSig};
//!
//! let mut builder = ModuleBuilder::new("Game")?;
//! let player = builder.class("Game", "Player");
//! builder.field(player, "score", TypeSig::I4)?;
//! let module = builder.build();
//! println!("{} types", module.types().count());
//! # Ok::<(), ctxweave::Error>(())
//! ```

mod builder;
mod field;
pub mod method;
mod module;
mod token;
mod types;
mod typesig;

pub use builder::{CoreLibrary, DelegateType, MethodBuilder, ModuleBuilder};
pub use field::{FieldAttributes, FieldDef};
pub use method::{Intrinsic, MethodDef, MethodModifiers, Param};
pub use module::Module;
pub use token::Token;
pub use types::{TypeAttributes, TypeDef};
pub use typesig::TypeSig;
