//! Context-type synthesis and context injection.
//!
//! This module turns converted static state into per-context instance state:
//!
//! - [`ContextModel`] decides, per original type, where its converted fields live: either in a
//!   synthesized context type nested under the [`ROOT_FIELD`]-carrying root context, or in the
//!   original type itself when it is already a singleton reachable from another context type.
//! - [`BoundnessCache`] and [`BindingPlan`] record which methods need a root context and how
//!   they receive it ([`Boundness`]).
//! - [`ContextInjector`] rewrites method bodies so the root reaches every use, using
//!   [`insert_operand`] to thread values into the right operand slot.
//! - [`finalize`] emits the context constructors and retires replaced definitions.
//!
//! Every replaced definition is recorded in an [`IdMap`].

mod boundness;
mod constructors;
mod idmap;
mod injection;
mod insertion;
mod model;

pub(crate) use boundness::Planner;
pub use boundness::{BindingPlan, Boundness, BoundnessCache};
pub use constructors::finalize;
pub use idmap::IdMap;
pub use injection::{ContextInjector, InjectionStats, STATIC_INIT_NAME};
pub use insertion::{insert_operand, operand_start, Insertion};
pub use model::{
    ContextModel, ContextNames, ContextTypeRecord, SingletonIndex, SingletonShape, PARENT_FIELD,
    ROOT_FIELD,
};
