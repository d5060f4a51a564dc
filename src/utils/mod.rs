//! Shared infrastructure: directed graphs and DOT rendering.

mod dot;
pub mod graph;

pub use dot::{escape_dot, DotWriter};
