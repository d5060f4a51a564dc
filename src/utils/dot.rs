//! DOT format utilities for graph visualization.
//!
//! [`DotWriter`] accumulates nodes and edges and renders a `digraph` that can be laid out with
//! Graphviz tools.

use std::fmt::Write;

/// Escapes a string for safe use in DOT labels and identifiers.
///
/// Handles quotes, backslashes, newlines and angle brackets.
#[must_use]
pub fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "")
        .replace('<', "\\<")
        .replace('>', "\\>")
}

/// Incremental builder for a DOT `digraph`.
#[derive(Debug)]
pub struct DotWriter {
    out: String,
}

impl DotWriter {
    /// Starts a digraph named `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape_dot(name));
        let _ = writeln!(out, "  node [shape=box, fontname=\"monospace\"];");
        DotWriter { out }
    }

    /// Emits a node with a label and optional extra attributes (`style=dashed`).
    pub fn node(&mut self, id: &str, label: &str, attributes: &str) {
        let _ = write!(self.out, "  \"{}\" [label=\"{}\"", escape_dot(id), escape_dot(label));
        if !attributes.is_empty() {
            let _ = write!(self.out, ", {attributes}");
        }
        let _ = writeln!(self.out, "];");
    }

    /// Emits an edge with optional attributes.
    pub fn edge(&mut self, from: &str, to: &str, attributes: &str) {
        let _ = write!(self.out, "  \"{}\" -> \"{}\"", escape_dot(from), escape_dot(to));
        if !attributes.is_empty() {
            let _ = write!(self.out, " [{attributes}]");
        }
        let _ = writeln!(self.out, ";");
    }

    /// Closes the digraph and returns the DOT text.
    #[must_use]
    pub fn finish(mut self) -> String {
        self.out.push_str("}\n");
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_dot() {
        assert_eq!(escape_dot("say \"hello\""), "say \\\"hello\\\"");
        assert_eq!(escape_dot("line1\r\nline2"), "line1\\nline2");
        assert_eq!(escape_dot("List<T>"), "List\\<T\\>");
    }

    #[test]
    fn test_writer() {
        let mut dot = DotWriter::new("calls");
        dot.node("a", "Game::Run", "");
        dot.node("b", "Game::Tick", "style=dashed");
        dot.edge("a", "b", "label=\"virtual\"");
        let text = dot.finish();
        assert!(text.starts_with("digraph \"calls\" {"));
        assert!(text.contains("\"b\" [label=\"Game::Tick\", style=dashed];"));
        assert!(text.contains("\"a\" -> \"b\" [label=\"virtual\"];"));
        assert!(text.ends_with("}\n"));
    }
}
