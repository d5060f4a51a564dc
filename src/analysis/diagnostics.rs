//! Non-fatal analysis findings.
//!
//! Analyses tolerate a number of problems in their input: a call token that does not resolve, a
//! concrete method without a body, a callback value whose construction site cannot be found.
//! Each of these is logged when detected and collected as a [`Diagnostic`], so callers can
//! inspect everything that was under-approximated after a run finishes.
//!
//! [`Diagnostics`] is append-only and can be shared across threads, which lets the parallel
//! call-site extraction report into the same log.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

use crate::metadata::Token;

/// Category of a [`Diagnostic`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum DiagnosticKind {
    /// A token that does not resolve inside the module
    UnresolvedReference,
    /// A concrete callee without any resolvable implementation
    MissingImplementation,
    /// A callback value without a resolvable construction site
    UnresolvedCallback,
    /// A type that satisfies all but one singleton-reuse criterion
    BorderlineSingleton,
    /// A fixed point stopped at its iteration bound
    IterationLimit,
}

/// A single non-fatal finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Finding category
    pub kind: DiagnosticKind,
    /// Method the finding was made in, if any
    pub method: Option<Token>,
    /// Instruction index inside `method`, if any
    pub offset: Option<usize>,
    /// Human readable description
    pub message: String,
}

impl Diagnostic {
    /// Creates a diagnostic.
    #[must_use]
    pub fn new(
        kind: DiagnosticKind,
        method: Option<Token>,
        offset: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Diagnostic {
            kind,
            method,
            offset,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(method) = self.method {
            write!(f, " {method}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " @{offset}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Thread-safe, append-only collection of [`Diagnostic`]s.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: boxcar::Vec<Diagnostic>,
}

impl Diagnostics {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Diagnostics {
            entries: boxcar::Vec::new(),
        }
    }

    /// Logs and records a diagnostic.
    ///
    /// Missing implementations are logged at error level, everything else as a warning.
    pub fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.kind {
            DiagnosticKind::MissingImplementation => log::error!("{diagnostic}"),
            _ => log::warn!("{diagnostic}"),
        }
        self.entries.push(diagnostic);
    }

    /// Shorthand for [`Diagnostics::report`] with a freshly built [`Diagnostic`].
    pub fn push(
        &self,
        kind: DiagnosticKind,
        method: Option<Token>,
        offset: Option<usize>,
        message: impl Into<String>,
    ) {
        self.report(Diagnostic::new(kind, method, offset, message));
    }

    /// Number of recorded diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.count()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.count() == 0
    }

    /// Iterates all recorded diagnostics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|(_, d)| d)
    }

    /// Number of diagnostics of the given kind.
    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.iter().filter(|d| d.kind == kind).count()
    }

    /// Copies all diagnostics into a `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Diagnostic> {
        self.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_count() {
        let diagnostics = Diagnostics::new();
        assert!(diagnostics.is_empty());
        diagnostics.push(
            DiagnosticKind::UnresolvedReference,
            Some(Token(0x0600_0001)),
            Some(3),
            "call target 0x060000ff does not resolve",
        );
        diagnostics.push(DiagnosticKind::MissingImplementation, None, None, "Game.Shape::Area");
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics.count(DiagnosticKind::UnresolvedReference), 1);
        assert_eq!(diagnostics.count(DiagnosticKind::IterationLimit), 0);
        assert_eq!(diagnostics.to_vec()[1].kind, DiagnosticKind::MissingImplementation);
    }

    #[test]
    fn test_display() {
        let diagnostic = Diagnostic::new(
            DiagnosticKind::UnresolvedCallback,
            Some(Token(0x0600_0002)),
            Some(7),
            "no construction site",
        );
        assert_eq!(
            diagnostic.to_string(),
            "[UnresolvedCallback] 0x06000002 @7: no construction site"
        );
    }

    #[test]
    fn test_shared_across_threads() {
        let diagnostics = Diagnostics::new();
        std::thread::scope(|scope| {
            for i in 0..4 {
                let diagnostics = &diagnostics;
                scope.spawn(move || {
                    diagnostics.push(DiagnosticKind::IterationLimit, None, Some(i), "bound");
                });
            }
        });
        assert_eq!(diagnostics.len(), 4);
    }
}
