//! Result of the static field analysis.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{analysis::StaticOrigin, metadata::Token};

/// A write into state rooted at a static field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModificationRecord {
    /// Method containing the writing instruction (or the call that writes)
    pub method: Token,
    /// Instruction index of the write
    pub offset: usize,
    /// The written location
    pub origin: StaticOrigin,
}

/// Which static fields must move from static to per-context scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticFieldReport {
    /// Fields loaded or stored directly by code reachable from the entry points
    pub referenced: BTreeSet<Token>,
    /// Fields whose state is written by code reachable from the entry points
    pub modified: BTreeSet<Token>,
    /// Fields whose state is written by code reachable from the init-only methods
    pub init_only_modified: BTreeSet<Token>,
    /// The conversion set: `modified` plus initialized fields that entry code reads
    pub converted: BTreeSet<Token>,
    /// Every write that contributed to `modified` or `init_only_modified`
    pub modifications: Vec<ModificationRecord>,
}

impl StaticFieldReport {
    /// Returns `true` if `field` must become per-context state.
    #[must_use]
    pub fn is_converted(&self, field: Token) -> bool {
        self.converted.contains(&field)
    }

    /// Writes that contributed to `field`.
    pub fn modifications_of(&self, field: Token) -> impl Iterator<Item = &ModificationRecord> {
        self.modifications
            .iter()
            .filter(move |record| record.origin.field == field)
    }
}
