//! Bidirectional original ↔ context-bound identity maps.
//!
//! The rewrite replaces many definitions by context-bound counterparts (a static method moved
//! onto a context type, a static field turned into an instance field, a method that gained a
//! root parameter). Every such replacement is recorded in an [`IdMap`], which external
//! consumers use to translate references into the rewritten module and back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{metadata::Token, Result};

/// A bijective map between original tokens and their context-bound replacements.
///
/// Definitions rewritten in place map to themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    forward: BTreeMap<Token, Token>,
    #[serde(skip)]
    reverse: BTreeMap<Token, Token>,
}

impl IdMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `original` is represented by `bound` in the rewritten module.
    ///
    /// Re-inserting an identical pair is a no-op.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if either side is already mapped to a different
    /// token.
    pub fn insert(&mut self, original: Token, bound: Token) -> Result<()> {
        match (self.forward.get(&original), self.reverse.get(&bound)) {
            (Some(existing), _) if *existing != bound => Err(malformed_error!(
                "{} is already mapped to {}, cannot map to {}",
                original,
                existing,
                bound
            )),
            (_, Some(existing)) if *existing != original => Err(malformed_error!(
                "{} is already the image of {}, cannot map {} onto it",
                bound,
                existing,
                original
            )),
            _ => {
                self.forward.insert(original, bound);
                self.reverse.insert(bound, original);
                Ok(())
            }
        }
    }

    /// The context-bound token of `original`.
    #[must_use]
    pub fn get(&self, original: Token) -> Option<Token> {
        self.forward.get(&original).copied()
    }

    /// The original token of `bound`.
    #[must_use]
    pub fn original_of(&self, bound: Token) -> Option<Token> {
        self.reverse.get(&bound).copied()
    }

    /// Translates `token`, returning it unchanged if it is not mapped.
    #[must_use]
    pub fn translate(&self, token: Token) -> Token {
        self.get(token).unwrap_or(token)
    }

    /// Returns `true` if `original` has a context-bound counterpart.
    #[must_use]
    pub fn contains(&self, original: Token) -> bool {
        self.forward.contains_key(&original)
    }

    /// Iterates `(original, bound)` pairs in original token order.
    pub fn iter(&self) -> impl Iterator<Item = (Token, Token)> + '_ {
        self.forward.iter().map(|(o, b)| (*o, *b))
    }

    /// Number of mapped definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Returns `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Pairs whose definition moved to a new token.
    pub fn replaced(&self) -> impl Iterator<Item = (Token, Token)> + '_ {
        self.iter().filter(|(o, b)| o != b)
    }

    /// Restores the reverse index after deserialization.
    pub(crate) fn rebuild_reverse(&mut self) {
        self.reverse = self.forward.iter().map(|(o, b)| (*b, *o)).collect();
    }

    /// Parses a map from the JSON produced by `serde_json::to_string`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Serialization`] if decoding fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut map: IdMap = serde_json::from_str(json)?;
        map.rebuild_reverse();
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(row: u32) -> Token {
        Token::from_parts(Token::METHOD_TABLE, row)
    }

    #[test]
    fn test_round_trip_through_inverse() {
        let mut map = IdMap::new();
        map.insert(method(3), method(40)).unwrap();
        map.insert(method(5), method(41)).unwrap();
        map.insert(method(7), method(7)).unwrap();

        for (original, bound) in map.iter() {
            assert_eq!(map.original_of(bound), Some(original));
        }
        assert_eq!(map.replaced().count(), 2);
        assert_eq!(map.translate(method(9)), method(9));
    }

    #[test]
    fn test_conflicting_insert_rejected() {
        let mut map = IdMap::new();
        map.insert(method(1), method(10)).unwrap();
        map.insert(method(1), method(10)).unwrap();
        assert!(map.insert(method(1), method(11)).is_err());
        assert!(map.insert(method(2), method(10)).is_err());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_json_restores_reverse_index() {
        let mut map = IdMap::new();
        map.insert(method(1), method(10)).unwrap();
        let json = serde_json::to_string(&map).unwrap();
        let parsed = IdMap::from_json(&json).unwrap();
        assert_eq!(parsed.original_of(method(10)), Some(method(1)));
        assert_eq!(parsed, map);
    }
}
