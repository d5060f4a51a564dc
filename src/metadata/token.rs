//! Module-wide identity tokens.
//!
//! Every type, field and method of a [`crate::metadata::Module`] is identified by a [`Token`].
//! Tokens follow the ECMA-335 layout: the high byte names the table the row lives in, the low
//! 24 bits are the 1-based row index inside that table.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A token representing a reference to a module table entry.
///
/// Tokens consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table ([`Token::TYPE_TABLE`],
///   [`Token::FIELD_TABLE`] or [`Token::METHOD_TABLE`])
/// - The low 24 bits (bits 0-23) indicate the row index within that table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u32);

impl Token {
    /// Table id of type definitions
    pub const TYPE_TABLE: u8 = 0x02;
    /// Table id of field definitions
    pub const FIELD_TABLE: u8 = 0x04;
    /// Table id of method definitions
    pub const METHOD_TABLE: u8 = 0x06;

    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token for the given table and row
    #[must_use]
    pub const fn from_parts(table: u8, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub const fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub const fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the token addresses the type table
    #[must_use]
    pub const fn is_type(&self) -> bool {
        self.table() == Self::TYPE_TABLE
    }

    /// Returns true if the token addresses the field table
    #[must_use]
    pub const fn is_field(&self) -> bool {
        self.table() == Self::FIELD_TABLE
    }

    /// Returns true if the token addresses the method table
    #[must_use]
    pub const fn is_method(&self) -> bool {
        self.table() == Self::METHOD_TABLE
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_token_parts() {
        let token = Token::from_parts(Token::METHOD_TABLE, 5);
        assert_eq!(token.value(), 0x0600_0005);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 5);
        assert!(token.is_method());
        assert!(!token.is_field());
    }

    #[test]
    fn test_token_row_masking() {
        let token = Token::from_parts(Token::TYPE_TABLE, 0x01FF_FFFF);
        assert_eq!(token.row(), 0x00FF_FFFF);
        assert!(token.is_type());
    }

    #[test]
    fn test_token_is_null() {
        assert!(Token(0).is_null());
        assert!(!Token(0x0400_0001).is_null());
    }

    #[test]
    fn test_token_from_conversion() {
        let value = 0x0600_0001u32;
        let token: Token = value.into();
        assert_eq!(token.value(), value);

        let back_to_u32: u32 = token.into();
        assert_eq!(back_to_u32, value);
    }

    #[test]
    fn test_token_display_and_hash() {
        let token = Token(0x0400_0002);
        assert_eq!(format!("{token}"), "0x04000002");
        assert!(format!("{token:?}").contains("row: 2"));

        let mut map = HashMap::new();
        map.insert(token, "field");
        assert_eq!(map.get(&Token(0x0400_0002)), Some(&"field"));
    }

    #[test]
    fn test_token_serde_transparent() {
        let token = Token(0x0200_0003);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "33554435");
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }
}
