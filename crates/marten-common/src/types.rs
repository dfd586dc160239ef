//! Key type identifiers for MartenDB indexes.

use serde::{Deserialize, Serialize};

/// Identifier for the attribute types an index can be built over.
///
/// The key type is a parameter of index construction and is persisted in
/// the index header record; only 32-bit signed integers are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// 32-bit signed integer, natural ordering.
    Int32,
}

impl KeyType {
    /// Returns the byte size of a key of this type.
    pub fn size_bytes(&self) -> usize {
        match self {
            KeyType::Int32 => 4,
        }
    }

    /// Parses a key type from its display form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INT32" => Some(KeyType::Int32),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyType::Int32 => "INT32",
        };
        write!(f, "{}", name)
    }
}
