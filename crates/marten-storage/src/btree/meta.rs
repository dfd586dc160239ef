//! Index header record.
//!
//! Page 0 of every index file carries a compact record identifying the
//! index: `<relationName>,<attrByteOffset>,<keyType>,<rootPageNumber>`.
//! The record is advisory — it lets an index be reopened by name — and its
//! loss never corrupts the tree structure itself.

use marten_common::page::PAGE_SIZE;
use marten_common::{KeyType, MartenError, Result};

/// Parameters persisted in the index header page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    /// Name of the indexed relation.
    pub relation_name: String,
    /// Byte offset of the indexed attribute within a record.
    pub attr_byte_offset: usize,
    /// Type of the indexed attribute.
    pub key_type: KeyType,
    /// Page number of the current root (0 = empty tree).
    pub root_page_num: u32,
}

impl IndexMeta {
    /// Renders the comma-separated header record.
    pub fn record(&self) -> String {
        format!(
            "{},{},{},{}",
            self.relation_name, self.attr_byte_offset, self.key_type, self.root_page_num
        )
    }

    /// Parses the comma-separated header record.
    ///
    /// Fields are split from the right so a relation name containing
    /// commas survives the round trip.
    pub fn parse_record(s: &str) -> Result<Self> {
        let mut fields = s.rsplitn(4, ',');
        let root = fields.next();
        let key_type = fields.next();
        let offset = fields.next();
        let relation = fields.next();

        let (Some(root), Some(key_type), Some(offset), Some(relation)) =
            (root, key_type, offset, relation)
        else {
            return Err(MartenError::InvalidIndexMeta(format!(
                "expected 4 fields in {:?}",
                s
            )));
        };

        let root_page_num = root
            .parse::<u32>()
            .map_err(|_| MartenError::InvalidIndexMeta(format!("bad root page {:?}", root)))?;
        let key_type = KeyType::parse(key_type)
            .ok_or_else(|| MartenError::InvalidIndexMeta(format!("bad key type {:?}", key_type)))?;
        let attr_byte_offset = offset
            .parse::<usize>()
            .map_err(|_| MartenError::InvalidIndexMeta(format!("bad attr offset {:?}", offset)))?;

        Ok(Self {
            relation_name: relation.to_string(),
            attr_byte_offset,
            key_type,
            root_page_num,
        })
    }

    /// Serializes the meta record into a full header page image
    /// (length-prefixed record bytes).
    pub fn encode_page(&self) -> Result<[u8; PAGE_SIZE]> {
        let record = self.record();
        let bytes = record.as_bytes();
        if bytes.len() > PAGE_SIZE - 2 {
            return Err(MartenError::InvalidIndexMeta(format!(
                "header record of {} bytes does not fit a page",
                bytes.len()
            )));
        }

        let mut page = [0u8; PAGE_SIZE];
        page[0..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        page[2..2 + bytes.len()].copy_from_slice(bytes);
        Ok(page)
    }

    /// Deserializes the meta record from a header page image.
    pub fn decode_page(data: &[u8]) -> Result<Self> {
        let len = u16::from_le_bytes([data[0], data[1]]) as usize;
        if len == 0 || len > PAGE_SIZE - 2 {
            return Err(MartenError::InvalidIndexMeta(format!(
                "header record length {} is invalid",
                len
            )));
        }
        let record = std::str::from_utf8(&data[2..2 + len])
            .map_err(|_| MartenError::InvalidIndexMeta("header record is not UTF-8".to_string()))?;
        Self::parse_record(record)
    }
}
