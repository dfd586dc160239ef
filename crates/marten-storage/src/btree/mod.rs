//! Disk-resident B+ tree secondary index.
//!
//! The index maps 32-bit integer keys to record ids and supports point
//! insertion and half-open range scans. Nodes live on pages of a dedicated
//! index file and reference each other only through page numbers; all page
//! access goes through the buffer pool under the pin/unpin protocol.
//!
//! Module layout:
//! - `node`: typed leaf/internal views over raw page buffers
//! - `meta`: the header-page record identifying the index
//! - `scan`: range operators and the scan cursor state
//! - `index`: descent, insertion with split propagation, scans, lifecycle

mod index;
mod meta;
mod node;
mod scan;

pub use index::BTreeIndex;
pub use meta::IndexMeta;
pub use node::{InternalNode, LeafNode, EMPTY_KEY, INTERNAL_CAPACITY, LEAF_CAPACITY};
pub use scan::Operator;
