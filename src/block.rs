//! Immutable content-addressed blocks
//!
//! A block is the unit of storage and replication: a header naming the
//! block, its type, and the collection it belongs to, plus a set of
//! attributes. Attribute values are always arrays; scalar attributes are
//! modeled as single-element arrays so that the splice-based transform
//! operations in `transform` apply uniformly.
//!
//! Block ids are derived from the content at creation time and treated as
//! opaque strings everywhere else. Two committed blocks with the same id
//! must be equal; the content-addressed derivation is what makes that
//! invariant enforceable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{canonical_digest, BlockId, CollectionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub block_type: String,
    pub collection_id: CollectionId,
}

/// Attribute map: attribute name to array of values (scalars are 1-element)
pub type BlockAttrs = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub attrs: BlockAttrs,
}

impl Block {
    /// Create a block with a content-derived id
    pub fn create(block_type: impl Into<String>, collection_id: impl Into<CollectionId>, attrs: BlockAttrs) -> Self {
        let block_type = block_type.into();
        let collection_id = collection_id.into();
        let id = canonical_digest(&(&block_type, &collection_id, &attrs));
        Self {
            header: BlockHeader { id, block_type, collection_id },
            attrs,
        }
    }

    /// Create a block under a caller-chosen stable id
    ///
    /// Derived structures (log headers) need ids computable before the
    /// content exists; everything else should use `create`.
    pub fn with_id(
        id: impl Into<BlockId>,
        block_type: impl Into<String>,
        collection_id: impl Into<CollectionId>,
        attrs: BlockAttrs,
    ) -> Self {
        Self {
            header: BlockHeader {
                id: id.into(),
                block_type: block_type.into(),
                collection_id: collection_id.into(),
            },
            attrs,
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.header.id
    }

    /// Single scalar attribute accessor (first element of the value array)
    pub fn scalar(&self, attribute: &str) -> Option<&Value> {
        self.attrs.get(attribute).and_then(|values| values.first())
    }
}

/// Convenience constructor for scalar-only attribute maps
pub fn scalar_attrs<I, K>(pairs: I) -> BlockAttrs
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), vec![v]))
        .collect()
}
