mod sqlite;
#[cfg(test)]
pub mod testing;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

pub use sqlite::SqliteItemStore;

pub const COMPOSITE_ITEM_CLASS: &str = "NamedCompositeItem";
pub const COLLECTION_ITEM_CLASS: &str = "NamedUserCollection";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDef {
    pub name: String,
    pub short_name: String,
    pub description: String,
    pub user_type: String,
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionHandle {
    pub id: String,
    pub name: String,
    pub short_name: String,
    pub user_type: String,
    pub version_no: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Ascending,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    pub field: String,
    pub kind: IndexKind,
    pub default_language: String,
}

impl IndexDef {
    pub fn ascending(name: &str, field: &str) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            kind: IndexKind::Ascending,
            default_language: "english".to_string(),
        }
    }

    pub fn text(name: &str, field: &str) -> Self {
        Self {
            kind: IndexKind::Text,
            ..Self::ascending(name, field)
        }
    }
}

pub type VersionAttributes = Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeDef {
    pub name: String,
    pub short_name: String,
    pub description: String,
    pub user_type: String,
    pub namespaces: Vec<String>,
    pub version_attributes: VersionAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeEntity {
    pub id: String,
    pub name: String,
    pub user_type: String,
    pub version_id: String,
    pub version_no: u32,
    pub version_attributes: VersionAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionHandle {
    pub item_id: String,
    pub version_id: String,
    pub version_no: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeQuery {
    pub user_type: String,
    pub attribute_path: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedItemsGroup {
    pub parent_item_id: String,
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationEdges {
    pub parent_item_id: String,
    pub child_item_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn create_collection(&self, def: &CollectionDef) -> Result<CollectionHandle, StoreError>;

    async fn create_or_recreate_index(
        &self,
        collection_id: &str,
        indexes: &[IndexDef],
    ) -> Result<(), StoreError>;

    async fn create_named_composite(&self, def: &CompositeDef)
        -> Result<CompositeEntity, StoreError>;

    async fn create_version(&self, item_id: &str) -> Result<VersionHandle, StoreError>;

    async fn update_version_attributes(
        &self,
        item_id: &str,
        version_id: &str,
        attributes: &VersionAttributes,
    ) -> Result<(), StoreError>;

    async fn query_composites(
        &self,
        query: &CompositeQuery,
    ) -> Result<Vec<CompositeEntity>, StoreError>;

    async fn collections_in_composite(
        &self,
        composite_id: &str,
    ) -> Result<Vec<CollectionHandle>, StoreError>;

    async fn related_collection_ids(&self, composite_id: &str) -> Result<Vec<String>, StoreError>;

    async fn add_related_collections(
        &self,
        composite_id: &str,
        collection_ids: &[String],
    ) -> Result<(), StoreError>;

    async fn create_items_bulk(
        &self,
        collection_id: &str,
        items: &[Value],
    ) -> Result<usize, StoreError>;

    async fn create_items_as_related_bulk(
        &self,
        parent_collection_id: &str,
        child_collection_id: &str,
        groups: &[RelatedItemsGroup],
    ) -> Result<usize, StoreError>;

    async fn create_relations(
        &self,
        parent_collection_id: &str,
        child_collection_id: &str,
        relations: &[RelationEdges],
    ) -> Result<usize, StoreError>;

    async fn distinct_values(
        &self,
        collection_id: &str,
        field: &str,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<Value>, StoreError>;

    /// Distinct `value_field` values per distinct `key_field` value in one
    /// request. `None` means the store cannot aggregate and callers must fall
    /// back to one `distinct_values` call per key.
    async fn distinct_grouped(
        &self,
        _collection_id: &str,
        _key_field: &str,
        _value_field: &str,
    ) -> Result<Option<BTreeMap<String, Vec<Value>>>, StoreError> {
        Ok(None)
    }
}
