use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    CollectionDef, CollectionHandle, CompositeDef, CompositeEntity, CompositeQuery, FieldFilter,
    IndexDef, ItemStore, RelatedItemsGroup, RelationEdges, SqliteItemStore, VersionAttributes,
    VersionHandle,
};
use crate::error::StoreError;

pub struct FlakyStore {
    pub inner: SqliteItemStore,
    fail_on: &'static str,
    allow: AtomicUsize,
    calls: Mutex<Vec<&'static str>>,
}

impl FlakyStore {
    pub fn new(fail_on: &'static str, allow: usize) -> Self {
        Self {
            inner: SqliteItemStore::open_in_memory().unwrap(),
            fail_on,
            allow: AtomicUsize::new(allow),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn healthy() -> Self {
        Self::new("", 0)
    }

    pub fn calls_to(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(op);
        if op != self.fail_on {
            return Ok(());
        }
        let remaining = self.allow.load(Ordering::SeqCst);
        if remaining == 0 {
            return Err(StoreError::Task(format!("injected failure in {op}")));
        }
        self.allow.store(remaining - 1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ItemStore for FlakyStore {
    async fn create_collection(&self, def: &CollectionDef) -> Result<CollectionHandle, StoreError> {
        self.check("create_collection")?;
        self.inner.create_collection(def).await
    }

    async fn create_or_recreate_index(
        &self,
        collection_id: &str,
        indexes: &[IndexDef],
    ) -> Result<(), StoreError> {
        self.check("create_or_recreate_index")?;
        self.inner.create_or_recreate_index(collection_id, indexes).await
    }

    async fn create_named_composite(
        &self,
        def: &CompositeDef,
    ) -> Result<CompositeEntity, StoreError> {
        self.check("create_named_composite")?;
        self.inner.create_named_composite(def).await
    }

    async fn create_version(&self, item_id: &str) -> Result<VersionHandle, StoreError> {
        self.check("create_version")?;
        self.inner.create_version(item_id).await
    }

    async fn update_version_attributes(
        &self,
        item_id: &str,
        version_id: &str,
        attributes: &VersionAttributes,
    ) -> Result<(), StoreError> {
        self.check("update_version_attributes")?;
        self.inner
            .update_version_attributes(item_id, version_id, attributes)
            .await
    }

    async fn query_composites(
        &self,
        query: &CompositeQuery,
    ) -> Result<Vec<CompositeEntity>, StoreError> {
        self.check("query_composites")?;
        self.inner.query_composites(query).await
    }

    async fn collections_in_composite(
        &self,
        composite_id: &str,
    ) -> Result<Vec<CollectionHandle>, StoreError> {
        self.check("collections_in_composite")?;
        self.inner.collections_in_composite(composite_id).await
    }

    async fn related_collection_ids(&self, composite_id: &str) -> Result<Vec<String>, StoreError> {
        self.check("related_collection_ids")?;
        self.inner.related_collection_ids(composite_id).await
    }

    async fn add_related_collections(
        &self,
        composite_id: &str,
        collection_ids: &[String],
    ) -> Result<(), StoreError> {
        self.check("add_related_collections")?;
        self.inner
            .add_related_collections(composite_id, collection_ids)
            .await
    }

    async fn create_items_bulk(
        &self,
        collection_id: &str,
        items: &[Value],
    ) -> Result<usize, StoreError> {
        self.check("create_items_bulk")?;
        self.inner.create_items_bulk(collection_id, items).await
    }

    async fn create_items_as_related_bulk(
        &self,
        parent_collection_id: &str,
        child_collection_id: &str,
        groups: &[RelatedItemsGroup],
    ) -> Result<usize, StoreError> {
        self.check("create_items_as_related_bulk")?;
        self.inner
            .create_items_as_related_bulk(parent_collection_id, child_collection_id, groups)
            .await
    }

    async fn create_relations(
        &self,
        parent_collection_id: &str,
        child_collection_id: &str,
        relations: &[RelationEdges],
    ) -> Result<usize, StoreError> {
        self.check("create_relations")?;
        self.inner
            .create_relations(parent_collection_id, child_collection_id, relations)
            .await
    }

    async fn distinct_values(
        &self,
        collection_id: &str,
        field: &str,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<Value>, StoreError> {
        self.check("distinct_values")?;
        self.inner.distinct_values(collection_id, field, filter).await
    }

    async fn distinct_grouped(
        &self,
        _collection_id: &str,
        _key_field: &str,
        _value_field: &str,
    ) -> Result<Option<BTreeMap<String, Vec<Value>>>, StoreError> {
        self.check("distinct_grouped")?;
        Ok(None)
    }
}
