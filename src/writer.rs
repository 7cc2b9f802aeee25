use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{
    error::ImportError,
    extract::Extraction,
    provision::CollectionSet,
    store::{CompositeEntity, ItemStore, RelatedItemsGroup, RelationEdges},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteSummary {
    pub elements: usize,
    pub types: usize,
    pub property_groups: usize,
    pub relations: usize,
}

fn to_items<T: Serialize>(records: &[T]) -> Result<Vec<Value>, ImportError> {
    Ok(records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?)
}

pub async fn write_graph(
    store: &dyn ItemStore,
    entity: &CompositeEntity,
    set: &CollectionSet,
    extraction: &Extraction,
) -> Result<WriteSummary, ImportError> {
    let mut summary = WriteSummary::default();

    store
        .add_related_collections(&entity.id, &set.ids())
        .await
        .map_err(ImportError::write("link_collections"))?;
    info!(entity_id = %entity.id, "Linked collections to model entity");

    let elements = to_items(&extraction.elements)?;
    summary.elements = store
        .create_items_bulk(&set.elements.id, &elements)
        .await
        .map_err(ImportError::write("create_elements"))?;
    info!(collection_id = %set.elements.id, elements = summary.elements, "Elements written");

    let types = to_items(&extraction.types)?;
    summary.types = store
        .create_items_bulk(&set.types.id, &types)
        .await
        .map_err(ImportError::write("create_types"))?;
    info!(collection_id = %set.types.id, types = summary.types, "Types written");

    let groups = extraction
        .properties
        .iter()
        .map(|bag| {
            Ok(RelatedItemsGroup {
                parent_item_id: bag.element_id.clone(),
                items: vec![serde_json::to_value(bag)?],
            })
        })
        .collect::<Result<Vec<_>, ImportError>>()?;
    store
        .create_items_as_related_bulk(&set.elements.id, &set.element_properties.id, &groups)
        .await
        .map_err(ImportError::write("create_element_properties"))?;
    summary.property_groups = groups.len();
    info!(
        collection_id = %set.element_properties.id,
        groups = summary.property_groups,
        "Element properties written"
    );

    let edges: Vec<RelationEdges> = extraction
        .relations
        .iter()
        .map(|relation| RelationEdges {
            parent_item_id: relation.element_id.clone(),
            child_item_ids: relation.type_ids.clone(),
        })
        .collect();
    summary.relations = store
        .create_relations(&set.elements.id, &set.types.id, &edges)
        .await
        .map_err(ImportError::write("create_relations"))?;
    info!(relations = summary.relations, "Element type relations written");

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extract::{extract_package, tests::sample_request},
        ids::testing::SequentialIds,
        provision::{provision_fresh, PackageIdentity},
        store::{testing::FlakyStore, SqliteItemStore},
    };

    async fn provisioned(
        store: &dyn ItemStore,
    ) -> (CompositeEntity, CollectionSet, Extraction) {
        let request = sample_request();
        let identity = PackageIdentity::new(&request, 11, "default");
        let (entity, set) = provision_fresh(store, &identity).await.unwrap();
        let extraction = extract_package(&request.files, &SequentialIds::default()).unwrap();
        (entity, set, extraction)
    }

    #[tokio::test]
    async fn writes_the_sample_graph() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let (entity, set, extraction) = provisioned(&store).await;

        let summary = write_graph(&store, &entity, &set, &extraction).await.unwrap();

        assert_eq!(
            summary,
            WriteSummary {
                elements: 2,
                types: 1,
                property_groups: 2,
                relations: 2,
            }
        );
        assert_eq!(store.item_count(&set.elements.id), 2);
        assert_eq!(store.item_count(&set.types.id), 1);
        assert_eq!(store.related_group_count(&set.element_properties.id), 2);

        let type_id = extraction.types[0].internal_id.clone();
        let expected: Vec<(String, String)> = extraction
            .elements
            .iter()
            .map(|e| (e.internal_id.clone(), type_id.clone()))
            .collect();
        assert_eq!(store.relation_pairs(&set.elements.id), expected);
    }

    #[tokio::test]
    async fn persisted_elements_carry_no_property_map() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let (entity, set, extraction) = provisioned(&store).await;
        write_graph(&store, &entity, &set, &extraction).await.unwrap();

        let keys = store
            .distinct_values(&set.elements.id, "properties", None)
            .await
            .unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn failed_step_stops_later_writes() {
        let store = FlakyStore::new("create_items_bulk", 1);
        let (entity, set, extraction) = provisioned(&store).await;

        let err = write_graph(&store, &entity, &set, &extraction)
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Write { step: "create_types", .. }));
        assert_eq!(store.inner.item_count(&set.elements.id), 2);
        assert_eq!(store.calls_to("create_items_as_related_bulk"), 0);
        assert_eq!(store.calls_to("create_relations"), 0);
    }
}
