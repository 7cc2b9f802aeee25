use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    error::ImportError,
    models::ImportRequest,
    store::{
        CollectionDef, CollectionHandle, CompositeDef, CompositeEntity, CompositeQuery, IndexDef,
        ItemStore,
    },
};

pub const MODEL_VERSION_TYPE: &str = "bim_model_version";
const FILE_ID_PATH: &str = "bimpk.fileId";

pub const CURRENT_SCHEMA_REVISION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionKind {
    Elements,
    ElementProperties,
    Types,
    GeometryFiles,
    GeometryViews,
    DataCache,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 6] = [
        CollectionKind::Elements,
        CollectionKind::ElementProperties,
        CollectionKind::Types,
        CollectionKind::GeometryFiles,
        CollectionKind::GeometryViews,
        CollectionKind::DataCache,
    ];

    pub fn user_type(self) -> &'static str {
        match self {
            Self::Elements => "rvt_elements",
            Self::ElementProperties => "rvt_element_props",
            Self::Types => "rvt_type_elements",
            Self::GeometryFiles => "bim_model_geomresources",
            Self::GeometryViews => "bim_model_geomviews",
            Self::DataCache => "data_cache",
        }
    }

    fn name_suffix(self) -> &'static str {
        match self {
            Self::Elements => "_elements",
            Self::ElementProperties => "_elem_props",
            Self::Types => "_type_el",
            Self::GeometryFiles => "_geom_file",
            Self::GeometryViews => "_geom_view",
            Self::DataCache => "_data_cache",
        }
    }

    fn short_suffix(self) -> &'static str {
        match self {
            Self::Elements => "_ba_elem",
            Self::ElementProperties => "_elprops",
            other => other.name_suffix(),
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Elements => "Elements in BA model",
            Self::ElementProperties => "Element Props in BA model",
            Self::Types => "Type Elements in BA Check model",
            Self::GeometryFiles => "File Collection for Geometry Files",
            Self::GeometryViews => "Geometry Views in Model",
            Self::DataCache => "Data cached about imported model",
        }
    }

    pub fn introduced_in(self) -> u32 {
        match self {
            Self::DataCache => 2,
            _ => 1,
        }
    }

    pub fn indexes(self) -> Vec<IndexDef> {
        match self {
            Self::Elements => vec![
                IndexDef::ascending("model_els_coll_id", "id"),
                IndexDef::ascending("model_els_coll_source_id", "source_id"),
            ],
            Self::Types => vec![
                IndexDef::ascending("typeElemsCol_id", "id"),
                IndexDef::ascending("typeElemsCol_source_id", "source_id"),
            ],
            Self::DataCache => vec![IndexDef::text("dataCacheCol_dataType", "dataType")],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSet {
    pub elements: CollectionHandle,
    pub element_properties: CollectionHandle,
    pub types: CollectionHandle,
    pub geometry_files: CollectionHandle,
    pub geometry_views: CollectionHandle,
    pub data_cache: CollectionHandle,
}

impl CollectionSet {
    fn from_kinds(
        mut handles: HashMap<CollectionKind, CollectionHandle>,
        entity_id: &str,
    ) -> Result<Self, ImportError> {
        let mut take = |kind: CollectionKind| {
            handles
                .remove(&kind)
                .ok_or_else(|| ImportError::MissingCollection {
                    entity_id: entity_id.to_string(),
                    user_type: kind.user_type(),
                })
        };
        Ok(Self {
            elements: take(CollectionKind::Elements)?,
            element_properties: take(CollectionKind::ElementProperties)?,
            types: take(CollectionKind::Types)?,
            geometry_files: take(CollectionKind::GeometryFiles)?,
            geometry_views: take(CollectionKind::GeometryViews)?,
            data_cache: take(CollectionKind::DataCache)?,
        })
    }

    pub fn get(&self, kind: CollectionKind) -> &CollectionHandle {
        match kind {
            CollectionKind::Elements => &self.elements,
            CollectionKind::ElementProperties => &self.element_properties,
            CollectionKind::Types => &self.types,
            CollectionKind::GeometryFiles => &self.geometry_files,
            CollectionKind::GeometryViews => &self.geometry_views,
            CollectionKind::DataCache => &self.data_cache,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        CollectionKind::ALL
            .iter()
            .map(|kind| self.get(*kind).id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageIdentity {
    pub name: String,
    pub short_name: String,
    pub file_id: String,
    pub file_version_id: Option<String>,
    pub namespace: String,
}

impl PackageIdentity {
    pub fn new(request: &ImportRequest, short_name_len: usize, namespace: &str) -> Self {
        Self {
            name: request.source_file_name.clone(),
            short_name: request
                .source_file_name
                .chars()
                .take(short_name_len)
                .collect(),
            file_id: request.source_file_id.clone(),
            file_version_id: request.source_file_version_id.clone(),
            namespace: namespace.to_string(),
        }
    }

    pub fn version_attributes(&self) -> Value {
        json!({
            "bimpk": {
                "fileId": self.file_id,
                "fileVersionId": self.file_version_id,
            }
        })
    }

    fn collection_def(&self, kind: CollectionKind) -> CollectionDef {
        CollectionDef {
            name: format!("{}{}", self.name, kind.name_suffix()),
            short_name: format!("{}{}", self.short_name, kind.short_suffix()),
            description: kind.description().to_string(),
            user_type: kind.user_type().to_string(),
            namespaces: vec![self.namespace.clone()],
        }
    }

    fn composite_def(&self) -> CompositeDef {
        CompositeDef {
            name: self.name.clone(),
            short_name: format!("{}_modelver", self.short_name),
            description: "BIM model version by transform".to_string(),
            user_type: MODEL_VERSION_TYPE.to_string(),
            namespaces: vec![self.namespace.clone()],
            version_attributes: self.version_attributes(),
        }
    }
}

pub async fn find_model_entity(
    store: &dyn ItemStore,
    identity: &PackageIdentity,
) -> Result<Option<CompositeEntity>, ImportError> {
    let query = CompositeQuery {
        user_type: MODEL_VERSION_TYPE.to_string(),
        attribute_path: FILE_ID_PATH.to_string(),
        value: Value::String(identity.file_id.clone()),
    };
    Ok(store.query_composites(&query).await?.into_iter().next())
}

async fn provision_collection(
    store: &dyn ItemStore,
    identity: &PackageIdentity,
    kind: CollectionKind,
) -> Result<CollectionHandle, ImportError> {
    let handle = store
        .create_collection(&identity.collection_def(kind))
        .await
        .map_err(ImportError::provisioning("create_collection"))?;
    info!(
        collection_id = %handle.id,
        user_type = kind.user_type(),
        "Created collection {}",
        handle.name
    );

    let indexes = kind.indexes();
    if !indexes.is_empty() {
        store
            .create_or_recreate_index(&handle.id, &indexes)
            .await
            .map_err(ImportError::provisioning("create_index"))?;
    }
    Ok(handle)
}

/// First import of a source file: six collections with their indexes, the
/// owning model entity, and the links between them. Nothing is rolled back
/// if a call fails partway.
pub async fn provision_fresh(
    store: &dyn ItemStore,
    identity: &PackageIdentity,
) -> Result<(CompositeEntity, CollectionSet), ImportError> {
    let mut handles = HashMap::new();
    for kind in CollectionKind::ALL {
        handles.insert(kind, provision_collection(store, identity, kind).await?);
    }

    let entity = store
        .create_named_composite(&identity.composite_def())
        .await
        .map_err(ImportError::provisioning("create_named_composite"))?;
    info!(entity_id = %entity.id, file_id = %identity.file_id, "Created model entity");

    let set = CollectionSet::from_kinds(handles, &entity.id)?;
    store
        .add_related_collections(&entity.id, &set.ids())
        .await
        .map_err(ImportError::provisioning("add_related_collections"))?;
    Ok((entity, set))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCollection {
    pub kind: CollectionKind,
    pub handle: CollectionHandle,
    pub provisioned: bool,
}

/// Bring an entity's collections up to [`CURRENT_SCHEMA_REVISION`]. Kinds are
/// matched by tag, first match wins. Kinds added after revision 1 are
/// provisioned when absent; an absent revision-1 kind is an error.
pub async fn migrate_collection_schema(
    store: &dyn ItemStore,
    identity: &PackageIdentity,
    entity: &CompositeEntity,
    existing: &[CollectionHandle],
) -> Result<Vec<ResolvedCollection>, ImportError> {
    let mut resolved = Vec::with_capacity(CollectionKind::ALL.len());
    let current = CollectionKind::ALL
        .into_iter()
        .filter(|kind| kind.introduced_in() <= CURRENT_SCHEMA_REVISION);
    for kind in current {
        if let Some(handle) = existing.iter().find(|h| h.user_type == kind.user_type()) {
            resolved.push(ResolvedCollection {
                kind,
                handle: handle.clone(),
                provisioned: false,
            });
            continue;
        }
        if kind.introduced_in() <= 1 {
            return Err(ImportError::MissingCollection {
                entity_id: entity.id.clone(),
                user_type: kind.user_type(),
            });
        }
        info!(
            entity_id = %entity.id,
            user_type = kind.user_type(),
            revision = kind.introduced_in(),
            "Migrating model entity, provisioning missing collection"
        );
        resolved.push(ResolvedCollection {
            kind,
            handle: provision_collection(store, identity, kind).await?,
            provisioned: true,
        });
    }
    Ok(resolved)
}

pub async fn provision_version(
    store: &dyn ItemStore,
    identity: &PackageIdentity,
    entity: &CompositeEntity,
) -> Result<(CompositeEntity, CollectionSet), ImportError> {
    let existing = store
        .collections_in_composite(&entity.id)
        .await
        .map_err(ImportError::provisioning("collections_in_composite"))?;
    let resolved = migrate_collection_schema(store, identity, entity, &existing).await?;

    let version = store
        .create_version(&entity.id)
        .await
        .map_err(ImportError::provisioning("create_version"))?;
    let attributes = identity.version_attributes();
    store
        .update_version_attributes(&entity.id, &version.version_id, &attributes)
        .await
        .map_err(ImportError::provisioning("update_version_attributes"))?;
    info!(
        entity_id = %entity.id,
        version = version.version_no,
        "Created model entity version"
    );

    let mut handles = HashMap::new();
    for ResolvedCollection {
        kind,
        mut handle,
        provisioned,
    } in resolved
    {
        if !provisioned {
            let collection_version = store
                .create_version(&handle.id)
                .await
                .map_err(ImportError::provisioning("create_version"))?;
            handle.version_no = collection_version.version_no;
            let indexes = kind.indexes();
            if !indexes.is_empty() {
                store
                    .create_or_recreate_index(&handle.id, &indexes)
                    .await
                    .map_err(ImportError::provisioning("create_index"))?;
            }
            info!(
                collection_id = %handle.id,
                version = handle.version_no,
                "Created collection version"
            );
        }
        handles.insert(kind, handle);
    }

    let set = CollectionSet::from_kinds(handles, &entity.id)?;
    let entity = CompositeEntity {
        version_id: version.version_id,
        version_no: version.version_no,
        version_attributes: attributes,
        ..entity.clone()
    };
    Ok((entity, set))
}
