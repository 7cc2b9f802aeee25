use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::{
    cache::build_source_file_cache,
    error::ImportError,
    extract::extract_package,
    ids::IdGenerator,
    models::ImportRequest,
    provision::{
        find_model_entity, provision_fresh, provision_version, CollectionSet, PackageIdentity,
    },
    store::{CompositeEntity, ItemStore},
    writer::{write_graph, WriteSummary},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Start,
    Detect,
    Fresh,
    Versioned,
    Done,
    Cached,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutput {
    pub elements_collection_id: String,
    pub types_collection_id: String,
    pub geometry_files_collection_id: String,
    pub geometry_views_collection_id: String,
    pub composite_entity_id: String,
    pub composite_version_no: u32,
    pub collection_set: CollectionSet,
    pub written: WriteSummary,
}

impl ImportOutput {
    fn new(entity: &CompositeEntity, set: CollectionSet, written: WriteSummary) -> Self {
        Self {
            elements_collection_id: set.elements.id.clone(),
            types_collection_id: set.types.id.clone(),
            geometry_files_collection_id: set.geometry_files.id.clone(),
            geometry_views_collection_id: set.geometry_views.id.clone(),
            composite_entity_id: entity.id.clone(),
            composite_version_no: entity.version_no,
            collection_set: set,
            written,
        }
    }
}

#[async_trait]
pub trait StateObserver: Send + Sync {
    async fn on_state(&self, state: PipelineState);
}

#[async_trait]
impl StateObserver for () {
    async fn on_state(&self, _state: PipelineState) {}
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub short_name_len: usize,
    pub namespace: String,
    pub cache_fanout_warn: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            short_name_len: 11,
            namespace: "default".to_string(),
            cache_fanout_warn: 50,
        }
    }
}

#[derive(Default)]
struct FileLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FileLocks {
    async fn acquire(&self, file_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(file_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct ImportPipeline {
    store: Arc<dyn ItemStore>,
    ids: Arc<dyn IdGenerator>,
    options: PipelineOptions,
    locks: FileLocks,
}

impl ImportPipeline {
    pub fn new(
        store: Arc<dyn ItemStore>,
        ids: Arc<dyn IdGenerator>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            ids,
            options,
            locks: FileLocks::default(),
        }
    }

    pub async fn run(
        &self,
        request: &ImportRequest,
        observer: &dyn StateObserver,
    ) -> Result<ImportOutput, ImportError> {
        let _guard = self.locks.acquire(&request.source_file_id).await;
        observer.on_state(PipelineState::Start).await;

        match self.run_stages(request, observer).await {
            Ok(output) => {
                observer.on_state(PipelineState::Done).await;
                info!(
                    file_id = %request.source_file_id,
                    entity_id = %output.composite_entity_id,
                    version = output.composite_version_no,
                    "Import complete"
                );
                Ok(output)
            }
            Err(err) => {
                error!(
                    file_id = %request.source_file_id,
                    code = err.code(),
                    "Import failed: {err}"
                );
                observer.on_state(PipelineState::Failed).await;
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        request: &ImportRequest,
        observer: &dyn StateObserver,
    ) -> Result<ImportOutput, ImportError> {
        let store = self.store.as_ref();
        let identity = PackageIdentity::new(
            request,
            self.options.short_name_len,
            &self.options.namespace,
        );

        observer.on_state(PipelineState::Detect).await;
        let existing = find_model_entity(store, &identity).await?;

        let (entity, set, extraction) = match existing {
            None => {
                observer.on_state(PipelineState::Fresh).await;
                let extraction = extract_package(&request.files, self.ids.as_ref())?;
                let (entity, set) = provision_fresh(store, &identity).await?;
                (entity, set, extraction)
            }
            Some(entity) => {
                observer.on_state(PipelineState::Versioned).await;
                let extraction = extract_package(&request.files, self.ids.as_ref())?;
                let (entity, set) = provision_version(store, &identity, &entity).await?;
                (entity, set, extraction)
            }
        };

        let written = write_graph(store, &entity, &set, &extraction).await?;
        Ok(ImportOutput::new(&entity, set, written))
    }

    pub async fn build_cache(
        &self,
        output: &ImportOutput,
        observer: &dyn StateObserver,
    ) -> Result<usize, ImportError> {
        match build_source_file_cache(
            self.store.as_ref(),
            &output.collection_set,
            self.options.cache_fanout_warn,
        )
        .await
        {
            Ok(records) => {
                observer.on_state(PipelineState::Cached).await;
                Ok(records)
            }
            Err(err) => {
                error!(entity_id = %output.composite_entity_id, "Cache build failed: {err}");
                observer.on_state(PipelineState::Failed).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        error::MalformedInput,
        extract::tests::{sample_package, sample_request},
        ids::RandomIds,
        store::{
            testing::FlakyStore, SqliteItemStore, COLLECTION_ITEM_CLASS, COMPOSITE_ITEM_CLASS,
        },
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PipelineState>>);

    #[async_trait]
    impl StateObserver for Recorder {
        async fn on_state(&self, state: PipelineState) {
            self.0.lock().unwrap().push(state);
        }
    }

    impl Recorder {
        fn states(&self) -> Vec<PipelineState> {
            self.0.lock().unwrap().clone()
        }
    }

    fn pipeline(store: Arc<dyn ItemStore>) -> ImportPipeline {
        ImportPipeline::new(store, Arc::new(RandomIds), PipelineOptions::default())
    }

    #[tokio::test]
    async fn first_import_takes_the_fresh_path() {
        let store = Arc::new(SqliteItemStore::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone());
        let recorder = Recorder::default();

        let output = pipeline.run(&sample_request(), &recorder).await.unwrap();

        assert_eq!(
            recorder.states(),
            vec![
                PipelineState::Start,
                PipelineState::Detect,
                PipelineState::Fresh,
                PipelineState::Done
            ]
        );
        assert_eq!(store.named_item_count(COMPOSITE_ITEM_CLASS), 1);
        assert_eq!(store.named_item_count(COLLECTION_ITEM_CLASS), 6);
        assert_eq!(store.item_count(&output.elements_collection_id), 2);
        assert_eq!(store.item_count(&output.types_collection_id), 1);
        assert_eq!(output.written.relations, 2);
        assert_eq!(output.composite_version_no, 1);
    }

    #[tokio::test]
    async fn reimport_versions_the_same_entity() {
        let store = Arc::new(SqliteItemStore::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone());

        let first = pipeline.run(&sample_request(), &()).await.unwrap();
        let recorder = Recorder::default();
        let second = pipeline.run(&sample_request(), &recorder).await.unwrap();

        assert!(recorder.states().contains(&PipelineState::Versioned));
        assert_eq!(second.composite_entity_id, first.composite_entity_id);
        assert_eq!(second.composite_version_no, 2);
        assert_eq!(second.collection_set.ids(), first.collection_set.ids());
        assert_eq!(store.named_item_count(COMPOSITE_ITEM_CLASS), 1);
        assert_eq!(store.named_item_count(COLLECTION_ITEM_CLASS), 6);
        // the new version holds only the second import's items
        assert_eq!(store.item_count(&second.elements_collection_id), 2);
    }

    #[tokio::test]
    async fn malformed_input_fails_before_provisioning() {
        let store = Arc::new(SqliteItemStore::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone());
        let mut package = sample_package();
        package["files"][0]["occurrences"][0]["objects"][1]["type"] = json!("T9");
        let request: ImportRequest = serde_json::from_value(package).unwrap();
        let recorder = Recorder::default();

        let err = pipeline.run(&request, &recorder).await.unwrap_err();

        assert!(matches!(
            err,
            ImportError::MalformedInput(MalformedInput::UnknownType { .. })
        ));
        assert_eq!(recorder.states().last(), Some(&PipelineState::Failed));
        assert_eq!(store.named_item_count(COLLECTION_ITEM_CLASS), 0);
    }

    #[tokio::test]
    async fn store_failure_moves_the_run_to_failed() {
        let store = Arc::new(FlakyStore::new("create_relations", 0));
        let pipeline = pipeline(store.clone());
        let recorder = Recorder::default();

        let err = pipeline.run(&sample_request(), &recorder).await.unwrap_err();

        assert_eq!(err.code(), "WRITE_FAILED");
        assert!(!recorder.states().contains(&PipelineState::Done));
        assert_eq!(recorder.states().last(), Some(&PipelineState::Failed));
    }

    #[tokio::test]
    async fn cache_runs_after_a_completed_import() {
        let store = Arc::new(SqliteItemStore::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone());
        let output = pipeline.run(&sample_request(), &()).await.unwrap();
        let recorder = Recorder::default();

        let records = pipeline.build_cache(&output, &recorder).await.unwrap();

        assert_eq!(records, 1);
        assert_eq!(recorder.states(), vec![PipelineState::Cached]);
        assert_eq!(store.item_count(&output.collection_set.data_cache.id), 1);
    }

    #[tokio::test]
    async fn concurrent_imports_of_one_file_share_an_entity() {
        let store = Arc::new(SqliteItemStore::open_in_memory().unwrap());
        let pipeline = Arc::new(pipeline(store.clone()));

        let runs = (0..3).map(|_| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.run(&sample_request(), &()).await })
        });
        let mut versions = Vec::new();
        for run in runs.collect::<Vec<_>>() {
            let output = tokio::time::timeout(Duration::from_secs(10), run)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            versions.push(output.composite_version_no);
        }
        versions.sort_unstable();

        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(store.named_item_count(COMPOSITE_ITEM_CLASS), 1);
    }
}
