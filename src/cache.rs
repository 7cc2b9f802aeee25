use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    error::{ImportError, StoreError},
    provision::CollectionSet,
    store::{FieldFilter, ItemStore},
};

pub const SOURCE_FILE_CACHE_TYPE: &str = "sourcefileToPkgIds";
const FILENAME_FIELD: &str = "source_filename";
const PACKAGE_ID_FIELD: &str = "package_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFileEntry {
    pub sourcefile: String,
    pub package_ids: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub data_type: String,
    pub data: SourceFileEntry,
}

fn filename_of(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

pub async fn collect_source_file_entries(
    store: &dyn ItemStore,
    set: &CollectionSet,
    fanout_warn: usize,
) -> Result<Vec<SourceFileEntry>, StoreError> {
    let elements_id = &set.elements.id;
    if let Some(grouped) = store
        .distinct_grouped(elements_id, FILENAME_FIELD, PACKAGE_ID_FIELD)
        .await?
    {
        return Ok(grouped
            .into_iter()
            .map(|(sourcefile, package_ids)| SourceFileEntry {
                sourcefile,
                package_ids,
            })
            .collect());
    }

    let filenames = store
        .distinct_values(elements_id, FILENAME_FIELD, None)
        .await?;
    if filenames.len() > fanout_warn {
        warn!(
            collection_id = %elements_id,
            files = filenames.len(),
            "Store cannot group distinct values, issuing one query per source file"
        );
    }

    let mut entries = Vec::with_capacity(filenames.len());
    for filename in filenames {
        let filter = FieldFilter {
            field: FILENAME_FIELD.to_string(),
            value: filename.clone(),
        };
        let package_ids = store
            .distinct_values(elements_id, PACKAGE_ID_FIELD, Some(&filter))
            .await?;
        entries.push(SourceFileEntry {
            sourcefile: filename_of(filename),
            package_ids,
        });
    }
    entries.sort_by(|a, b| a.sourcefile.cmp(&b.sourcefile));
    Ok(entries)
}

pub async fn build_source_file_cache(
    store: &dyn ItemStore,
    set: &CollectionSet,
    fanout_warn: usize,
) -> Result<usize, ImportError> {
    let entries = collect_source_file_entries(store, set, fanout_warn)
        .await
        .map_err(ImportError::Cache)?;

    let records = entries
        .into_iter()
        .map(|data| {
            serde_json::to_value(CacheRecord {
                data_type: SOURCE_FILE_CACHE_TYPE.to_string(),
                data,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let written = store
        .create_items_bulk(&set.data_cache.id, &records)
        .await
        .map_err(ImportError::Cache)?;
    info!(collection_id = %set.data_cache.id, records = written, "Data cache built");
    Ok(written)
}
