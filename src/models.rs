use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{ImportOutput, PipelineState};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for RawId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RawId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProperty {
    pub id: RawId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "val", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, alias = "dName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(
        default,
        alias = "type",
        alias = "srcType",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_type: Option<String>,
    #[serde(default, alias = "psDispName", skip_serializing_if = "Option::is_none")]
    pub display_override: Option<String>,
    #[serde(default, alias = "assetCategory", skip_serializing_if = "Option::is_none")]
    pub category_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawType {
    pub id: RawId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub properties: Vec<RawProperty>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawObject {
    pub id: RawId,
    #[serde(alias = "type")]
    pub type_id: RawId,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub relationships: Option<Value>,
    #[serde(default)]
    pub properties: Vec<RawProperty>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OccurrenceContent {
    #[serde(default)]
    pub types: Vec<RawType>,
    #[serde(default)]
    pub objects: Vec<RawObject>,
    #[serde(default)]
    pub properties: Vec<RawProperty>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OccurrenceRepr {
    Flat(OccurrenceContent),
    Nested { objects: OccurrenceContent },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "OccurrenceRepr")]
pub struct RawOccurrence {
    #[serde(flatten)]
    pub content: OccurrenceContent,
}

impl From<OccurrenceRepr> for RawOccurrence {
    fn from(repr: OccurrenceRepr) -> Self {
        match repr {
            OccurrenceRepr::Flat(content) | OccurrenceRepr::Nested { objects: content } => {
                Self { content }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFile {
    pub name: String,
    #[serde(default, alias = "occurences")]
    pub occurrences: Vec<RawOccurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    #[serde(alias = "filename")]
    pub source_file_name: String,
    #[serde(alias = "_fileId")]
    pub source_file_id: String,
    #[serde(default, alias = "_fileVersionId")]
    pub source_file_version_id: Option<String>,
    #[serde(default)]
    pub files: Vec<RawFile>,
}

pub type PropertyMap = BTreeMap<String, RawProperty>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRecord {
    #[serde(rename = "_id")]
    pub internal_id: String,
    #[serde(rename = "id")]
    pub external_id: RawId,
    pub name: String,
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    #[serde(rename = "_id")]
    pub internal_id: String,
    pub package_id: RawId,
    pub type_id: RawId,
    pub source_id: Option<String>,
    pub relationships: Option<Value>,
    pub source_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<RawProperty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<RawProperty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<RawProperty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_element_id: Option<RawProperty>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag {
    #[serde(rename = "_id")]
    pub element_id: String,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    NotRequested,
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobState,
    pub pipeline_state: PipelineState,
    pub progress: f64,
    pub message: Option<String>,
    pub request: Option<ImportRequest>,
    pub output: Option<ImportOutput>,
    pub cache_state: CacheState,
    pub cache_records: Option<usize>,
    pub error: Option<ErrorPayload>,
}

impl JobRecord {
    pub fn queued(job_id: String, request: ImportRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            created_at: now,
            updated_at: now,
            status: JobState::Queued,
            pipeline_state: PipelineState::Start,
            progress: 0.0,
            message: Some("Queued for import".to_string()),
            request: Some(request),
            output: None,
            cache_state: CacheState::NotRequested,
            cache_records: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobState::Completed | JobState::Failed)
            && !matches!(self.cache_state, CacheState::Queued | CacheState::Running)
    }

    pub fn to_response(&self) -> ImportJobResponse {
        let elapsed = (Utc::now() - self.created_at).num_milliseconds().max(0) as u64;
        ImportJobResponse {
            job_id: self.job_id.clone(),
            status: self.status,
            pipeline_state: self.pipeline_state,
            progress: self.progress,
            elapsed_ms: elapsed,
            message: self.message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            output: self.output.clone(),
            cache_state: self.cache_state,
            cache_records: self.cache_records,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobResponse {
    pub job_id: String,
    pub status: JobState,
    pub pipeline_state: PipelineState,
    pub progress: f64,
    pub elapsed_ms: u64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ImportOutput>,
    pub cache_state: CacheState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_records: Option<usize>,
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportAcceptedResponse {
    pub job_id: String,
    pub status: JobState,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}
