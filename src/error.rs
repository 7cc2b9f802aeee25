use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed input: {0}")]
    MalformedInput(#[from] MalformedInput),

    #[error("provisioning failed at `{step}`: {source}")]
    Provisioning {
        step: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("model entity {entity_id} has no `{user_type}` collection")]
    MissingCollection {
        entity_id: String,
        user_type: &'static str,
    },

    #[error("graph write failed at `{step}`: {source}")]
    Write {
        step: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("cache build failed: {0}")]
    Cache(#[source] StoreError),

    #[error("item store error: {0}")]
    Store(#[from] StoreError),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ImportError {
    pub fn provisioning(step: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Provisioning { step, source }
    }

    pub fn write(step: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Write { step, source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedInput(_) => "MALFORMED_INPUT",
            Self::Provisioning { .. } => "PROVISIONING_FAILED",
            Self::MissingCollection { .. } => "MISSING_COLLECTION",
            Self::Write { .. } => "WRITE_FAILED",
            Self::Cache(_) => "CACHE_FAILED",
            Self::Store(_) => "STORE_FAILED",
            Self::Serialization(_) => "SERIALIZATION_FAILED",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MalformedInput {
    #[error("property {property_id} referenced by {owner} is not defined in occurrence {occurrence} of `{file}`")]
    UnknownProperty {
        file: String,
        occurrence: usize,
        owner: String,
        property_id: String,
    },

    #[error("object {object_id} in `{file}` references unknown type {type_id}")]
    UnknownType {
        file: String,
        object_id: String,
        type_id: String,
    },

    #[error("property {property_id} has no display name to key on")]
    MissingDisplayName { property_id: String },
}
