use thiserror::Error;

/// Payload matched none of the known track encodings.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("could not decode as trackpoints, geojson, geojson feature collection, or newline-delimited trackpoints/geojson")]
    Unrecognized,
}

/// A single feature failed structural checks. The feature is dropped, the batch continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("nil geometry")]
    MissingGeometry,

    #[error("not a point: {0}")]
    NotAPoint(String),

    #[error("malformed point coordinates")]
    MalformedCoordinates,

    #[error("invalid coordinate: lat={0:.14}")]
    LatitudeOutOfRange(f64),

    #[error("invalid coordinate: lng={0:.14}")]
    LongitudeOutOfRange(f64),

    #[error("nil name")]
    MissingName,

    #[error("name not a string")]
    NameNotString,

    #[error("nil uuid")]
    MissingUuid,

    #[error("uuid not a string")]
    UuidNotString,

    #[error("missing field: Time")]
    MissingTime,

    #[error("time not an RFC 3339 timestamp: {0}")]
    InvalidTime(String),

    #[error("missing field: Accuracy")]
    MissingAccuracy,

    #[error("accuracy not a number")]
    AccuracyNotNumber,
}

/// Features of one batch do not all belong to the same tracked entity.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    #[error("feature {index} belongs to {found_name}/{found_uuid}, batch belongs to {expected_name}/{expected_uuid}")]
    MixedEntities {
        index: usize,
        expected_name: String,
        expected_uuid: String,
        found_name: String,
        found_uuid: String,
    },
}

/// Failures of the segment file and the keyspace indexes.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt entry at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("entry serialization failed: {0}")]
    Serialize(String),

    #[error("value encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("poisoned lock")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("duplicate point: {key}")]
    Duplicate { key: String },

    #[error("0 trackpoints to store")]
    EmptyBatch,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(StorageError::Io(e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Storage(StorageError::Json(e))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
