use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A field holds a value outside of its accepted range.
    #[error("Invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// A partition key contains characters that cannot be used in staged object names.
    #[error("Invalid partition key `{0}`: only ASCII letters, digits, `_`, `-` and `.` are allowed")]
    InvalidPartitionKey(String),
    /// The same partition key is listed more than once.
    #[error("Partition key `{0}` is listed more than once")]
    DuplicatePartition(String),
    /// The same entity is configured more than once.
    #[error("Entity `{0}` is configured more than once in `{1}`")]
    DuplicateEntity(String, &'static str),
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, constraint: &str) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.to_string(),
            constraint: constraint.to_string(),
        }
    }
}

/// Returns `true` when `key` is usable as a partition key inside staged object names.
pub(crate) fn is_valid_partition_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && key != "."
        && key != ".."
}
