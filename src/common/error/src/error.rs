use std::fmt::{self, Display};

pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Ordered key/value diagnostics attached to an operation failure, enough to
/// reproduce the decision that failed without access to controller internals
/// (e.g. `bucket_count`, `max_bucket_count`, involved table paths).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorAttributes {
    entries: Vec<(String, String)>,
}

impl ErrorAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Display) {
        self.entries.push((key.into(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Display for ErrorAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.entries {
            map.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        write!(f, "{}", serde_json::Value::Object(map))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArmadaError {
    #[error("ArmadaError::InternalError {0}")]
    InternalError(String),
    #[error("ArmadaError::InvalidOperationSpec {0}")]
    InvalidOperationSpec(String),
    #[error("ArmadaError::OperationFailed {message}, attributes: {attributes}")]
    OperationFailed {
        message: String,
        attributes: ErrorAttributes,
    },
    #[error("ArmadaError::OperationAborted {0}")]
    OperationAborted(String),
    #[error("ArmadaError::SnapshotError {0}")]
    SnapshotError(String),
    #[error("ArmadaError::IoError {0}")]
    IoError(#[from] std::io::Error),
    #[error("ArmadaError::External {0}")]
    External(GenericError),
}

impl ArmadaError {
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
            attributes: ErrorAttributes::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Display) -> Self {
        if let Self::OperationFailed { attributes, .. } = &mut self {
            attributes.set(key, value);
        }
        self
    }

    /// Whether this error indicates a controller bug rather than a bad
    /// operation or a job-level problem.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::InternalError(_))
    }
}

pub type ArmadaResult<T, E = ArmadaError> = Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_failed_carries_attributes() {
        let err = ArmadaError::operation_failed("too many output buckets")
            .with_attribute("bucket_count", 250)
            .with_attribute("max_bucket_count", 100);
        match &err {
            ArmadaError::OperationFailed { attributes, .. } => {
                assert_eq!(attributes.get("bucket_count"), Some("250"));
                assert_eq!(attributes.get("max_bucket_count"), Some("100"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let rendered = err.to_string();
        assert!(rendered.contains("too many output buckets"));
        assert!(rendered.contains("\"bucket_count\":\"250\""));
    }

    #[test]
    fn internal_ensure_short_circuits() {
        fn check(x: i64) -> ArmadaResult<i64> {
            crate::internal_ensure!(x >= 0, "negative data weight: {}", x);
            Ok(x)
        }
        assert!(check(1).is_ok());
        let err = check(-5).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("negative data weight: -5"));
    }
}
