use thiserror::Error;

// ---------------------------------------------------------------------------
// EngineError – everything the compute layer can report upward
// ---------------------------------------------------------------------------

/// Unified error type for engine operations.
///
/// Errors are never cached: a failed computation leaves its cache slot empty
/// so the next identical request retries.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The feature column is constant (or has no finite value), so min-max
    /// scaling would divide by zero.
    #[error("Feature '{feature}' of dataset '{dataset}' is degenerate (min == max == {value})")]
    DegenerateFeature {
        dataset: String,
        feature: String,
        value: f64,
    },

    /// Fewer than two non-empty exemplar populations were supplied.
    #[error("Classification needs at least 2 labelled populations, got {found}")]
    InsufficientLabels { found: usize },

    /// Client supplied parameter failed to parse or has the wrong shape.
    #[error("Malformed parameter '{parameter}': {message}")]
    MalformedParameter { parameter: String, message: String },

    #[error("Unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("Unknown feature '{feature}' in dataset '{dataset}'")]
    UnknownFeature { dataset: String, feature: String },

    /// An exemplar or probe refers to an object id outside the dataset.
    #[error("Object {object} is out of range for dataset '{dataset}' ({count} objects)")]
    UnknownObject {
        dataset: String,
        object: usize,
        count: usize,
    },

    /// Failure inside the array source adapter (I/O, decoding, ...).
    #[error("Data source error: {0:#}")]
    Source(#[from] anyhow::Error),
}

/// Distinguishable error category handed to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DegenerateFeature,
    InsufficientLabels,
    MalformedParameter,
    UnknownDataset,
    UnknownFeature,
    UnknownObject,
    Source,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DegenerateFeature { .. } => ErrorKind::DegenerateFeature,
            EngineError::InsufficientLabels { .. } => ErrorKind::InsufficientLabels,
            EngineError::MalformedParameter { .. } => ErrorKind::MalformedParameter,
            EngineError::UnknownDataset(_) => ErrorKind::UnknownDataset,
            EngineError::UnknownFeature { .. } => ErrorKind::UnknownFeature,
            EngineError::UnknownObject { .. } => ErrorKind::UnknownObject,
            EngineError::Source(_) => ErrorKind::Source,
        }
    }

    /// Creates a malformed-parameter error.
    pub fn malformed(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::MalformedParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown-feature error.
    pub fn unknown_feature(dataset: &str, feature: &str) -> Self {
        EngineError::UnknownFeature {
            dataset: dataset.to_string(),
            feature: feature.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct_per_category() {
        let degenerate = EngineError::DegenerateFeature {
            dataset: "d".into(),
            feature: "f".into(),
            value: 1.0,
        };
        assert_eq!(degenerate.kind(), ErrorKind::DegenerateFeature);
        assert_eq!(
            EngineError::InsufficientLabels { found: 1 }.kind(),
            ErrorKind::InsufficientLabels
        );
        assert_eq!(
            EngineError::malformed("features", "not a list").kind(),
            ErrorKind::MalformedParameter
        );
        let source: EngineError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(source.kind(), ErrorKind::Source);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InsufficientLabels).unwrap();
        assert_eq!(json, "\"insufficient_labels\"");
    }
}
