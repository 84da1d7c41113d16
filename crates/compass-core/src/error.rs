use thiserror::Error;

/// Top-level error type for the Compass system.
///
/// Subsystem crates define their own error types and implement
/// `From<CompassError>` so that `?` works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompassError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<toml::de::Error> for CompassError {
    fn from(err: toml::de::Error) -> Self {
        CompassError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CompassError {
    fn from(err: toml::ser::Error) -> Self {
        CompassError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CompassError {
    fn from(err: serde_json::Error) -> Self {
        CompassError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Compass operations.
pub type Result<T> = std::result::Result<T, CompassError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CompassError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CompassError = io_err.into();
        assert!(matches!(err, CompassError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(CompassError, &str)> = vec![
            (
                CompassError::Storage("disk full".to_string()),
                "Storage error: disk full",
            ),
            (
                CompassError::Serialization("invalid json".to_string()),
                "Serialization error: invalid json",
            ),
            (
                CompassError::NotFound("conversation".to_string()),
                "Not found: conversation",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let compass_err: CompassError = err.unwrap_err().into();
        assert!(matches!(compass_err, CompassError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let compass_err: CompassError = err.unwrap_err().into();
        assert!(matches!(compass_err, CompassError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let _value = io_result?;
            Ok("success".to_string())
        }

        assert_eq!(inner().unwrap(), "success");
    }
}
