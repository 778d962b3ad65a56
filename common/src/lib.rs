use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

#[macro_use]
pub mod macros;
pub mod file_format;
pub mod log_setup;

pub use file_format::{FileExtensionError, FileFormat};

#[derive(Debug, thiserror::Error)]
pub enum SerdeFormatError {
    #[error("YAML serialization failed")]
    Yaml(#[from] serde_yml::Error),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Extension(#[from] FileExtensionError),
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type SerdeFormatResult<T> = Result<T, SerdeFormatError>;

pub fn serialize<T: Serialize>(value: &T, format: FileFormat) -> SerdeFormatResult<String> {
    match format {
        FileFormat::Yaml => Ok(serde_yml::to_string(value)?),
        FileFormat::Json => Ok(serde_json::to_string_pretty(value)?),
    }
}

pub fn deserialize<T: DeserializeOwned>(
    serialized: &str,
    format: FileFormat,
) -> SerdeFormatResult<T> {
    match format {
        FileFormat::Yaml => Ok(serde_yml::from_str(serialized)?),
        FileFormat::Json => Ok(serde_json::from_str(serialized)?),
    }
}

/// Reads `path` and deserializes it with the format implied by its extension.
pub fn deserialize_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> SerdeFormatResult<T> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| SerdeFormatError::Read {
        path: path.display().to_string(),
        source,
    })?;

    deserialize(&text, format)
}
