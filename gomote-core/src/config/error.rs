//! Environment catalog error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while locating, reading or querying the environment catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No catalog file exists at any search location.
    #[error("environment catalog not found (searched: {searched:?})")]
    NotFound {
        /// Every path that was checked.
        searched: Vec<PathBuf>,
    },

    /// The catalog file exists but is empty.
    #[error("environment catalog {} is empty", path.display())]
    Empty {
        /// The catalog path.
        path: PathBuf,
    },

    /// Two entries claim the same project id.
    #[error("duplicate project id '{project_id}' in environment catalog")]
    DuplicateProject {
        /// The repeated project id.
        project_id: String,
    },

    /// YAML parsing error.
    #[error("environment catalog parse error: {0}")]
    Parse(#[from] serde_saphyr::Error),

    /// I/O error reading the catalog.
    #[error("I/O error reading environment catalog: {0}")]
    Io(#[from] std::io::Error),
}
