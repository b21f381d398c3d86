use std::path::Path;

use figment::{
    providers::{Data, Format},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A file-backed configuration provider that has been resolved up front.
///
/// `figment`'s own file providers re-read their backing file every time the data is queried. We only want to pay for
/// the read (and the parse) once, at load time, so this provider eagerly reads and parses the file and then serves the
/// parsed data from memory.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    fn resolve_from_file<F>(path: &Path, source_kind: &'static str) -> Result<Self, Error>
    where
        F: Format,
    {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let data = Data::<F>::string(&raw).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from(source_kind, path),
        })
    }

    /// Reads and parses the given file as YAML.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or could not be parsed as YAML, an error is returned.
    pub fn from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::resolve_from_file::<figment::providers::Yaml>(path.as_ref(), "YAML file")
    }

    /// Reads and parses the given file as JSON.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or could not be parsed as JSON, an error is returned.
    pub fn from_json<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::resolve_from_file::<figment::providers::Json>(path.as_ref(), "JSON file")
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
