//! Purpose: The query-phase entry point: a sealed store plus the index built from it.
//! Exports: `QueryService`, `DatasetInfo`, `validate_pair`.
//! Role: Explicitly constructed, immutable value shared by the CLI and the server.
//! Invariants: An index is only ever paired with the store whose fingerprint it carries.
//! Invariants: All methods take `&self`; the service is `Send + Sync` and lock-free.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::validation::{ValidationReport, validate_pair_report};
use crate::core::dataset::{ArtifactPaths, resolve_current};
use crate::core::diff::{self, DiffQuery, DiffReport};
use crate::core::error::{Error, ErrorKind};
use crate::core::index::{IndexArtifact, NameIndex};
use crate::core::query::{self, SearchPage, SearchQuery};
use crate::core::store::{RecordStore, StoreFingerprint};

#[derive(Clone, Debug, Serialize)]
pub struct DatasetInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    pub store_path: PathBuf,
    pub index_path: PathBuf,
    pub format_version: u32,
    pub built_at: String,
    pub store: StoreFingerprint,
    pub keys: usize,
    pub offsets: usize,
}

pub struct QueryService {
    store: RecordStore,
    index: NameIndex,
    info: DatasetInfo,
}

impl QueryService {
    /// Opens the generation currently published in a dataset directory.
    pub fn open_dataset(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let (generation, paths) = resolve_current(dir.as_ref())?;
        let mut service = Self::open(&paths)?;
        service.info.generation = Some(generation);
        Ok(service)
    }

    /// Opens an explicit store/index pair, refusing an index built from another store.
    pub fn open(paths: &ArtifactPaths) -> Result<Self, Error> {
        let artifact = IndexArtifact::load(&paths.index)?;
        let store = RecordStore::open(&paths.store)?;
        let actual = store.fingerprint();
        if actual != artifact.store {
            return Err(Error::new(ErrorKind::Mismatch)
                .with_message("index was built from a different store file")
                .with_path(&paths.index)
                .with_hint("Store and index must come from the same build; rebuild the dataset."));
        }

        let info = DatasetInfo {
            generation: None,
            store_path: paths.store.clone(),
            index_path: paths.index.clone(),
            format_version: artifact.format_version,
            built_at: artifact.built_at.clone(),
            store: actual,
            keys: 0,
            offsets: 0,
        };
        let index = artifact.into_index();
        let info = DatasetInfo {
            keys: index.key_count(),
            offsets: index.offset_count(),
            ..info
        };
        tracing::info!(
            store = %paths.store.display(),
            records = info.store.records,
            keys = info.keys,
            "query service ready"
        );
        Ok(Self { store, index, info })
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    pub fn search(&self, query: &SearchQuery) -> Result<SearchPage, Error> {
        query::search(&self.store, &self.index, query)
    }

    pub fn difference(&self, query: &DiffQuery) -> Result<DiffReport, Error> {
        diff::difference(&self.store, &self.index, query)
    }

    pub fn validate(&self) -> ValidationReport {
        let paths = ArtifactPaths::new(&self.info.store_path, &self.info.index_path);
        validate_pair_report(&paths, &self.store, &self.index, &self.info.store)
    }
}

/// Validates a pair without the fingerprint gate, so a mismatched pair is
/// reported rather than refused.
pub fn validate_pair(paths: &ArtifactPaths) -> Result<ValidationReport, Error> {
    let artifact = IndexArtifact::load(&paths.index)?;
    let store = RecordStore::open(&paths.store)?;
    let expected = artifact.store.clone();
    let index = artifact.into_index();
    Ok(validate_pair_report(paths, &store, &index, &expected))
}
