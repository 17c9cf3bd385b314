// Single-pass dataset build: append records, index them, publish the pair atomically.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::dataset::{
    ArtifactPaths, BuildLock, TMP_PREFIX, is_generation_name, publish_current, sync_dir,
};
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::index::{IndexArtifact, NameIndex};
use crate::core::normalize::normalize;
use crate::core::record::{Record, stored_name};
use crate::core::store::{RecordOffset, StoreFingerprint, StoreWriter};

#[derive(Clone, Debug, Serialize)]
pub struct BuildSummary {
    pub generation: String,
    pub store_path: PathBuf,
    pub index_path: PathBuf,
    pub records: u64,
    pub keys: usize,
    pub built_at: String,
    pub store: StoreFingerprint,
}

/// Builds a new generation inside a dataset directory.
///
/// Everything is written under a hidden temporary directory; `publish` renames it
/// into place and then swaps `CURRENT`. Dropping the builder without publishing
/// removes the temporary directory, so a failed build leaves nothing visible.
pub struct DatasetBuilder {
    dir: PathBuf,
    generation: String,
    writer: StoreWriter,
    index: NameIndex,
    staging: StagingDir,
    _lock: BuildLock,
}

impl DatasetBuilder {
    pub fn begin(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|err| io_error(err, &dir, "failed to create dataset directory"))?;
        let lock = BuildLock::acquire(&dir)?;

        let generation = generation_name()?;
        let staging_path = dir.join(format!("{TMP_PREFIX}{generation}"));
        fs::create_dir(&staging_path)
            .map_err(|err| io_error(err, &staging_path, "failed to create staging directory"))?;
        let staging = StagingDir::new(staging_path);

        let writer = StoreWriter::create(ArtifactPaths::in_dir(staging.path()).store)?;
        tracing::info!(dir = %dir.display(), generation = %generation, "build started");
        Ok(Self {
            dir,
            generation,
            writer,
            index: NameIndex::new(),
            staging,
            _lock: lock,
        })
    }

    /// Appends `record` and indexes it under the key of its name as stored, so a
    /// truncated name is indexed by what reads back.
    pub fn append(&mut self, record: &Record) -> Result<RecordOffset, Error> {
        let offset = self.writer.append(record)?;
        self.index
            .insert(normalize(stored_name(&record.municipio)), offset);
        Ok(offset)
    }

    pub fn publish(self) -> Result<BuildSummary, Error> {
        let Self {
            dir,
            generation,
            writer,
            index,
            mut staging,
            _lock,
        } = self;

        let store = writer.finish()?;
        let keys = index.key_count();
        let built_at = now_rfc3339()?;
        let artifact = IndexArtifact::new(index, store.clone(), built_at.clone());
        artifact.save(ArtifactPaths::in_dir(staging.path()).index)?;
        sync_dir(staging.path())?;

        let final_dir = dir.join(&generation);
        fs::rename(staging.path(), &final_dir)
            .map_err(|err| io_error(err, &final_dir, "failed to publish generation"))?;
        staging.disarm();
        sync_dir(&dir)?;
        publish_current(&dir, &generation)?;

        let paths = ArtifactPaths::in_dir(&final_dir);
        tracing::info!(
            generation = %generation,
            records = store.records,
            keys,
            "dataset published"
        );
        Ok(BuildSummary {
            generation,
            store_path: paths.store,
            index_path: paths.index,
            records: store.records,
            keys,
            built_at,
            store,
        })
    }
}

struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove staging directory");
            }
        }
    }
}

fn generation_name() -> Result<String, Error> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("system clock is before the unix epoch")
                .with_source(err)
        })?
        .as_nanos();
    let name = format!("gen-{nanos}-{}", std::process::id());
    debug_assert!(is_generation_name(&name));
    Ok(name)
}

fn now_rfc3339() -> Result<String, Error> {
    OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format build timestamp")
            .with_source(err)
    })
}
