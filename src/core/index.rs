// Name index: normalized municipality key -> record offsets in write order.
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::format::{INDEX_FORMAT_VERSION, SUPPORTED_INDEX_FORMAT_VERSIONS, index_version_error};
use crate::core::store::{RecordOffset, StoreFingerprint};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NameIndex {
    entries: BTreeMap<String, Vec<RecordOffset>>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `offset` to the list for `key`; per-key order is insertion order.
    pub fn insert(&mut self, key: String, offset: RecordOffset) {
        self.entries.entry(key).or_default().push(offset);
    }

    /// Offsets for `key`, empty when the key is unknown.
    pub fn lookup(&self, key: &str) -> &[RecordOffset] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn offset_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[RecordOffset])> {
        self.entries
            .iter()
            .map(|(key, offsets)| (key.as_str(), offsets.as_slice()))
    }
}

/// Persisted form of a [`NameIndex`], bound to the store it was built from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexArtifact {
    pub format_version: u32,
    pub built_at: String,
    pub store: StoreFingerprint,
    entries: BTreeMap<String, Vec<RecordOffset>>,
}

impl IndexArtifact {
    pub fn new(index: NameIndex, store: StoreFingerprint, built_at: impl Into<String>) -> Self {
        Self {
            format_version: INDEX_FORMAT_VERSION,
            built_at: built_at.into(),
            store,
            entries: index.entries,
        }
    }

    pub fn into_index(self) -> NameIndex {
        NameIndex {
            entries: self.entries,
        }
    }

    /// Writes the artifact and fsyncs it.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .map_err(|err| io_error(err, path, "failed to create index file"))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer(&mut out, self).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write index file")
                .with_path(path)
                .with_source(err)
        })?;
        out.flush()
            .map_err(|err| io_error(err, path, "failed to flush index file"))?;
        let file = out
            .into_inner()
            .map_err(|err| io_error(err.into_error(), path, "failed to flush index file"))?;
        file.sync_all()
            .map_err(|err| io_error(err, path, "failed to sync index file"))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| io_error(err, path, "failed to open index file"))?;
        let artifact: IndexArtifact =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| {
                Error::new(ErrorKind::MalformedRecord)
                    .with_message("index file is not a valid index artifact")
                    .with_path(path)
                    .with_source(err)
            })?;
        if !SUPPORTED_INDEX_FORMAT_VERSIONS.contains(&artifact.format_version) {
            return Err(index_version_error(artifact.format_version).with_path(path));
        }
        Ok(artifact)
    }
}
