// Record store file: sequential appends during a build, bounds-checked mmap reads afterwards.
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::record::{RECORD_SIZE, Record};

/// Byte position of a record inside a store file.
///
/// Offsets are only produced by [`StoreWriter::append`] or loaded from an index
/// artifact, and only dereferenced through [`RecordStore::read_at`], which checks
/// them against the file bounds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordOffset(u64);

impl RecordOffset {
    pub(crate) fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a store file, recorded in the index built from it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoreFingerprint {
    pub len: u64,
    pub records: u64,
    pub sha256: String,
}

pub struct StoreWriter {
    path: PathBuf,
    out: BufWriter<File>,
    hasher: Sha256,
    len: u64,
    records: u64,
}

impl StoreWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(err, &path, "failed to create store file"))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            hasher: Sha256::new(),
            len: 0,
            records: 0,
        })
    }

    /// Writes `record` at the current end of the store and returns where it landed.
    pub fn append(&mut self, record: &Record) -> Result<RecordOffset, Error> {
        let buf = record.encode();
        self.out
            .write_all(&buf)
            .map_err(|err| io_error(err, &self.path, "failed to append record"))?;
        self.hasher.update(buf);
        let offset = RecordOffset::new(self.len);
        self.len += RECORD_SIZE as u64;
        self.records += 1;
        Ok(offset)
    }

    /// Flushes and fsyncs the file, sealing it.
    pub fn finish(self) -> Result<StoreFingerprint, Error> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|err| io_error(err.into_error(), &path, "failed to flush store file"))?;
        file.sync_all()
            .map_err(|err| io_error(err, &path, "failed to sync store file"))?;
        Ok(StoreFingerprint {
            len: self.len,
            records: self.records,
            sha256: hex_digest(self.hasher),
        })
    }
}

/// Sealed, read-only store. One memory map is held for the store's lifetime and
/// shared by every reader; reads never mutate state.
pub struct RecordStore {
    path: PathBuf,
    // Zero-length files cannot be mapped.
    map: Option<Mmap>,
}

impl RecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file =
            File::open(&path).map_err(|err| io_error(err, &path, "failed to open store file"))?;
        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| io_error(err, &path, "failed to stat store file"))?;

        let map = if len == 0 {
            None
        } else {
            // SAFETY: published store files are never modified in place; rebuilds
            // write a fresh generation and swap the CURRENT pointer.
            let map = unsafe {
                Mmap::map(&file).map_err(|err| io_error(err, &path, "failed to map store file"))?
            };
            Some(map)
        };
        tracing::debug!(path = %path.display(), len, "opened record store");
        Ok(Self { path, map })
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_count(&self) -> u64 {
        self.len() / RECORD_SIZE as u64
    }

    /// Bytes past the last whole record; non-zero means a torn or foreign file.
    pub fn trailing_bytes(&self) -> u64 {
        self.len() % RECORD_SIZE as u64
    }

    pub fn read_at(&self, offset: RecordOffset) -> Result<Record, Error> {
        let bytes = self.bytes();
        let start = offset.get();
        let end = start.checked_add(RECORD_SIZE as u64);
        let Some(end) = end.filter(|end| *end <= bytes.len() as u64) else {
            return Err(Error::new(ErrorKind::OutOfRange)
                .with_message(format!(
                    "record at offset {start} extends past end of store ({} bytes)",
                    bytes.len()
                ))
                .with_path(&self.path)
                .with_offset(start)
                .with_hint("The index does not belong to this store; rebuild the dataset."));
        };
        Record::decode(&bytes[start as usize..end as usize])
            .map_err(|err| err.with_path(&self.path).with_offset(start))
    }

    /// Every whole record in file order.
    pub fn records(&self) -> impl Iterator<Item = (RecordOffset, Result<Record, Error>)> + '_ {
        (0..self.record_count()).map(move |index| {
            let offset = RecordOffset::new(index * RECORD_SIZE as u64);
            (offset, self.read_at(offset))
        })
    }

    pub fn fingerprint(&self) -> StoreFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes());
        StoreFingerprint {
            len: self.len(),
            records: self.record_count(),
            sha256: hex_digest(hasher),
        }
    }

    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{RecordOffset, RecordStore, StoreWriter};
    use crate::core::error::ErrorKind;
    use crate::core::record::{RECORD_SIZE, Record, Sex};
    use std::fs::OpenOptions;
    use std::io::Write;

    fn record(name: &str, year: u16, quantity: f64) -> Record {
        Record {
            ibge: 4300000 + u32::from(year),
            year,
            sex: Sex::Male,
            quantity,
            municipio: name.to_string(),
            latitude: -29.5,
            longitude: -53.1,
        }
    }

    #[test]
    fn append_returns_increasing_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("matriculas.dat");
        let mut writer = StoreWriter::create(&path).expect("create");
        let first = writer.append(&record("Canoas", 2020, 10.0)).expect("append");
        let second = writer.append(&record("Canoas", 2021, 12.0)).expect("append");
        assert_eq!(first.get(), 0);
        assert_eq!(second.get(), RECORD_SIZE as u64);
        let fingerprint = writer.finish().expect("finish");
        assert_eq!(fingerprint.records, 2);
        assert_eq!(fingerprint.len, 2 * RECORD_SIZE as u64);

        let store = RecordStore::open(&path).expect("open");
        assert_eq!(store.read_at(second).expect("read"), record("Canoas", 2021, 12.0));
        assert_eq!(store.fingerprint(), fingerprint);
    }

    #[test]
    fn read_past_end_is_out_of_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("matriculas.dat");
        let mut writer = StoreWriter::create(&path).expect("create");
        writer.append(&record("Pelotas", 2020, 1.0)).expect("append");
        writer.finish().expect("finish");

        let store = RecordStore::open(&path).expect("open");
        let err = store
            .read_at(RecordOffset::new(1))
            .expect_err("partial record");
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(err.offset(), Some(1));

        let err = store
            .read_at(RecordOffset::new(u64::MAX))
            .expect_err("overflowing offset");
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn corrupt_bytes_surface_as_malformed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("matriculas.dat");
        let mut raw = record("Pelotas", 2020, 1.0).encode();
        raw[6] = 0;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .expect("create");
        file.write_all(&raw).expect("write");
        drop(file);

        let store = RecordStore::open(&path).expect("open");
        let err = store.read_at(RecordOffset::new(0)).expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
        assert_eq!(err.offset(), Some(0));
    }

    #[test]
    fn empty_store_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("matriculas.dat");
        StoreWriter::create(&path).expect("create").finish().expect("finish");
        let store = RecordStore::open(&path).expect("open");
        assert!(store.is_empty());
        assert_eq!(store.records().count(), 0);
        let err = store.read_at(RecordOffset::new(0)).expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn missing_store_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = match RecordStore::open(dir.path().join("absent.dat")) {
            Ok(_) => panic!("expected missing store error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn store_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RecordStore>();
    }
}
