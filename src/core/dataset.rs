//! Purpose: Dataset directory layout, generation resolution, and build locking.
//! Exports: `ArtifactPaths`, `resolve_current`, `default_data_dir`, `BuildLock`.
//! Role: One source of truth for where a store/index pair lives on disk.
//! Invariants: Readers only ever see fully written generations, via `CURRENT`.
//! Invariants: `CURRENT` is replaced with write-temp + rename, never edited in place.
//! Invariants: Generation names are single path components.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind, io_error};

pub const STORE_FILE: &str = "matriculas.dat";
pub const INDEX_FILE: &str = "index_mun.json";
pub const CURRENT_FILE: &str = "CURRENT";
pub const LOCK_FILE: &str = ".build.lock";
pub(crate) const TMP_PREFIX: &str = ".tmp-";

pub fn default_data_dir() -> PathBuf {
    PathBuf::from("bin_files")
}

/// Location of one store file and the index built from it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactPaths {
    pub store: PathBuf,
    pub index: PathBuf,
}

impl ArtifactPaths {
    pub fn new(store: impl Into<PathBuf>, index: impl Into<PathBuf>) -> Self {
        Self {
            store: store.into(),
            index: index.into(),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STORE_FILE), dir.join(INDEX_FILE))
    }
}

/// Reads `CURRENT` and returns the published generation name and its artifact paths.
pub fn resolve_current(dir: &Path) -> Result<(String, ArtifactPaths), Error> {
    let pointer = dir.join(CURRENT_FILE);
    let raw = fs::read_to_string(&pointer).map_err(|err| {
        io_error(err, &pointer, "no published dataset")
            .with_hint("Run `matriculas build <input>` first, or pass --bin and --index.")
    })?;
    let generation = raw.trim();
    if !is_generation_name(generation) {
        return Err(Error::new(ErrorKind::MalformedRecord)
            .with_message(format!("CURRENT names an invalid generation {generation:?}"))
            .with_path(&pointer));
    }
    let paths = ArtifactPaths::in_dir(&dir.join(generation));
    Ok((generation.to_string(), paths))
}

pub(crate) fn is_generation_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with(TMP_PREFIX)
        && !name.contains(['/', '\\'])
}

/// Atomically points `CURRENT` at `generation`.
pub(crate) fn publish_current(dir: &Path, generation: &str) -> Result<(), Error> {
    let pointer = dir.join(CURRENT_FILE);
    let staged = dir.join(format!("{TMP_PREFIX}{CURRENT_FILE}"));
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&staged)
        .map_err(|err| io_error(err, &staged, "failed to stage CURRENT"))?;
    file.write_all(format!("{generation}\n").as_bytes())
        .map_err(|err| io_error(err, &staged, "failed to write CURRENT"))?;
    file.sync_all()
        .map_err(|err| io_error(err, &staged, "failed to sync CURRENT"))?;
    drop(file);
    fs::rename(&staged, &pointer)
        .map_err(|err| io_error(err, &pointer, "failed to publish CURRENT"))?;
    sync_dir(dir)
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<(), Error> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|err| io_error(err, dir, "failed to sync directory"))
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<(), Error> {
    Ok(())
}

/// Exclusive advisory lock on a dataset directory, held for a whole build pass.
pub struct BuildLock {
    file: File,
}

impl BuildLock {
    pub fn acquire(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(err, &path, "failed to open build lock"))?;
        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("another build holds the dataset lock")
                .with_path(&path)
                .with_hint("Wait for the running build to finish.")
                .with_source(err)
        })?;
        Ok(Self { file })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ArtifactPaths, BuildLock, CURRENT_FILE, INDEX_FILE, STORE_FILE, is_generation_name,
        publish_current, resolve_current,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn current_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        publish_current(dir.path(), "gen-1").expect("publish");
        let (generation, paths) = resolve_current(dir.path()).expect("resolve");
        assert_eq!(generation, "gen-1");
        assert_eq!(paths, ArtifactPaths::in_dir(&dir.path().join("gen-1")));
        assert!(paths.store.ends_with(STORE_FILE));
        assert!(paths.index.ends_with(INDEX_FILE));

        publish_current(dir.path(), "gen-2").expect("republish");
        let (generation, _) = resolve_current(dir.path()).expect("resolve");
        assert_eq!(generation, "gen-2");
    }

    #[test]
    fn missing_current_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = resolve_current(dir.path()).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.hint().is_some());
    }

    #[test]
    fn escaping_current_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CURRENT_FILE), "../elsewhere\n").expect("write");
        let err = resolve_current(dir.path()).expect_err("escape");
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn generation_names_are_single_components() {
        assert!(is_generation_name("gen-1760000000-42"));
        assert!(!is_generation_name(""));
        assert!(!is_generation_name(".."));
        assert!(!is_generation_name("a/b"));
        assert!(!is_generation_name(".tmp-gen-1"));
    }

    #[test]
    fn second_build_lock_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _held = BuildLock::acquire(dir.path()).expect("first lock");
        let err = match BuildLock::acquire(dir.path()) {
            Ok(_) => panic!("expected lock contention"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Io);
    }
}
