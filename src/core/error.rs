// Error kinds and the builder-style error carried across store, index, and query layers.
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Validation,
    NotFound,
    Busy,
    Permission,
    OutOfRange,
    MalformedRecord,
    Mismatch,
    Io,
}

impl ErrorKind {
    /// True for kinds that mean the store and index disagree or the store is damaged.
    pub fn is_integrity(self) -> bool {
        matches!(
            self,
            ErrorKind::OutOfRange | ErrorKind::MalformedRecord | ErrorKind::Mismatch
        )
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    offset: Option<u64>,
    row: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            offset: None,
            row: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn row(&self) -> Option<u64> {
        self.row
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_row(mut self, row: u64) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        if let Some(row) = self.row {
            write!(f, " (row: {row})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage | ErrorKind::Validation => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Busy => 5,
        ErrorKind::Permission => 6,
        ErrorKind::OutOfRange | ErrorKind::MalformedRecord | ErrorKind::Mismatch => 7,
        ErrorKind::Io => 8,
    }
}

/// Maps an I/O failure on `path` to an error, classifying missing files and permissions.
pub(crate) fn io_error(err: std::io::Error, path: &Path, message: &str) -> Error {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, io_error, to_exit_code};
    use std::error::Error as _;
    use std::path::Path;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::Validation, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::Busy, 5),
            (ErrorKind::Permission, 6),
            (ErrorKind::OutOfRange, 7),
            (ErrorKind::MalformedRecord, 7),
            (ErrorKind::Mismatch, 7),
            (ErrorKind::Io, 8),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::OutOfRange)
            .with_message("offset past end of store")
            .with_path("/tmp/matriculas.dat")
            .with_offset(950);
        let text = err.to_string();
        assert!(text.starts_with("OutOfRange: offset past end of store"));
        assert!(text.contains("(path: /tmp/matriculas.dat)"));
        assert!(text.contains("(offset: 950)"));
    }

    #[test]
    fn io_errors_are_classified() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err = io_error(missing, Path::new("x"), "open failed");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.source().is_some());

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(io_error(denied, Path::new("x"), "open").kind(), ErrorKind::Permission);

        let other = std::io::Error::other("disk full");
        assert_eq!(io_error(other, Path::new("x"), "write").kind(), ErrorKind::Io);
    }

    #[test]
    fn integrity_kinds() {
        assert!(ErrorKind::Mismatch.is_integrity());
        assert!(ErrorKind::MalformedRecord.is_integrity());
        assert!(!ErrorKind::Validation.is_integrity());
    }
}
