//! Purpose: Centralize index artifact versioning and rebuild guidance.
//! Exports: `INDEX_FORMAT_VERSION`, `SUPPORTED_INDEX_FORMAT_VERSIONS`, `index_version_error`.
//! Role: Shared policy for gating on-disk compatibility when loading an index artifact.
//! Invariants: Version list is additive; bump only for incompatible artifact changes.
//! Invariants: The record layout itself is fixed; a layout change is a new version too.

use crate::core::error::{Error, ErrorKind};

pub const INDEX_FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_INDEX_FORMAT_VERSIONS: &[u32] = &[INDEX_FORMAT_VERSION];

pub fn index_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_INDEX_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Usage)
        .with_message(format!(
            "unsupported index format version {detected} (supported: {supported})"
        ))
        .with_hint("Rebuild the dataset with `matriculas build <input>`.")
}
