//! Purpose: Define the public Rust API boundary for matriculas.
//! Exports: The query service, query/report types, and validation reports.
//! Role: Additive-only surface used by the CLI, the HTTP server, and tests.
//! Invariants: Callers query through `QueryService`; store and index stay paired.
//! Invariants: Build-phase types are exposed so ingest can drive a build.

mod service;
mod validation;

pub use crate::core::build::{BuildSummary, DatasetBuilder};
pub use crate::core::dataset::{ArtifactPaths, default_data_dir, resolve_current};
pub use crate::core::diff::{DiffQuery, DiffReport, ZERO_BASE_GROWTH_PCT};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::normalize::{normalize, normalize_opt};
pub use crate::core::query::{DEFAULT_PAGE_SIZE, SearchPage, SearchQuery};
pub use crate::core::record::{Record, Sex};
pub use service::{DatasetInfo, QueryService, validate_pair};
pub use validation::{ValidationIssue, ValidationReport, ValidationStatus};
