// Core modules implementing the record store, name index, queries, and errors.
pub mod build;
pub mod dataset;
pub mod diff;
pub mod error;
pub mod format;
pub mod index;
pub mod normalize;
pub mod query;
pub mod record;
pub mod store;
