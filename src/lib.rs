//! Purpose: Library crate behind the `matriculas` CLI, server, and tests.
//! Exports: `api` (query service surface), `core` (store, index, queries, errors), `notice`.
//! Role: Enrollment dataset engine; the binary is a thin layer over `api`.
//! Invariants: Query-phase values are immutable and shareable across threads.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod notice;
