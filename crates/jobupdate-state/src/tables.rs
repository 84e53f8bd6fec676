//! redb table definitions for the job update state store.
//!
//! Records use `&str` keys of the form `{job_id}/{update_id}`. The record
//! body is JSON in `UPDATES`; its compare-and-swap version lives under the
//! same key in `UPDATE_VERSIONS`, and both are written in one transaction.

use redb::TableDefinition;

/// Job update records (key, spec, status) keyed by `{job_id}/{update_id}`.
pub const UPDATES: TableDefinition<&str, &[u8]> = TableDefinition::new("updates");

/// Version token of each record in `UPDATES`.
pub const UPDATE_VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("update_versions");
