//! jobupdate-state — durable state for job updates.
//!
//! Backed by [redb](https://docs.rs/redb), stores one record per job update
//! (its key, immutable spec and mutable status). Every write is a
//! compare-and-swap against a per-record version token, so a writer that has
//! lost ownership of a record fails instead of overwriting a newer owner.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns under
//! `{job_id}/{update_id}` keys, which allows prefix scans per job. The
//! [`UpdateStore`] trait is the seam the controller depends on; [`StateStore`]
//! is its redb implementation and is `Clone` + `Send` + `Sync`.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, UpdateStore};
pub use types::*;
