//! EntDB: a multi-tenant, event-sourced graph store. A durable partitioned
//! log (`stream`) is the source of truth; the `applier` materializes it
//! into per-tenant SQLite-backed `store`s; `archiver` and `snapshotter`
//! provide durability and recovery via `restore`.

pub mod applier;
pub mod archiver;
pub mod compat;
pub mod config;
pub mod error;
pub mod model;
pub mod objectstore;
pub mod registry;
pub mod restore;
pub mod snapshotter;
pub mod store;
pub mod stream;

pub use error::{EntDbError, Result};
