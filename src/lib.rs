//! soupsync - offline-first JSON soups with a resumable sync engine
//!
//! Records are schemaless JSON documents grouped into named soups and stored
//! in SQLite. Declared index paths are projected into real columns so soups
//! can be queried with a small logical SQL dialect. The sync engine moves
//! records between a soup and a remote REST service, tracking local edits
//! with per-record dirty flags.
//!
//! # Architecture
//!
//! - [`store`] - document store, index catalog and logical query compiler
//! - [`model`] - value types (`IndexSpec`, `QuerySpec`, `SyncState`)
//! - [`sync`] - transport, targets, job execution and the sync manager
//! - [`config`] - database location and remote settings
//! - [`cli`] - command-line interface using clap
//! - [`error`] - error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
pub use store::SmartStore;
pub use sync::{SyncManager, SyncManagerRegistry};
