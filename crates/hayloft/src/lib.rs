//! Hayloft - an append-only needle/volume storage engine.
//!
//! This crate provides the storage core of a photo/blob store: opaque
//! binary payloads keyed by a 64-bit identifier, persisted in large
//! append-only "super block" files and retrieved with a single positioned
//! read.
//!
//! # Components
//!
//! - [`Volume`]: one super block + one index file + the in-memory needle
//!   cache, with background tasks for index persistence and deferred
//!   deletion
//! - [`block::SuperBlock`]: the append-only data file of needle records
//! - [`index::Indexer`]: the secondary index file and its async writer
//! - [`needle`]: the pure needle record codec and the packed cache entry
//!
//! # Example
//!
//! ```rust,ignore
//! use hayloft::Volume;
//!
//! let volume = Volume::open(1, "/data/1.blk", "/data/1.idx")?;
//!
//! volume.add(key, cookie, &photo)?;
//!
//! let mut scratch = Vec::new();
//! let data = volume.get(key, cookie, &mut scratch)?;
//!
//! volume.del(key)?;
//! ```
//!
//! Durability favors throughput: interactive writes reach the data file
//! immediately but are fsynced lazily, and the index trails the data file
//! by design. Recovery reconciles the two by replaying the index and then
//! scanning the data file forward from the last indexed record.

#![deny(missing_docs)]

pub mod block;
pub mod error;
pub mod index;
pub mod needle;
pub mod volume;

pub use error::{Result, StoreError};
pub use volume::{Volume, VolumeOptions, VolumeWriter};
