//! Persistence layer: periodic JSON snapshots for warm restart, plus an
//! append-only CSV archive.

pub mod archive;
pub mod snapshot;
