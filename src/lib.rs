//! MarFS core engine.
//!
//! MarFS presents a scalable near-POSIX filesystem by keeping metadata in
//! a conventional POSIX-style tree (the MDFS) while file contents live in
//! object storage. This crate is the engine between those two worlds:
//!
//! * [`format`] — the object-ID grammar, the `Pre`/`Post`/`Restart` xattr
//!   value strings, per-chunk binary records, and the recovery footer that
//!   lets metadata be rebuilt from object contents alone.
//! * [`mdal`] / [`dal`] — pluggable metadata and data abstraction layers.
//!   The shipped reference backends are POSIX-on-a-secure-root and
//!   semi-direct (objects as files), plus an in-memory test double.
//! * [`resolve`] — namespace resolution, permission gating, quota checks,
//!   write-repo selection.
//! * [`handle`] — the per-open read/write state machines: chunk spanning,
//!   recovery-info insertion, N:1 ingest alignment, packed-object ingest,
//!   and the queue discipline for NFS-style concurrent readers.
//! * [`fs`] — the user-facing operation surface the fuse/pftool front-ends
//!   call into, including trash-on-unlink.
//! * [`gc`] / [`repack`] — trash reclamation: scan, classify, delete via a
//!   bounded worker pool, reconcile packed objects, and densify packed
//!   objects that outlive most of their members.
//!
//! Front-ends (the FUSE binding, pftool, the S3/sproxyd wire adapters) sit
//! outside this crate and talk to it through `fs::Marfs` and the two
//! abstraction layers.

pub mod error;
pub use error::{Error, Result};

pub mod config;

pub mod format;

pub mod mdal;

pub mod dal;

pub mod resolve;

pub mod handle;

pub mod fs;

pub mod gc;

pub mod repack;
