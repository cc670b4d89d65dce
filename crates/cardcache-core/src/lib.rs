//! cardcache core library: a content-addressable processing cache for
//! scanned postal cards and stamps.
//!
//! An upload is identified by the SHA-256 of its bytes plus the role the
//! user declared for it. The catalog keeps one entry per identity, the
//! processing store at most one record per entry, and the artifact store
//! the durable crops those records point at. Cropping, AI extraction and
//! face/verso combination are supplied by the host through the traits in
//! [`collaborators`].

pub mod artifacts;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod identity;
pub mod models;
pub mod reconstruct;
pub mod store;

pub use cache::{ProcessingCache, Upload, UploadOutcome, UploadStatus};
pub use config::CacheConfig;
pub use errors::{CacheError, CacheResult};
pub use identity::ContentHash;
pub use reconstruct::{CancelFlag, SessionUploads};
