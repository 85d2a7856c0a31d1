//! bindrop server library.
//!
//! bindrop pulls a container image, finds its release binary plus checksum
//! and signature in the payload layer, renames them after the image's
//! release tag, and serves them over HTTP.
//!
//! ```text
//! POST /create ──> ContentService ──> Registry (resolve, pull layers)
//!                      │                  │
//!                      │              extract (image.tar -> layer -> artifacts)
//!                      ▼
//!              LruTtlCache<release, content hash>
//! GET /{tag}/{name} ──> base_path/<hash>/<name>
//! ```
//!
//! The crate ships the `bindrop` binary and exposes its modules for
//! integration testing.

pub mod api;
pub mod config;
pub mod extract;
pub mod janitor;
pub mod registry;
pub mod service;
pub mod state;
