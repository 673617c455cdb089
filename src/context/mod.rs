//! Context packets for ACM runs.
//!
//! A [`Context`] is the immutable bundle of facts and promoted artifacts a
//! plan executes against, content-addressed by [`Context::context_ref`].
//! Mutation is copy-on-write: promoting an artifact yields a *new* context
//! with a new ref, and the old one stays valid for audit.

mod canonical;
mod types;

pub use canonical::{canonical_bytes, hash_value, sha256_hex};
pub use types::{Artifact, Context, Goal};
