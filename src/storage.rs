//! Durable persistence for container blobs and engine metadata.

pub mod file;
pub mod metadata;
