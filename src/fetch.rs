//! Backend fetch pipeline: throttle decisions, the HTTP call, and backoff.

pub mod backoff;
pub mod client;
pub mod handler;
