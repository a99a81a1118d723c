//! Realtime config-update stream: listener registry, the long-lived stream
//! task, and the version-chasing autofetch controller.

pub mod autofetch;
pub mod controller;
pub mod stream;
