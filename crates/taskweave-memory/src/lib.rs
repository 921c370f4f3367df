//! Durable scratchpad storage.
//!
//! One SQLite-backed implementation of `ScratchpadStore`, holding
//! append-only think/act/observe records per conversation with a size
//! cap and a time-to-live window.

pub mod store;

pub use store::SqliteScratchpad;
