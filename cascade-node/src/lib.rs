//! `cascade-node`: a thin process entry point wiring a pool directory,
//! one or more shards, and OCDPO dispatch behind a minimal operational
//! CLI (put/get/create-pool/serve), for manual exercising and smoke
//! testing of the `cascade` library.

pub mod config;
pub mod node;
pub mod trace;

