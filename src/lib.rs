//! Uptime and certificate probing service.
//!
//! Library surface behind the `watchpost` binary: config loading,
//! probe implementations, the task host, storage writers and the read
//! API.

pub mod config;
pub mod duration;
pub mod probe;
pub mod proxy;
pub mod scheduler;
pub mod storage;
pub mod web;
