//! Core crate for graphcap: batch caption queue, media server, provider
//! catalogue and the HTTP surface over them.

pub mod batch;
pub mod config;
pub mod gallery;
pub mod logging;
pub mod media;
pub mod providers;
pub mod server;
