//! Core crate for the stillframe render service: HTML + audio in, a
//! single-frame MP4 out.

pub mod assets;
pub mod config;
pub mod encode;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod render;
pub mod runtime;
pub mod scratch;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;
