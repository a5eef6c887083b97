//! Library crate for ollama-scan-rs: resumable discovery, model listing and
//! benchmarking of Ollama inference hosts.
pub mod bench;
pub mod config;
pub mod discovery;
pub mod error;
pub mod probe;
pub mod progress;
pub mod scanner;
pub mod sink;
pub mod state;
pub mod targets;
pub mod types;

pub use error::{Result, ScanError};
