//! sufy - async client engine for Sufy object storage

pub mod config;
pub mod sufy;

pub use config::{ClientConfig, Config};
pub use sufy::{SufyClient, SufyError};
