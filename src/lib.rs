// src/lib.rs
pub mod cli;
pub mod config;
pub mod pipelines;
pub mod utils;

pub use cli::{Arguments, Command};
pub use config::defs::{ErrorKind, PipelineError};
pub use config::run::RunConfiguration;
