//! jsjail - disposable V8 sandbox for benchmark agents
//!
//! This crate provides:
//! - Sandbox core: isolate lifecycle, capability modules, execution controller
//! - Trusted helper loading
//! - A `run_code` tool for model tool-calling loops
//! - Configuration and CLI

pub mod cli;
pub mod config;
pub mod paths;
pub mod sandbox;
pub mod tools;

pub use config::Config;
pub use sandbox::{ExecuteOptions, Executor, SandboxError};
