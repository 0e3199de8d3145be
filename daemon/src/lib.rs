//! exec-sandbox daemon library
//!
//! This crate provides the execution engine behind the exec-sandbox daemon:
//! - Language registry and toolchain descriptors
//! - Isolation backends (Docker, host fallback) and the sandbox runner
//! - Execution registry, dispatcher and async worker pool
//! - MCP server implementation using rmcp

pub mod backend;
pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod language;
pub mod mcp;
pub mod probe;
pub mod registry;
pub mod runner;
pub mod worker;
