//! Simphoni instruct-sequence engine.
//!
//! Schemas of instructions and loops are expanded into flat execution plans
//! and run step by step against persona-configured models:
//!
//! - [`persona`], [`schema`]: the records a sequence is built from
//! - [`access`]: who may see or run a record
//! - [`executor`]: threads, the execution engine and the conductor summarizer
//! - [`backend`]: model invokers (OpenAI-compatible HTTP, mock, routing)
//! - [`storage`]: document stores for every persisted record
//!
//! [`config`], [`logging`], [`cli`] and [`version`] back the `simphoni` binary.

pub mod access;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod persona;
pub mod schema;
pub mod storage;
pub mod version;

pub use error::{Error, Result};
