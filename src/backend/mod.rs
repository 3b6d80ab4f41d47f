//! Backend module for model invocation
//!
//! This module provides the core abstraction for calling models and the
//! implementations the engine can route to.

mod traits;
mod registry;
mod mock;
mod openai;

pub use traits::*;
pub use registry::*;
pub use mock::{MockConfig, MockInvoker};
pub use openai::{OpenAiConfig, OpenAiInvoker};
