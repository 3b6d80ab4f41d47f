//! Thread execution
//!
//! - `state`: thread record and status transitions
//! - `accumulator`: ordered output log
//! - `runner`: engine that drives threads through their plans
//! - `conductor`: detached per-thread summarizer

mod accumulator;
mod conductor;
mod runner;
mod state;

pub use accumulator::*;
pub use conductor::*;
pub use runner::*;
pub use state::*;
