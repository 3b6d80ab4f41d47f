//! Instruct schemas: the step and loop tree that defines a sequence.
//!
//! - `types`: Step, LoopSegment, Schema and the export document
//! - `draft`: unsaved, editable step lists
//! - `validator`: structural and referential checks
//! - `builder`: validated persistence and versioning
//! - `expander`: loop unrolling into a flat execution plan

mod builder;
mod draft;
mod expander;
mod types;
mod validator;

pub use builder::*;
pub use draft::*;
pub use expander::*;
pub use types::*;
pub use validator::*;
