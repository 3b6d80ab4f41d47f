//! Persona system: named model bindings with tuning parameters.
//!
//! A persona pins a model reference, a creativity and adherence setting and a
//! free-text definition that is prepended to every instruction it executes.
//! Personas referenced by a saved schema are never edited in place; a revision
//! produces a new persona record linked to its predecessor.

pub mod registry;
pub mod types;

pub use registry::PersonaRegistry;
pub use types::{Persona, PersonaUpdate, TUNING_RANGE};
