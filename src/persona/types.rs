//! Core types for the persona system.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Allowed range for creativity and adherence.
pub const TUNING_RANGE: RangeInclusive<u8> = 1..=10;

const DEFAULT_TUNING: u8 = 5;

// ─────────────────────────────────────────────────────────────────
// Persona
// ─────────────────────────────────────────────────────────────────

/// A named configuration binding a model and its tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Unique persona id; a revision always gets a fresh id.
    pub id: String,

    /// Display name shown in the sequence editor.
    pub nickname: String,

    /// Model the persona runs on (e.g. "mistral:7b", "gpt-4o-txt").
    pub model_ref: String,

    /// Sampling creativity, 1 (deterministic) to 10 (wild).
    pub creativity: u8,

    /// How strictly the persona should follow instructions, 1 to 10.
    pub adherence: u8,

    /// Text prepended to each instruction this persona executes.
    #[serde(default)]
    pub definition: String,

    /// Revision number, starting at 1.
    #[serde(default = "first_version")]
    pub version: u32,

    /// Id of the persona this one was revised from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,

    /// User that authored the persona.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

fn first_version() -> u32 {
    1
}

impl Persona {
    /// Create a persona with default tuning and an empty definition.
    pub fn new(id: impl Into<String>, nickname: impl Into<String>, model_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nickname: nickname.into(),
            model_ref: model_ref.into(),
            creativity: DEFAULT_TUNING,
            adherence: DEFAULT_TUNING,
            definition: String::new(),
            version: first_version(),
            previous_version: None,
            author: None,
        }
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = definition.into();
        self
    }

    pub fn with_tuning(mut self, creativity: u8, adherence: u8) -> Self {
        self.creativity = creativity;
        self.adherence = adherence;
        self
    }

    /// Check field bounds.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::field_invalid("persona.id", "persona id cannot be empty"));
        }
        if self.model_ref.trim().is_empty() {
            return Err(Error::field_invalid(
                "persona.modelRef",
                format!("persona '{}' has no model", self.id),
            ));
        }
        if !TUNING_RANGE.contains(&self.creativity) {
            return Err(Error::field_invalid(
                "persona.creativity",
                format!(
                    "persona '{}' creativity {} is outside 1..=10",
                    self.id, self.creativity
                ),
            ));
        }
        if !TUNING_RANGE.contains(&self.adherence) {
            return Err(Error::field_invalid(
                "persona.adherence",
                format!(
                    "persona '{}' adherence {} is outside 1..=10",
                    self.id, self.adherence
                ),
            ));
        }
        Ok(())
    }

    /// Build the next revision of this persona. The caller picks the new id.
    pub fn revised(&self, new_id: impl Into<String>, update: PersonaUpdate) -> Persona {
        Persona {
            id: new_id.into(),
            nickname: update.nickname.unwrap_or_else(|| self.nickname.clone()),
            model_ref: update.model_ref.unwrap_or_else(|| self.model_ref.clone()),
            creativity: update.creativity.unwrap_or(self.creativity),
            adherence: update.adherence.unwrap_or(self.adherence),
            definition: update.definition.unwrap_or_else(|| self.definition.clone()),
            version: self.version + 1,
            previous_version: Some(self.id.clone()),
            author: self.author.clone(),
        }
    }
}

/// Field changes for a persona revision. `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaUpdate {
    pub nickname: Option<String>,
    pub model_ref: Option<String>,
    pub creativity: Option<u8>,
    pub adherence: Option<u8>,
    pub definition: Option<String>,
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_persona_is_valid() {
        let p = Persona::new("p1", "Scribe", "mistral:7b");
        assert_eq!(p.creativity, 5);
        assert_eq!(p.version, 1);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_tuning_bounds() {
        assert!(Persona::new("p1", "A", "m").with_tuning(0, 5).validate().is_err());
        assert!(Persona::new("p1", "A", "m").with_tuning(11, 5).validate().is_err());
        assert!(Persona::new("p1", "A", "m").with_tuning(5, 0).validate().is_err());
        assert!(Persona::new("p1", "A", "m").with_tuning(1, 10).validate().is_ok());
    }

    #[test]
    fn test_empty_model_rejected() {
        let err = Persona::new("p1", "A", " ").validate().unwrap_err();
        assert!(err.to_string().contains("no model"));
    }

    #[test]
    fn test_revised_links_previous() {
        let p = Persona::new("p1", "Scribe", "mistral:7b").with_definition("You write.");
        let next = p.revised(
            "p1-v2",
            PersonaUpdate {
                creativity: Some(9),
                ..Default::default()
            },
        );
        assert_eq!(next.version, 2);
        assert_eq!(next.previous_version.as_deref(), Some("p1"));
        assert_eq!(next.creativity, 9);
        assert_eq!(next.definition, "You write.");
        assert_eq!(p.creativity, 5);
    }

    #[test]
    fn test_serde_camel_case() {
        let json = r#"{"id":"p1","nickname":"A","modelRef":"llama3.2:3b","creativity":3,"adherence":7}"#;
        let p: Persona = serde_json::from_str(json).unwrap();
        assert_eq!(p.model_ref, "llama3.2:3b");
        assert_eq!(p.version, 1);
        assert!(p.definition.is_empty());
        let out = serde_json::to_string(&p).unwrap();
        assert!(out.contains("\"modelRef\""));
        assert!(!out.contains("previousVersion"));
    }
}
