//! Persona registry, the set of personas known to a caller.
//!
//! Holds every persona revision side by side so schemas saved against an older
//! revision keep resolving. Persona arrays are loaded and saved as a whole,
//! either through a [`DocumentStore`] or from a JSON file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{collections, list_records, save_record, DocumentStore};

use super::types::{Persona, PersonaUpdate};

/// Registry of personas keyed by id.
#[derive(Default)]
pub struct PersonaRegistry {
    personas: RwLock<HashMap<String, Persona>>,
}

impl PersonaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a persona array, validating each entry.
    pub fn from_personas(personas: impl IntoIterator<Item = Persona>) -> Result<Self> {
        let registry = Self::new();
        for persona in personas {
            registry.register(persona)?;
        }
        Ok(registry)
    }

    /// Add a persona. Ids must be unique.
    pub fn register(&self, persona: Persona) -> Result<()> {
        persona.validate()?;
        let mut personas = self.personas.write();
        if personas.contains_key(&persona.id) {
            return Err(Error::field_invalid(
                "persona.id",
                format!("duplicate persona id '{}'", persona.id),
            ));
        }
        debug!(persona_id = %persona.id, model = %persona.model_ref, "Persona registered");
        personas.insert(persona.id.clone(), persona);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Persona> {
        self.personas.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.personas.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.personas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All personas ordered by nickname, then version.
    pub fn list(&self) -> Vec<Persona> {
        let mut all: Vec<Persona> = self.personas.read().values().cloned().collect();
        all.sort_by(|a, b| {
            a.nickname
                .cmp(&b.nickname)
                .then(a.version.cmp(&b.version))
                .then(a.id.cmp(&b.id))
        });
        all
    }

    /// Create a new revision of a persona. The original stays registered.
    pub fn revise(&self, id: &str, update: PersonaUpdate) -> Result<Persona> {
        let current = self
            .get(id)
            .ok_or_else(|| Error::not_found(collections::PERSONAS, id))?;
        let next = current.revised(Uuid::new_v4().to_string(), update);
        self.register(next.clone())?;
        info!(
            persona_id = %next.id,
            previous = %current.id,
            version = next.version,
            "Persona revised"
        );
        Ok(next)
    }

    // ─────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────

    /// Load a persona array from a JSON file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let personas: Vec<Persona> = serde_json::from_str(&content)?;
        info!(path = %path.display(), count = personas.len(), "Persona array loaded");
        Self::from_personas(personas)
    }

    /// Load every persona in the store.
    pub async fn load_from_store(store: &dyn DocumentStore) -> Result<Self> {
        let personas: Vec<Persona> = list_records(store, collections::PERSONAS).await?;
        Self::from_personas(personas)
    }

    /// Save every persona to the store.
    pub async fn save_to_store(&self, store: &dyn DocumentStore) -> Result<()> {
        for persona in self.list() {
            save_record(store, collections::PERSONAS, &persona.id, &persona).await?;
        }
        Ok(())
    }
}
