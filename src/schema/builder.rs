//! Schema persistence
//!
//! [`SchemaBuilder`] is the only way a schema reaches the store. It validates
//! first, writes second, and never rewrites a saved record: edits become a new
//! version with a link back to the one they replace.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::access::{partition, require_owner, require_view, SchemaBuckets, UserDirectory};
use crate::error::{Error, Result};
use crate::persona::PersonaRegistry;
use crate::storage::{collections, get_record, list_records, save_record, DocumentStore};

use super::draft::SchemaDraft;
use super::types::{AccessLevel, Schema, SchemaDocument, Step};
use super::validator::{SchemaLimits, SchemaValidator};

/// What the save dialog collects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSchemaRequest {
    pub name: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub allowed_user_emails: Vec<String>,
}

impl SaveSchemaRequest {
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access_level: AccessLevel::Private,
            allowed_user_emails: Vec::new(),
        }
    }
}

/// Validating front door to the `schemas` collection
pub struct SchemaBuilder {
    validator: SchemaValidator,
    store: Arc<dyn DocumentStore>,
    directory: Arc<dyn UserDirectory>,
}

impl SchemaBuilder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn UserDirectory>,
        limits: SchemaLimits,
    ) -> Self {
        Self {
            validator: SchemaValidator::new(limits),
            store,
            directory,
        }
    }

    pub fn validator(&self) -> &SchemaValidator {
        &self.validator
    }

    /// Validate and persist a draft as a new schema owned by `owner`.
    pub async fn save(
        &self,
        owner: &str,
        draft: &SchemaDraft,
        request: &SaveSchemaRequest,
        personas: &PersonaRegistry,
    ) -> Result<Schema> {
        let allowed = self.resolve_emails(&request.allowed_user_emails)?;
        let schema = new_schema(
            owner,
            &request.name,
            request.access_level,
            allowed,
            draft.steps().to_vec(),
        )?;
        self.persist(schema, personas).await
    }

    /// Persist an imported document as a new schema owned by the importer.
    pub async fn import(
        &self,
        owner: &str,
        document: SchemaDocument,
        personas: &PersonaRegistry,
    ) -> Result<Schema> {
        let schema = new_schema(
            owner,
            &document.name,
            document.access_level,
            document.allowed_users,
            document.steps,
        )?;
        self.persist(schema, personas).await
    }

    /// Save edited steps as the next version of an existing schema.
    ///
    /// Only the owner may do this. The stored original is left untouched.
    pub async fn save_new_version(
        &self,
        requester: &str,
        schema_id: &str,
        draft: &SchemaDraft,
        personas: &PersonaRegistry,
    ) -> Result<Schema> {
        let current: Schema = get_record(self.store.as_ref(), collections::SCHEMAS, schema_id).await?;
        require_owner(requester, &current, &format!("schema '{}'", schema_id))?;

        let next = Schema {
            id: Uuid::new_v4().to_string(),
            steps: draft.steps().to_vec(),
            created_at: Utc::now(),
            version: current.version + 1,
            previous_version: Some(current.id.clone()),
            ..current
        };
        self.persist(next, personas).await
    }

    /// Fetch a schema through the access gate
    pub async fn load(&self, requester: Option<&str>, schema_id: &str) -> Result<Schema> {
        let schema: Schema = get_record(self.store.as_ref(), collections::SCHEMAS, schema_id).await?;
        require_view(requester, &schema, &format!("schema '{}'", schema_id))?;
        Ok(schema)
    }

    /// Every schema the requester can see, bucketed
    pub async fn list_visible(&self, requester: Option<&str>) -> Result<SchemaBuckets> {
        let all: Vec<Schema> = list_records(self.store.as_ref(), collections::SCHEMAS).await?;
        Ok(partition(requester, all))
    }

    async fn persist(&self, schema: Schema, personas: &PersonaRegistry) -> Result<Schema> {
        self.validator.validate(
            &schema.name,
            &schema.steps,
            schema.access_level,
            &schema.allowed_users,
            personas,
        )?;
        save_record(self.store.as_ref(), collections::SCHEMAS, &schema.id, &schema).await?;
        info!(
            schema_id = %schema.id,
            owner = %schema.owner,
            version = schema.version,
            access = %schema.access_level,
            "Schema saved"
        );
        Ok(schema)
    }

    fn resolve_emails(&self, emails: &[String]) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for email in emails.iter().filter(|e| !e.trim().is_empty()) {
            let id = self.directory.resolve_email(email).ok_or_else(|| {
                Error::field_invalid("allowedUserEmails", format!("no user with email '{}'", email.trim()))
            })?;
            debug!(email = %email.trim(), user_id = %id, "Resolved allowed user");
            ids.insert(id);
        }
        Ok(ids)
    }
}

fn new_schema(
    owner: &str,
    name: &str,
    access_level: AccessLevel,
    allowed_users: BTreeSet<String>,
    steps: Vec<Step>,
) -> Result<Schema> {
    if owner.trim().is_empty() {
        return Err(Error::auth("sign in to save a schema"));
    }
    Ok(Schema {
        id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        owner: owner.to_string(),
        access_level,
        allowed_users,
        steps,
        created_at: Utc::now(),
        version: 1,
        previous_version: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticDirectory;
    use crate::persona::Persona;
    use crate::schema::{InstructStep, LoopSegment};
    use crate::storage::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, SchemaBuilder, PersonaRegistry) {
        let store = Arc::new(MemoryStore::new());
        let directory = StaticDirectory::new()
            .with_user("ada@example.com", "u-ada")
            .with_user("bob@example.com", "u-bob");
        let builder = SchemaBuilder::new(store.clone(), Arc::new(directory), SchemaLimits::default());
        let personas =
            PersonaRegistry::from_personas(vec![Persona::new("p1", "Bard", "mistral:7b")]).unwrap();
        (store, builder, personas)
    }

    fn draft() -> SchemaDraft {
        SchemaDraft::from_steps(vec![
            InstructStep::new("s1", 0, "Open").with_persona("p1").into(),
            LoopSegment::new("l1", 1, 2)
                .with_child(InstructStep::new("s2", 0, "Refine"))
                .into(),
        ])
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, builder, personas) = setup();
        let saved = builder
            .save("owner", &draft(), &SaveSchemaRequest::private("Story"), &personas)
            .await
            .unwrap();
        assert_eq!(store.count(collections::SCHEMAS), 1);

        let loaded = builder.load(Some("owner"), &saved.id).await.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.steps, draft().into_steps());
    }

    #[tokio::test]
    async fn test_invalid_schema_not_persisted() {
        let (store, builder, personas) = setup();
        let bad = SchemaDraft::from_steps(vec![InstructStep::new("s1", 0, "x")
            .with_persona("ghost")
            .into()]);
        let err = builder
            .save("owner", &bad, &SaveSchemaRequest::private("Bad"), &personas)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.count(collections::SCHEMAS), 0);
    }

    #[tokio::test]
    async fn test_exclusive_resolves_emails() {
        let (_, builder, personas) = setup();
        let request = SaveSchemaRequest {
            name: "Shared".into(),
            access_level: AccessLevel::Exclusive,
            allowed_user_emails: vec!["ADA@example.com".into()],
        };
        let saved = builder.save("owner", &draft(), &request, &personas).await.unwrap();
        assert!(saved.allowed_users.contains("u-ada"));

        assert!(builder.load(Some("u-ada"), &saved.id).await.is_ok());
        let err = builder.load(Some("u-bob"), &saved.id).await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[tokio::test]
    async fn test_unknown_email_and_empty_allow_list() {
        let (_, builder, personas) = setup();
        let unknown = SaveSchemaRequest {
            name: "Shared".into(),
            access_level: AccessLevel::Exclusive,
            allowed_user_emails: vec!["eve@example.com".into()],
        };
        assert!(builder.save("owner", &draft(), &unknown, &personas).await.is_err());

        let empty = SaveSchemaRequest {
            name: "Shared".into(),
            access_level: AccessLevel::Exclusive,
            allowed_user_emails: vec![],
        };
        assert!(builder.save("owner", &draft(), &empty, &personas).await.is_err());
    }

    #[tokio::test]
    async fn test_save_new_version_keeps_original() {
        let (store, builder, personas) = setup();
        let v1 = builder
            .save("owner", &draft(), &SaveSchemaRequest::private("Story"), &personas)
            .await
            .unwrap();

        let mut edited = draft();
        edited.remove_step("l1").unwrap();
        let v2 = builder
            .save_new_version("owner", &v1.id, &edited, &personas)
            .await
            .unwrap();

        assert_ne!(v2.id, v1.id);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous_version.as_deref(), Some(v1.id.as_str()));
        assert_eq!(v2.name, "Story");
        assert_eq!(store.count(collections::SCHEMAS), 2);
        assert_eq!(builder.load(Some("owner"), &v1.id).await.unwrap().steps.len(), 2);
    }

    #[tokio::test]
    async fn test_save_new_version_owner_only() {
        let (_, builder, personas) = setup();
        let v1 = builder
            .save("owner", &draft(), &SaveSchemaRequest::private("Story"), &personas)
            .await
            .unwrap();
        let err = builder
            .save_new_version("u-bob", &v1.id, &draft(), &personas)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[tokio::test]
    async fn test_import_roundtrip() {
        let (_, builder, personas) = setup();
        let v1 = builder
            .save("owner", &draft(), &SaveSchemaRequest::private("Story"), &personas)
            .await
            .unwrap();
        let json = v1.export().to_json().unwrap();

        let imported = builder
            .import("owner", SchemaDocument::from_json(&json).unwrap(), &personas)
            .await
            .unwrap();
        assert_eq!(imported.steps, v1.steps);
        assert_eq!(imported.name, v1.name);
        assert_ne!(imported.id, v1.id);
    }

    #[tokio::test]
    async fn test_list_visible() {
        let (_, builder, personas) = setup();
        builder
            .save("owner", &draft(), &SaveSchemaRequest::private("Mine"), &personas)
            .await
            .unwrap();
        let public = SaveSchemaRequest {
            name: "Open".into(),
            access_level: AccessLevel::Public,
            allowed_user_emails: vec![],
        };
        builder.save("u-bob", &draft(), &public, &personas).await.unwrap();

        let buckets = builder.list_visible(Some("owner")).await.unwrap();
        assert_eq!(buckets.owned.len(), 1);
        assert_eq!(buckets.public.len(), 1);
        assert!(buckets.shared.is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_save_rejected() {
        let (_, builder, personas) = setup();
        let err = builder
            .save("", &draft(), &SaveSchemaRequest::private("Story"), &personas)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }
}
