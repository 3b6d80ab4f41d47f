//! Schema data model
//!
//! All records serialize to camelCase JSON, the shape stored in the document
//! store and used by the export/import format.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────
// Access Level
// ─────────────────────────────────────────────────────────────────

/// Visibility policy of a schema or thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Owner only
    #[default]
    Private,
    /// Owner plus a named allow-list
    Exclusive,
    /// Any authenticated user
    Public,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "Private",
            AccessLevel::Exclusive => "Exclusive",
            AccessLevel::Public => "Public",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(AccessLevel::Private),
            "exclusive" => Ok(AccessLevel::Exclusive),
            "public" => Ok(AccessLevel::Public),
            _ => Err(format!(
                "Unknown access level '{}'. Valid: Private, Exclusive, Public",
                s
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Steps
// ─────────────────────────────────────────────────────────────────

/// Opaque reference to an attached file or image blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentRef(pub String);

/// A single instruction executed by one persona
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructStep {
    pub id: String,
    pub order: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<AttachmentRef>,
}

impl InstructStep {
    pub fn new(id: impl Into<String>, order: u32, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order,
            text: text.into(),
            persona_id: None,
            tool: None,
            attachment_ref: None,
        }
    }

    pub fn with_persona(mut self, persona_id: impl Into<String>) -> Self {
        self.persona_id = Some(persona_id.into());
        self
    }
}

/// A block of steps repeated `iterations` times
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSegment {
    pub id: String,
    pub order: u32,
    pub iterations: u32,
    #[serde(default)]
    pub children: Vec<Step>,
}

impl LoopSegment {
    /// New loops repeat twice unless told otherwise.
    pub const DEFAULT_ITERATIONS: u32 = 2;

    pub fn new(id: impl Into<String>, order: u32, iterations: u32) -> Self {
        Self {
            id: id.into(),
            order,
            iterations,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, step: impl Into<Step>) -> Self {
        self.children.push(step.into());
        self
    }
}

/// One unit of work in a sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Step {
    Instruct(InstructStep),
    Loop(LoopSegment),
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Instruct(s) => &s.id,
            Step::Loop(l) => &l.id,
        }
    }

    pub fn order(&self) -> u32 {
        match self {
            Step::Instruct(s) => s.order,
            Step::Loop(l) => l.order,
        }
    }
}

impl From<InstructStep> for Step {
    fn from(step: InstructStep) -> Self {
        Step::Instruct(step)
    }
}

impl From<LoopSegment> for Step {
    fn from(segment: LoopSegment) -> Self {
        Step::Loop(segment)
    }
}

/// Steps of a list sorted by `order`; ties keep their list position.
pub fn in_order(steps: &[Step]) -> Vec<&Step> {
    let mut sorted: Vec<&Step> = steps.iter().collect();
    sorted.sort_by_key(|s| s.order());
    sorted
}

// ─────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────

/// A saved, named sequence of steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub allowed_users: BTreeSet<String>,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "first_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
}

fn first_version() -> u32 {
    1
}

impl Schema {
    /// Export to the portable document format
    pub fn export(&self) -> SchemaDocument {
        SchemaDocument {
            name: self.name.clone(),
            steps: self.steps.clone(),
            owner: self.owner.clone(),
            access_level: self.access_level,
            allowed_users: self.allowed_users.clone(),
        }
    }

    /// Look up a step anywhere in the tree
    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        find_in(&self.steps, step_id)
    }
}

pub(crate) fn find_in<'a>(steps: &'a [Step], step_id: &str) -> Option<&'a Step> {
    for step in steps {
        if step.id() == step_id {
            return Some(step);
        }
        if let Step::Loop(l) = step {
            if let Some(found) = find_in(&l.children, step_id) {
                return Some(found);
            }
        }
    }
    None
}

/// Portable schema document used for export and import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDocument {
    pub name: String,
    pub steps: Vec<Step>,
    pub owner: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub allowed_users: BTreeSet<String>,
}

impl SchemaDocument {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
