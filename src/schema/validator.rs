//! Schema validation
//!
//! Every candidate schema passes through [`SchemaValidator`] before it is
//! persisted. A rejected schema is never partially saved.

use std::collections::{BTreeSet, HashSet};

use crate::error::{Error, Result};
use crate::persona::PersonaRegistry;

use super::types::{AccessLevel, Step};

/// Size limits applied to a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaLimits {
    /// Maximum number of top-level steps
    pub max_steps: usize,
    /// Maximum iterations of a single loop
    pub max_loop_iterations: u32,
    /// Maximum length of the expanded plan
    pub max_plan_steps: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_steps: 16,
            max_loop_iterations: 100,
            max_plan_steps: 1000,
        }
    }
}

/// Structural and referential checks for schemas
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    limits: SchemaLimits,
}

impl SchemaValidator {
    pub fn new(limits: SchemaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> SchemaLimits {
        self.limits
    }

    /// Validate a full candidate: name, steps and access policy.
    pub fn validate(
        &self,
        name: &str,
        steps: &[Step],
        access_level: AccessLevel,
        allowed_users: &BTreeSet<String>,
        personas: &PersonaRegistry,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::field_invalid("name", "schema name cannot be empty"));
        }
        self.validate_steps(steps, personas)?;
        validate_access(access_level, allowed_users)
    }

    /// Validate a step tree on its own
    pub fn validate_steps(&self, steps: &[Step], personas: &PersonaRegistry) -> Result<()> {
        if steps.len() > self.limits.max_steps {
            return Err(Error::field_invalid(
                "steps",
                format!(
                    "schema has {} steps, the maximum is {}",
                    steps.len(),
                    self.limits.max_steps
                ),
            ));
        }

        let mut seen_ids = HashSet::new();
        check_list(steps, &mut seen_ids, personas)?;

        let mut plan_len: usize = 0;
        for step in steps {
            match step {
                Step::Instruct(_) => plan_len += 1,
                Step::Loop(segment) => {
                    if segment.iterations == 0 {
                        return Err(Error::field_invalid(
                            "iterations",
                            format!("loop '{}' must run at least once", segment.id),
                        ));
                    }
                    if segment.iterations > self.limits.max_loop_iterations {
                        return Err(Error::field_invalid(
                            "iterations",
                            format!(
                                "loop '{}' runs {} times, the maximum is {}",
                                segment.id, segment.iterations, self.limits.max_loop_iterations
                            ),
                        ));
                    }
                    if let Some(nested) = segment.children.iter().find(|c| matches!(c, Step::Loop(_))) {
                        return Err(Error::field_invalid(
                            "steps",
                            format!(
                                "loop '{}' contains loop '{}'; loops cannot be nested",
                                segment.id,
                                nested.id()
                            ),
                        ));
                    }
                    check_list(&segment.children, &mut seen_ids, personas)?;
                    plan_len = plan_len.saturating_add(
                        segment.children.len().saturating_mul(segment.iterations as usize),
                    );
                }
            }
        }

        if plan_len > self.limits.max_plan_steps {
            return Err(Error::field_invalid(
                "steps",
                format!(
                    "schema expands to {} plan steps, the maximum is {}",
                    plan_len, self.limits.max_plan_steps
                ),
            ));
        }
        Ok(())
    }
}

/// Checks one sibling list: unique orders, unique ids, known personas.
fn check_list<'a>(
    steps: &'a [Step],
    seen_ids: &mut HashSet<&'a str>,
    personas: &PersonaRegistry,
) -> Result<()> {
    let mut orders = HashSet::new();
    for step in steps {
        if step.id().trim().is_empty() {
            return Err(Error::field_invalid("steps", "step id cannot be empty"));
        }
        if !seen_ids.insert(step.id()) {
            return Err(Error::field_invalid(
                "steps",
                format!("duplicate step id '{}'", step.id()),
            ));
        }
        if !orders.insert(step.order()) {
            return Err(Error::field_invalid(
                "order",
                format!("order {} is used by more than one step", step.order()),
            ));
        }
        if let Step::Instruct(instruct) = step {
            if let Some(persona_id) = &instruct.persona_id {
                if !personas.contains(persona_id) {
                    return Err(Error::field_invalid(
                        "personaId",
                        format!(
                            "step '{}' references unknown persona '{}'",
                            instruct.id, persona_id
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Exclusive needs an allow-list; the other levels must not carry one.
pub fn validate_access(level: AccessLevel, allowed_users: &BTreeSet<String>) -> Result<()> {
    match level {
        AccessLevel::Exclusive if allowed_users.is_empty() => Err(Error::field_invalid(
            "allowedUsers",
            "an Exclusive schema needs at least one allowed user",
        )),
        AccessLevel::Private | AccessLevel::Public if !allowed_users.is_empty() => {
            Err(Error::field_invalid(
                "allowedUsers",
                format!("a {} schema cannot list allowed users", level),
            ))
        }
        _ => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
