//! Unsaved schema edits
//!
//! A [`SchemaDraft`] is the editor's working copy of a step list. Edits are
//! explicit commands; nothing here touches storage. The draft is handed to
//! [`SchemaBuilder`](super::SchemaBuilder) once the user saves.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persona::PersonaRegistry;

use super::types::{find_in, InstructStep, LoopSegment, SchemaDocument, Step};

/// Editable step list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDraft {
    steps: Vec<Step>,
}

impl SchemaDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Order value one past the largest used at the top level
    pub fn next_order(&self) -> Result<u32> {
        next_order(&self.steps)
    }

    /// Append a step at the top level.
    ///
    /// Rejects a step whose id is already used anywhere in the draft or whose
    /// order collides with a sibling.
    pub fn add_step(&mut self, step: impl Into<Step>) -> Result<()> {
        let step = step.into();
        self.check_new_id(&step)?;
        check_order_free(&self.steps, step.order())?;
        self.steps.push(step);
        Ok(())
    }

    /// Append a step to the children of a loop
    pub fn add_to_loop(&mut self, loop_id: &str, step: impl Into<Step>) -> Result<()> {
        let step = step.into();
        if matches!(step, Step::Loop(_)) {
            return Err(Error::field_invalid(
                "steps",
                format!("loop '{}' cannot contain another loop", loop_id),
            ));
        }
        self.check_new_id(&step)?;

        let segment = self
            .steps
            .iter_mut()
            .find_map(|s| match s {
                Step::Loop(l) if l.id == loop_id => Some(l),
                _ => None,
            })
            .ok_or_else(|| Error::field_invalid("steps", format!("no loop with id '{}'", loop_id)))?;
        check_order_free(&segment.children, step.order())?;
        segment.children.push(step);
        Ok(())
    }

    /// Append a new instruction with a generated id; returns the id.
    pub fn add_instruction(&mut self, text: impl Into<String>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.add_step(InstructStep::new(id.clone(), self.next_order()?, text))?;
        Ok(id)
    }

    /// Append an empty loop with the default iteration count; returns its id.
    pub fn add_loop(&mut self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.add_step(LoopSegment::new(
            id.clone(),
            self.next_order()?,
            LoopSegment::DEFAULT_ITERATIONS,
        ))?;
        Ok(id)
    }

    /// Remove a step, searching loop children too.
    pub fn remove_step(&mut self, step_id: &str) -> Result<Step> {
        remove_from(&mut self.steps, step_id)
            .ok_or_else(|| Error::field_invalid("steps", format!("no step with id '{}'", step_id)))
    }

    /// Bind a persona to an instruction.
    ///
    /// The persona must be known to the registry and the step must be an
    /// instruction; loops carry no persona.
    pub fn assign_persona(
        &mut self,
        step_id: &str,
        persona_id: &str,
        personas: &PersonaRegistry,
    ) -> Result<()> {
        if !personas.contains(persona_id) {
            return Err(Error::field_invalid(
                "personaId",
                format!("unknown persona '{}'", persona_id),
            ));
        }
        match find_mut(&mut self.steps, step_id) {
            Some(Step::Instruct(step)) => {
                step.persona_id = Some(persona_id.to_string());
                Ok(())
            }
            Some(Step::Loop(_)) => Err(Error::field_invalid(
                "personaId",
                format!("step '{}' is a loop and cannot take a persona", step_id),
            )),
            None => Err(Error::field_invalid(
                "steps",
                format!("no step with id '{}'", step_id),
            )),
        }
    }

    fn check_new_id(&self, step: &Step) -> Result<()> {
        let mut ids = vec![step.id()];
        if let Step::Loop(l) = step {
            ids.extend(l.children.iter().map(|c| c.id()));
        }
        for id in ids {
            if id.trim().is_empty() {
                return Err(Error::field_invalid("steps", "step id cannot be empty"));
            }
            if find_in(&self.steps, id).is_some() {
                return Err(Error::field_invalid(
                    "steps",
                    format!("duplicate step id '{}'", id),
                ));
            }
        }
        Ok(())
    }
}

impl SchemaDocument {
    /// Start a draft from an imported document
    pub fn into_draft(self) -> SchemaDraft {
        SchemaDraft::from_steps(self.steps)
    }
}

fn next_order(steps: &[Step]) -> Result<u32> {
    match steps.iter().map(Step::order).max() {
        None => Ok(0),
        Some(last) => last.checked_add(1).ok_or_else(|| {
            Error::field_invalid("order", format!("no order value left after {}", last))
        }),
    }
}

fn check_order_free(siblings: &[Step], order: u32) -> Result<()> {
    if siblings.iter().any(|s| s.order() == order) {
        return Err(Error::field_invalid(
            "steps",
            format!("order {} is already used", order),
        ));
    }
    Ok(())
}

fn find_mut<'a>(steps: &'a mut [Step], step_id: &str) -> Option<&'a mut Step> {
    for step in steps.iter_mut() {
        if step.id() == step_id {
            return Some(step);
        }
        if let Step::Loop(l) = step {
            if let Some(found) = find_mut(&mut l.children, step_id) {
                return Some(found);
            }
        }
    }
    None
}

fn remove_from(steps: &mut Vec<Step>, step_id: &str) -> Option<Step> {
    if let Some(pos) = steps.iter().position(|s| s.id() == step_id) {
        return Some(steps.remove(pos));
    }
    steps.iter_mut().find_map(|s| match s {
        Step::Loop(l) => remove_from(&mut l.children, step_id),
        Step::Instruct(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;

    fn personas() -> PersonaRegistry {
        PersonaRegistry::from_personas(vec![Persona::new("p1", "Bard", "mistral:7b")]).unwrap()
    }

    #[test]
    fn test_add_instruction_assigns_increasing_order() {
        let mut draft = SchemaDraft::new();
        draft.add_instruction("one").unwrap();
        draft.add_instruction("two").unwrap();
        let orders: Vec<u32> = draft.steps().iter().map(|s| s.order()).collect();
        assert_eq!(orders, vec![0, 1]);
    }

    #[test]
    fn test_next_order_at_upper_bound() {
        let mut draft = SchemaDraft::from_steps(vec![InstructStep::new("a", u32::MAX, "x").into()]);
        let err = draft.add_instruction("after").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(draft.add_loop().is_err());
        assert_eq!(draft.len(), 1);
    }

    #[test]
    fn test_add_loop_defaults_to_two_iterations() {
        let mut draft = SchemaDraft::new();
        let id = draft.add_loop().unwrap();
        match &draft.steps()[0] {
            Step::Loop(l) => {
                assert_eq!(l.id, id);
                assert_eq!(l.iterations, 2);
            }
            other => panic!("expected loop, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_order_and_id_rejected() {
        let mut draft = SchemaDraft::new();
        draft.add_step(InstructStep::new("a", 0, "x")).unwrap();
        assert!(draft.add_step(InstructStep::new("b", 0, "y")).is_err());
        assert!(draft.add_step(InstructStep::new("a", 1, "y")).is_err());
        assert_eq!(draft.len(), 1);
    }

    #[test]
    fn test_loop_children() {
        let mut draft = SchemaDraft::new();
        draft.add_step(LoopSegment::new("l1", 0, 3)).unwrap();
        draft.add_to_loop("l1", InstructStep::new("c1", 0, "x")).unwrap();

        assert!(draft.add_to_loop("l1", LoopSegment::new("l2", 1, 2)).is_err());
        assert!(draft.add_to_loop("nope", InstructStep::new("c2", 1, "y")).is_err());
        // ids are unique across the tree
        assert!(draft.add_step(InstructStep::new("c1", 1, "z")).is_err());
    }

    #[test]
    fn test_remove_nested_step() {
        let mut draft = SchemaDraft::from_steps(vec![LoopSegment::new("l1", 0, 2)
            .with_child(InstructStep::new("c1", 0, "x"))
            .into()]);
        let removed = draft.remove_step("c1").unwrap();
        assert_eq!(removed.id(), "c1");
        assert!(draft.remove_step("c1").is_err());
        assert_eq!(draft.len(), 1);
    }

    #[test]
    fn test_assign_persona() {
        let registry = personas();
        let mut draft = SchemaDraft::from_steps(vec![
            InstructStep::new("s1", 0, "x").into(),
            LoopSegment::new("l1", 1, 2)
                .with_child(InstructStep::new("c1", 0, "y"))
                .into(),
        ]);

        draft.assign_persona("c1", "p1", &registry).unwrap();
        match &draft.steps()[1] {
            Step::Loop(l) => match &l.children[0] {
                Step::Instruct(s) => assert_eq!(s.persona_id.as_deref(), Some("p1")),
                _ => panic!("expected instruction"),
            },
            _ => panic!("expected loop"),
        }

        assert!(draft.assign_persona("s1", "ghost", &registry).is_err());
        assert!(draft.assign_persona("l1", "p1", &registry).is_err());
        assert!(draft.assign_persona("missing", "p1", &registry).is_err());
    }
}
