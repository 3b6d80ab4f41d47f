//! Loop expansion
//!
//! Turns a step tree into a flat [`ExecutionPlan`]. Expansion is a pure
//! function of the steps: the same input always yields the same plan.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{in_order, AttachmentRef, InstructStep, Schema, Step};

/// One dispatchable entry of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub source_step_id: String,
    pub iteration_index: u32,
    pub text: String,
    #[serde(default)]
    pub persona_id: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub attachment_ref: Option<AttachmentRef>,
}

impl PlanStep {
    fn from_instruct(step: &InstructStep, iteration_index: u32) -> Self {
        Self {
            source_step_id: step.id.clone(),
            iteration_index,
            text: step.text.clone(),
            persona_id: step.persona_id.clone(),
            tool: step.tool.clone(),
            attachment_ref: step.attachment_ref.clone(),
        }
    }
}

/// Flattened, loop-expanded step list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionPlan {
    steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter()
    }

    /// SHA-256 over the canonical JSON form, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.steps {
            // Serializing a plain struct of strings cannot fail.
            if let Ok(bytes) = serde_json::to_vec(step) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Expand a step list into a plan.
///
/// Steps are walked in `order`. An instruction emits one entry with iteration
/// 0. A loop of `k` iterations over children `c1..cm` emits the whole child
/// block `k` times: `(c1,0)..(cm,0),(c1,1)..(cm,k-1)`.
pub fn expand(steps: &[Step]) -> ExecutionPlan {
    let mut out = Vec::new();
    expand_into(steps, 0, &mut out);
    ExecutionPlan::new(out)
}

/// Expand the steps of a saved schema
pub fn expand_schema(schema: &Schema) -> ExecutionPlan {
    expand(&schema.steps)
}

fn expand_into(steps: &[Step], iteration_index: u32, out: &mut Vec<PlanStep>) {
    for step in in_order(steps) {
        match step {
            Step::Instruct(instruct) => out.push(PlanStep::from_instruct(instruct, iteration_index)),
            Step::Loop(segment) => {
                for k in 0..segment.iterations {
                    expand_into(&segment.children, k, out);
                }
            }
        }
    }
}
