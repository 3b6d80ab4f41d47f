//! Output accumulator
//!
//! Append-only log of step results for one thread. Entry `i` always belongs to
//! plan step `i`, so the log is a prefix of the plan at every point in time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::ModelOutput;
use crate::error::{Error, Result};

/// Result of one executed plan step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEntry {
    pub plan_index: usize,
    #[serde(default)]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ModelOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutputEntry {
    pub fn success(plan_index: usize, persona_id: Option<String>, output: ModelOutput) -> Self {
        Self {
            plan_index,
            persona_id,
            output: Some(output),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(plan_index: usize, persona_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            plan_index,
            persona_id,
            output: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Ordered, append-only output log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputAccumulator {
    entries: Vec<OutputEntry>,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next entry. Its plan index must equal the current length,
    /// and nothing may follow an error entry.
    pub fn append(&mut self, entry: OutputEntry) -> Result<()> {
        if self.entries.last().map_or(false, OutputEntry::is_error) {
            return Err(Error::Internal(
                "output log is closed after an error entry".to_string(),
            ));
        }
        if entry.plan_index != self.entries.len() {
            return Err(Error::Internal(format!(
                "output for plan step {} appended at position {}",
                entry.plan_index,
                self.entries.len()
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[OutputEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of successful entries
    pub fn completed(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_error()).count()
    }

    /// Entries from `plan_index` onwards
    pub fn since(&self, plan_index: usize) -> &[OutputEntry] {
        self.entries.get(plan_index..).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_in_order() {
        let mut log = OutputAccumulator::new();
        log.append(OutputEntry::success(0, Some("p1".into()), ModelOutput::text("r1")))
            .unwrap();
        log.append(OutputEntry::success(1, None, ModelOutput::text("r2")))
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.completed(), 2);
        assert_eq!(log.since(1).len(), 1);
        assert!(log.since(5).is_empty());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut log = OutputAccumulator::new();
        let err = log
            .append(OutputEntry::success(1, None, ModelOutput::text("r")))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(log.is_empty());
    }

    #[test]
    fn test_closed_after_error() {
        let mut log = OutputAccumulator::new();
        log.append(OutputEntry::failure(0, None, "timeout")).unwrap();
        assert!(log
            .append(OutputEntry::success(1, None, ModelOutput::text("r")))
            .is_err());
        assert_eq!(log.completed(), 0);
        assert!(log.entries()[0].is_error());
    }

    #[test]
    fn test_serializes_as_array() {
        let mut log = OutputAccumulator::new();
        log.append(OutputEntry::success(0, Some("p1".into()), ModelOutput::text("r1")))
            .unwrap();
        let json = serde_json::to_value(&log).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["planIndex"], 0);
        assert_eq!(json[0]["personaId"], "p1");
        assert!(json[0].get("error").is_none());
    }
}
