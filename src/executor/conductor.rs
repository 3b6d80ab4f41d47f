//! Conductor summarizer
//!
//! Digests a thread's outputs through a designated summarization model. Runs
//! beside the engine as a detached task: at most one summarization is in
//! flight per thread, and triggers that arrive meanwhile are folded into a
//! single follow-up run. Failures are recorded and never fail the thread.

use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{InvocationRequest, SharedInvoker};
use crate::storage::{collections, save_record, DocumentStore};

use super::accumulator::OutputEntry;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// When a summarization fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolicy {
    EveryStep,
    EveryNSteps(usize),
}

impl TriggerPolicy {
    pub fn from_every_n(n: usize) -> Self {
        if n <= 1 {
            TriggerPolicy::EveryStep
        } else {
            TriggerPolicy::EveryNSteps(n)
        }
    }

    /// Whether the trigger fires once `completed` steps have succeeded
    pub fn fires(&self, completed: usize) -> bool {
        match self {
            TriggerPolicy::EveryStep => completed > 0,
            TriggerPolicy::EveryNSteps(n) => *n > 0 && completed > 0 && completed % n == 0,
        }
    }
}

/// Conductor settings for one thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConductorConfig {
    pub model: String,
    pub policy: TriggerPolicy,
    /// Instruction placed before the transcript
    pub preamble: String,
    pub creativity: u8,
}

impl ConductorConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            policy: TriggerPolicy::EveryStep,
            preamble: DEFAULT_PREAMBLE.to_string(),
            creativity: 3,
        }
    }
}

pub const DEFAULT_PREAMBLE: &str =
    "Summarize the conversation so far in a few sentences, keeping names and decisions.";

// ─────────────────────────────────────────────────────────────────
// Summary record
// ─────────────────────────────────────────────────────────────────

/// One conductor digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConductorSummary {
    /// Last plan index covered by this summary
    pub after_plan_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Record stored in the `conductor_summaries` collection
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConductorLog<'a> {
    thread_id: &'a str,
    model: &'a str,
    summaries: &'a [ConductorSummary],
}

// ─────────────────────────────────────────────────────────────────
// Summarizer
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    /// (plan index, text) of outputs not yet summarized
    pending: Vec<(usize, String)>,
    completed: usize,
    in_flight: bool,
    rerun: bool,
    summaries: Vec<ConductorSummary>,
}

struct Inner {
    thread_id: String,
    config: ConductorConfig,
    invoker: SharedInvoker,
    store: Arc<dyn DocumentStore>,
    state: Mutex<State>,
    busy: watch::Sender<bool>,
}

/// Per-thread conductor handle. Cheap to clone.
#[derive(Clone)]
pub struct ConductorSummarizer {
    inner: Arc<Inner>,
}

impl ConductorSummarizer {
    pub fn new(
        thread_id: impl Into<String>,
        config: ConductorConfig,
        invoker: SharedInvoker,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                thread_id: thread_id.into(),
                config,
                invoker,
                store,
                state: Mutex::new(State::default()),
                busy,
            }),
        }
    }

    /// Feed a successful output. Never blocks on the summarization model.
    pub fn on_output(&self, entry: &OutputEntry) {
        let Some(output) = &entry.output else {
            return;
        };
        {
            let mut state = self.inner.state.lock();
            state.pending.push((entry.plan_index, output.to_string()));
            state.completed += 1;
            if !self.inner.config.policy.fires(state.completed) {
                return;
            }
            if state.in_flight {
                state.rerun = true;
                debug!(thread_id = %self.inner.thread_id, "Summarization coalesced");
                return;
            }
            state.in_flight = true;
            self.inner.busy.send_replace(true);
        }
        tokio::spawn(run(self.inner.clone()));
    }

    /// Summaries produced so far
    pub fn summaries(&self) -> Vec<ConductorSummary> {
        self.inner.state.lock().summaries.clone()
    }

    /// Wait until no summarization is running
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.busy.subscribe();
        // The sender lives in `inner`, which we hold, so the channel stays open.
        let _ = rx.wait_for(|busy| !*busy).await;
    }
}

fn build_prompt(preamble: &str, batch: &[(usize, String)]) -> String {
    let transcript: Vec<&str> = batch.iter().map(|(_, text)| text.as_str()).collect();
    if preamble.is_empty() {
        transcript.join("\n\n")
    } else {
        format!("{}\n\n{}", preamble, transcript.join("\n\n"))
    }
}

async fn run(inner: Arc<Inner>) {
    loop {
        let batch = mem::take(&mut inner.state.lock().pending);
        let Some(&(after_plan_index, _)) = batch.last() else {
            if finish(&inner) {
                return;
            }
            continue;
        };

        let request = InvocationRequest::new(
            inner.config.model.clone(),
            build_prompt(&inner.config.preamble, &batch),
            inner.config.creativity,
        );
        let summary = match inner.invoker.invoke(request).await {
            Ok(response) => {
                info!(
                    thread_id = %inner.thread_id,
                    after_plan_index,
                    "Conductor summary recorded"
                );
                ConductorSummary {
                    after_plan_index,
                    summary: Some(response.output.to_string()),
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err(e) => {
                warn!(thread_id = %inner.thread_id, error = %e, "Conductor summarization failed");
                ConductorSummary {
                    after_plan_index,
                    summary: None,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }
            }
        };

        let snapshot = {
            let mut state = inner.state.lock();
            state.summaries.push(summary);
            state.summaries.clone()
        };
        let log = ConductorLog {
            thread_id: &inner.thread_id,
            model: &inner.config.model,
            summaries: &snapshot,
        };
        if let Err(e) = save_record(
            inner.store.as_ref(),
            collections::CONDUCTOR_SUMMARIES,
            &inner.thread_id,
            &log,
        )
        .await
        {
            warn!(thread_id = %inner.thread_id, error = %e, "Failed to persist conductor summaries");
        }

        if finish(&inner) {
            return;
        }
    }
}

/// Clear the in-flight flag unless a trigger was coalesced meanwhile.
/// Returns true when the run is over.
fn finish(inner: &Inner) -> bool {
    let mut state = inner.state.lock();
    if mem::take(&mut state.rerun) {
        return false;
    }
    state.in_flight = false;
    inner.busy.send_replace(false);
    true
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockInvoker, ModelOutput};
    use crate::error::InvocationError;
    use crate::storage::MemoryStore;

    fn entry(i: usize, text: &str) -> OutputEntry {
        OutputEntry::success(i, None, ModelOutput::text(text))
    }

    #[test]
    fn test_policy() {
        assert!(TriggerPolicy::EveryStep.fires(1));
        assert!(!TriggerPolicy::EveryStep.fires(0));
        let every3 = TriggerPolicy::from_every_n(3);
        assert!(!every3.fires(2));
        assert!(every3.fires(3));
        assert!(every3.fires(6));
        assert_eq!(TriggerPolicy::from_every_n(1), TriggerPolicy::EveryStep);
    }

    #[test]
    fn test_prompt_joins_outputs() {
        let batch = vec![(0, "one".to_string()), (1, "two".to_string())];
        assert_eq!(build_prompt("Sum up.", &batch), "Sum up.\n\none\n\ntwo");
        assert_eq!(build_prompt("", &batch), "one\n\ntwo");
    }

    #[tokio::test]
    async fn test_summarizes_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockInvoker::new().with_responses(["digest"]));
        let conductor =
            ConductorSummarizer::new("t1", ConductorConfig::new("llama3"), mock.clone(), store.clone());

        conductor.on_output(&entry(0, "hello"));
        conductor.wait_idle().await;

        let summaries = conductor.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary.as_deref(), Some("digest"));
        assert_eq!(summaries[0].after_plan_index, 0);
        assert_eq!(store.count(collections::CONDUCTOR_SUMMARIES), 1);
        assert!(mock.requests()[0].prompt.ends_with("hello"));
    }

    #[tokio::test]
    async fn test_coalesces_triggers_while_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockInvoker::gated());
        let conductor =
            ConductorSummarizer::new("t1", ConductorConfig::new("llama3"), mock.clone(), store);

        conductor.on_output(&entry(0, "a"));
        mock.wait_for_calls(1).await;
        let mut idle = tokio_test::task::spawn(conductor.wait_idle());
        tokio_test::assert_pending!(idle.poll());

        conductor.on_output(&entry(1, "b"));
        conductor.on_output(&entry(2, "c"));
        mock.release(2);
        idle.await;

        // One run for "a", one coalesced run for "b" and "c".
        assert_eq!(mock.call_count(), 2);
        let requests = mock.requests();
        assert!(requests[1].prompt.ends_with("b\n\nc"));
        let summaries = conductor.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].after_plan_index, 2);
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockInvoker::new().fail_on_call(1, InvocationError::provider("down")));
        let conductor =
            ConductorSummarizer::new("t1", ConductorConfig::new("llama3"), mock, store);

        conductor.on_output(&entry(0, "a"));
        conductor.wait_idle().await;
        let summaries = conductor.summaries();
        assert!(summaries[0].summary.is_none());
        assert!(summaries[0].error.as_deref().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_every_n_steps() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockInvoker::new());
        let config = ConductorConfig {
            policy: TriggerPolicy::EveryNSteps(2),
            ..ConductorConfig::new("llama3")
        };
        let conductor = ConductorSummarizer::new("t1", config, mock.clone(), store);

        conductor.on_output(&entry(0, "a"));
        conductor.wait_idle().await;
        assert_eq!(mock.call_count(), 0);

        conductor.on_output(&entry(1, "b"));
        conductor.wait_idle().await;
        assert_eq!(mock.call_count(), 1);
        assert!(mock.requests()[0].prompt.ends_with("a\n\nb"));
    }
}
