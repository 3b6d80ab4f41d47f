//! Thread execution runner
//!
//! Each started thread gets its own driver task that owns the thread record,
//! dispatches one plan step at a time, and reads pause/cancel signals at step
//! boundaries. Everyone else sees published snapshots.
//!
//! Once a thread is terminal and its conductor has gone idle, the driver writes
//! the final record and drops the thread from the engine. Finished threads are
//! then read back from the store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::access::{can_view, require_owner, require_view};
use crate::backend::{InvocationRequest, InvocationResponse, SharedInvoker};
use crate::config::SimphoniConfig;
use crate::error::{Error, InvocationError, Result};
use crate::persona::PersonaRegistry;
use crate::schema::{
    expand_schema, validate_access, AccessLevel, PlanStep, Schema, SchemaLimits, SchemaValidator,
};
use crate::storage::{collections, get_record, list_records, save_record, DocumentStore};

use super::accumulator::OutputEntry;
use super::conductor::{ConductorConfig, ConductorSummarizer, ConductorSummary, TriggerPolicy};
use super::state::{
    effective_status, transition, Control, FailureKind, Thread, ThreadCommand, ThreadFailure,
    ThreadStatus,
};

// ─────────────────────────────────────────────────────────────────
// Engine Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the execution engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on a single model call
    pub invocation_timeout: Duration,

    /// Model used by steps without a persona
    pub default_model: String,

    /// Creativity used by steps without a persona
    pub default_creativity: u8,

    /// Conductor applied to every thread, if enabled
    pub conductor: Option<ConductorConfig>,

    /// Step tree limits re-checked before a schema is expanded
    pub limits: SchemaLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(120),
            default_model: "llama3".to_string(),
            default_creativity: 5,
            conductor: None,
            limits: SchemaLimits::default(),
        }
    }
}

impl From<&SimphoniConfig> for EngineConfig {
    fn from(config: &SimphoniConfig) -> Self {
        let conductor = config.conductor.enabled.then(|| ConductorConfig {
            model: config.conductor.model.clone(),
            policy: TriggerPolicy::from_every_n(config.conductor.every_n_steps),
            preamble: config.conductor.preamble.clone(),
            creativity: config.conductor.creativity,
        });
        Self {
            invocation_timeout: Duration::from_secs(config.execution.invocation_timeout_secs),
            default_model: config.execution.default_model.clone(),
            default_creativity: config.execution.default_creativity,
            conductor,
            limits: config.schema.limits(),
        }
    }
}

/// Per-thread options chosen when the thread is created
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    /// Summarization model; falls back to the engine's conductor
    pub conductor_model: Option<String>,
    pub access_level: AccessLevel,
    pub allowed_users: BTreeSet<String>,
}

/// Persona definition and step text, separated by a blank line
pub fn build_prompt(definition: &str, text: &str) -> String {
    if definition.trim().is_empty() {
        text.to_string()
    } else {
        format!("{}\n\n{}", definition, text)
    }
}

// ─────────────────────────────────────────────────────────────────
// Thread Slot
// ─────────────────────────────────────────────────────────────────

struct ThreadSlot {
    /// Present until the thread is started
    pending: Mutex<Option<Thread>>,
    control: watch::Sender<Control>,
    snapshot: watch::Sender<Thread>,
    conductor: Option<ConductorSummarizer>,
    /// Set once a terminal thread's final record has been handled
    settled: watch::Sender<bool>,
}

type SlotTable = Arc<RwLock<HashMap<String, Arc<ThreadSlot>>>>;

impl ThreadSlot {
    fn current(&self) -> Thread {
        let mut thread = self.snapshot.borrow().clone();
        if let Some(conductor) = &self.conductor {
            thread.conductor_summaries = conductor.summaries();
        }
        thread
    }
}

// ─────────────────────────────────────────────────────────────────
// Execution Engine
// ─────────────────────────────────────────────────────────────────

/// Drives threads through their plans
pub struct ExecutionEngine {
    store: Arc<dyn DocumentStore>,
    invoker: SharedInvoker,
    personas: Arc<PersonaRegistry>,
    config: Arc<EngineConfig>,
    threads: SlotTable,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        invoker: SharedInvoker,
        personas: Arc<PersonaRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            personas,
            config: Arc::new(config),
            threads: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Expand a schema into a new Pending thread owned by `requester`.
    pub async fn create_thread(
        &self,
        requester: &str,
        schema: &Schema,
        options: ThreadOptions,
    ) -> Result<Thread> {
        if requester.trim().is_empty() {
            return Err(Error::auth("sign in to run a schema"));
        }
        require_view(Some(requester), schema, &format!("schema '{}'", schema.id))?;
        validate_access(options.access_level, &options.allowed_users)?;

        // The schema may not have come through the builder.
        SchemaValidator::new(self.config.limits).validate_steps(&schema.steps, &self.personas)?;
        let plan = expand_schema(schema);

        let mut thread = Thread::new(requester, schema, plan);
        thread.access_level = options.access_level;
        thread.allowed_users = options.allowed_users;
        thread.conductor_model = options
            .conductor_model
            .or_else(|| self.config.conductor.as_ref().map(|c| c.model.clone()));

        save_record(self.store.as_ref(), collections::THREADS, &thread.id, &thread).await?;

        let conductor = thread.conductor_model.as_ref().map(|model| {
            let config = match &self.config.conductor {
                Some(base) => ConductorConfig {
                    model: model.clone(),
                    ..base.clone()
                },
                None => ConductorConfig::new(model.clone()),
            };
            ConductorSummarizer::new(
                thread.id.clone(),
                config,
                self.invoker.clone(),
                self.store.clone(),
            )
        });

        let (control, _) = watch::channel(Control::Run);
        let (snapshot, _) = watch::channel(thread.clone());
        let (settled, _) = watch::channel(false);
        let slot = Arc::new(ThreadSlot {
            pending: Mutex::new(Some(thread.clone())),
            control,
            snapshot,
            conductor,
            settled,
        });
        self.threads.write().insert(thread.id.clone(), slot);

        info!(
            thread_id = %thread.id,
            schema_id = %thread.schema_id,
            plan_steps = thread.plan.len(),
            conductor = thread.conductor_model.as_deref().unwrap_or("none"),
            "Thread created"
        );
        Ok(thread)
    }

    /// Start a Pending thread. Returns the snapshot right after the start.
    pub async fn start(&self, requester: &str, thread_id: &str) -> Result<Thread> {
        let slot = self.slot(thread_id)?;
        require_owner(requester, &slot.current(), &format!("thread '{}'", thread_id))?;

        let taken = slot.pending.lock().take();
        let mut thread = match taken {
            Some(thread) => thread,
            None => {
                let status = slot.snapshot.borrow().status;
                return Err(Error::invalid_transition(status, ThreadCommand::Start));
            }
        };
        thread.apply(ThreadCommand::Start)?;

        let driver = Driver {
            slot: slot.clone(),
            store: self.store.clone(),
            invoker: self.invoker.clone(),
            personas: self.personas.clone(),
            config: self.config.clone(),
            threads: self.threads.clone(),
        };
        if let Err(e) = driver.save(&mut thread).await {
            slot.settled.send_replace(true);
            return Err(e);
        }

        if thread.status == ThreadStatus::Completed {
            info!(thread_id = %thread.id, "Empty plan, thread completed");
            driver.settle(thread.clone()).await;
            return Ok(thread);
        }

        info!(thread_id = %thread.id, plan_steps = thread.plan.len(), "Thread started");
        let started = thread.clone();
        tokio::spawn(driver.drive(thread));
        Ok(started)
    }

    /// Ask a running thread to pause after its in-flight step
    pub fn pause(&self, requester: &str, thread_id: &str) -> Result<()> {
        self.command(requester, thread_id, ThreadCommand::Pause)
    }

    /// Continue a paused thread from its cursor
    pub fn resume(&self, requester: &str, thread_id: &str) -> Result<()> {
        self.command(requester, thread_id, ThreadCommand::Resume)
    }

    /// Cancel a running or paused thread. An in-flight result is discarded.
    pub fn cancel(&self, requester: &str, thread_id: &str) -> Result<()> {
        self.command(requester, thread_id, ThreadCommand::Cancel)
    }

    fn command(&self, requester: &str, thread_id: &str, command: ThreadCommand) -> Result<()> {
        let slot = self.slot(thread_id)?;
        require_owner(requester, &slot.current(), &format!("thread '{}'", thread_id))?;

        let mut outcome = Ok(());
        slot.control.send_if_modified(|control| {
            let status = effective_status(slot.snapshot.borrow().status, *control);
            match transition(status, command) {
                Ok(_) => {
                    *control = match command {
                        ThreadCommand::Pause => Control::Pause,
                        ThreadCommand::Resume => Control::Run,
                        ThreadCommand::Cancel => Control::Cancel,
                        ThreadCommand::Start => *control,
                    };
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        if outcome.is_ok() {
            info!(thread_id, %command, "Thread command accepted");
        }
        outcome
    }

    /// Latest published state of a live thread, through the access gate.
    ///
    /// Threads that have finished and left the engine are `NotFound` here;
    /// read them with [`load_thread`](Self::load_thread).
    pub fn snapshot(&self, requester: Option<&str>, thread_id: &str) -> Result<Thread> {
        let thread = self.slot(thread_id)?.current();
        require_view(requester, &thread, &format!("thread '{}'", thread_id))?;
        Ok(thread)
    }

    /// Receiver that sees every published snapshot of a live thread
    pub fn subscribe(&self, thread_id: &str) -> Result<watch::Receiver<Thread>> {
        Ok(self.slot(thread_id)?.snapshot.subscribe())
    }

    /// Wait for a started thread to reach a terminal state.
    ///
    /// A thread that failed because its record could not be saved yields the
    /// storage error; every other terminal state yields the thread.
    pub async fn wait(&self, thread_id: &str) -> Result<Thread> {
        let slot = match self.slot(thread_id) {
            Ok(slot) => slot,
            Err(_) => return self.finished_record(thread_id).await,
        };
        let mut rx = slot.snapshot.subscribe();
        let status = rx.borrow().status;
        if status == ThreadStatus::Pending {
            return Err(Error::invalid_transition(status, "wait on"));
        }
        rx.wait_for(|t| t.status.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("driver for thread '{}' stopped", thread_id)))?;

        finished(slot.current())
    }

    /// Wait for the thread's conductor to go idle and return its summaries.
    ///
    /// For a terminal thread this also waits until the summaries are part of
    /// the persisted record.
    pub async fn wait_conductor(&self, thread_id: &str) -> Result<Vec<ConductorSummary>> {
        let slot = match self.slot(thread_id) {
            Ok(slot) => slot,
            Err(_) => {
                let thread: Thread =
                    get_record(self.store.as_ref(), collections::THREADS, thread_id).await?;
                return Ok(thread.conductor_summaries);
            }
        };
        if let Some(conductor) = &slot.conductor {
            conductor.wait_idle().await;
        }
        let terminal = slot.snapshot.borrow().status.is_terminal();
        if terminal {
            let mut settled = slot.settled.subscribe();
            // The slot owns the sender, so the channel stays open.
            let _ = settled.wait_for(|done| *done).await;
        }
        Ok(slot.current().conductor_summaries)
    }

    /// Read a persisted thread through the access gate
    pub async fn load_thread(&self, requester: Option<&str>, thread_id: &str) -> Result<Thread> {
        let thread: Thread = get_record(self.store.as_ref(), collections::THREADS, thread_id).await?;
        require_view(requester, &thread, &format!("thread '{}'", thread_id))?;
        Ok(thread)
    }

    /// Every persisted thread the requester can see
    pub async fn list_threads(&self, requester: Option<&str>) -> Result<Vec<Thread>> {
        let threads: Vec<Thread> = list_records(self.store.as_ref(), collections::THREADS).await?;
        Ok(threads
            .into_iter()
            .filter(|t| can_view(requester, t))
            .collect())
    }

    /// A thread that already left the engine, read back from the store
    async fn finished_record(&self, thread_id: &str) -> Result<Thread> {
        let thread: Thread = get_record(self.store.as_ref(), collections::THREADS, thread_id).await?;
        if !thread.status.is_terminal() {
            return Err(Error::invalid_transition(thread.status, "wait on"));
        }
        finished(thread)
    }

    fn slot(&self, thread_id: &str) -> Result<Arc<ThreadSlot>> {
        self.threads
            .read()
            .get(thread_id)
            .cloned()
            .ok_or_else(|| Error::not_found(collections::THREADS, thread_id))
    }
}

/// Terminal thread as `wait` reports it: a storage failure becomes the error
fn finished(thread: Thread) -> Result<Thread> {
    if let Some(ThreadFailure {
        kind: FailureKind::Storage,
        message,
    }) = &thread.failure
    {
        return Err(Error::storage(message.clone()));
    }
    Ok(thread)
}

// ─────────────────────────────────────────────────────────────────
// Thread Driver
// ─────────────────────────────────────────────────────────────────

/// Owns one thread while it runs
struct Driver {
    slot: Arc<ThreadSlot>,
    store: Arc<dyn DocumentStore>,
    invoker: SharedInvoker,
    personas: Arc<PersonaRegistry>,
    config: Arc<EngineConfig>,
    threads: SlotTable,
}

impl Driver {
    async fn drive(self, mut thread: Thread) {
        let mut control = self.slot.control.subscribe();

        loop {
            match self.boundary(&mut thread, &mut control).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.abort(&mut thread, e);
                    break;
                }
            }

            let index = thread.cursor;
            let Some(step) = thread.plan.get(index).cloned() else {
                self.abort(
                    &mut thread,
                    Error::Internal(format!("cursor {} is past the plan", index)),
                );
                break;
            };

            let outcome = match self.build_request(&step) {
                Ok(request) => {
                    debug!(
                        thread_id = %thread.id,
                        plan_index = index,
                        persona_id = step.persona_id.as_deref().unwrap_or("-"),
                        model_ref = %request.model_ref,
                        "Dispatching step"
                    );
                    self.invoke(request).await
                }
                Err(e) => Err(e),
            };

            if *control.borrow() == Control::Cancel {
                info!(thread_id = %thread.id, plan_index = index, "Discarding in-flight result");
                if let Err(e) = self.finish_command(&mut thread, ThreadCommand::Cancel).await {
                    self.abort(&mut thread, e);
                }
                break;
            }

            let recorded = match outcome {
                Ok(response) => {
                    let entry = OutputEntry::success(index, step.persona_id.clone(), response.output);
                    let fed = entry.clone();
                    thread.record_success(entry).map(|_| {
                        if let Some(conductor) = &self.slot.conductor {
                            conductor.on_output(&fed);
                        }
                    })
                }
                Err(e) => {
                    warn!(thread_id = %thread.id, plan_index = index, error = %e, "Step failed");
                    thread.record_failure(OutputEntry::failure(
                        index,
                        step.persona_id.clone(),
                        e.to_string(),
                    ))
                }
            };
            if let Err(e) = recorded {
                self.abort(&mut thread, e);
                break;
            }

            if self.save(&mut thread).await.is_err() {
                break;
            }
            if thread.status.is_terminal() {
                info!(
                    thread_id = %thread.id,
                    status = %thread.status,
                    outputs = thread.outputs.len(),
                    "Thread finished"
                );
                break;
            }
        }

        if thread.status.is_terminal() {
            self.settle(thread).await;
        }
    }

    /// Write the final record with every conductor summary, then drop the
    /// thread from the engine. If that write fails the thread stays in memory.
    async fn settle(&self, mut thread: Thread) {
        if let Some(conductor) = &self.slot.conductor {
            conductor.wait_idle().await;
            thread.conductor_summaries = conductor.summaries();
        }
        match save_record(self.store.as_ref(), collections::THREADS, &thread.id, &thread).await {
            Ok(()) => {
                self.slot.snapshot.send_replace(thread.clone());
                self.threads.write().remove(&thread.id);
                debug!(
                    thread_id = %thread.id,
                    summaries = thread.conductor_summaries.len(),
                    "Thread settled"
                );
            }
            Err(e) => {
                warn!(thread_id = %thread.id, error = %e, "Final thread record not written, keeping it in memory");
            }
        }
        self.slot.settled.send_replace(true);
    }

    /// Honour the control signal. Returns false when the thread must stop.
    async fn boundary(
        &self,
        thread: &mut Thread,
        control: &mut watch::Receiver<Control>,
    ) -> Result<bool> {
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                Control::Run => {
                    if thread.status == ThreadStatus::Paused {
                        self.finish_command(thread, ThreadCommand::Resume).await?;
                        info!(thread_id = %thread.id, cursor = thread.cursor, "Thread resumed");
                    }
                    return Ok(true);
                }
                Control::Cancel => {
                    self.finish_command(thread, ThreadCommand::Cancel).await?;
                    info!(thread_id = %thread.id, cursor = thread.cursor, "Thread cancelled");
                    return Ok(false);
                }
                Control::Pause => {
                    if thread.status == ThreadStatus::Running {
                        self.finish_command(thread, ThreadCommand::Pause).await?;
                        info!(thread_id = %thread.id, cursor = thread.cursor, "Thread paused");
                    }
                    if control.changed().await.is_err() {
                        // Engine dropped; leave the thread paused.
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn finish_command(&self, thread: &mut Thread, command: ThreadCommand) -> Result<()> {
        thread.apply(command)?;
        self.save(thread).await
    }

    fn build_request(&self, step: &PlanStep) -> std::result::Result<InvocationRequest, InvocationError> {
        let (model_ref, creativity, definition) = match &step.persona_id {
            Some(id) => {
                let persona = self.personas.get(id).ok_or_else(|| InvocationError::Unsupported {
                    model_ref: format!("persona '{}'", id),
                })?;
                (persona.model_ref, persona.creativity, persona.definition)
            }
            None => (
                self.config.default_model.clone(),
                self.config.default_creativity,
                String::new(),
            ),
        };
        Ok(InvocationRequest {
            model_ref,
            prompt: build_prompt(&definition, &step.text),
            creativity,
            attachment_ref: step.attachment_ref.clone(),
        })
    }

    async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> std::result::Result<InvocationResponse, InvocationError> {
        let timeout = self.config.invocation_timeout;
        match tokio::time::timeout(timeout, self.invoker.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(InvocationError::Timeout {
                after_secs: timeout.as_secs(),
            }),
        }
    }

    /// Persist the thread, then publish it. A storage error fails the thread.
    async fn save(&self, thread: &mut Thread) -> Result<()> {
        if let Some(conductor) = &self.slot.conductor {
            thread.conductor_summaries = conductor.summaries();
        }
        match save_record(self.store.as_ref(), collections::THREADS, &thread.id, &*thread).await {
            Ok(()) => {
                self.slot.snapshot.send_replace(thread.clone());
                Ok(())
            }
            Err(e) => {
                error!(thread_id = %thread.id, error = %e, "Failed to persist thread");
                thread.mark_failed(FailureKind::Storage, e.to_string());
                self.slot.snapshot.send_replace(thread.clone());
                Err(e)
            }
        }
    }

    /// Fail the thread on an unexpected error and publish it without saving
    fn abort(&self, thread: &mut Thread, e: Error) {
        if thread.status.is_terminal() {
            return;
        }
        error!(thread_id = %thread.id, error = %e, "Thread aborted");
        thread.mark_failed(FailureKind::Internal, e.to_string());
        self.slot.snapshot.send_replace(thread.clone());
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
