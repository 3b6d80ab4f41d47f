//! Simphoni - instruct sequence runner
//!
//! Main entry point for the `simphoni` binary. Schemas are expanded into
//! execution plans and run step by step against persona-configured models,
//! with records kept in a file store under the data directory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use simphoni::backend::{InvokerRegistry, SharedInvoker};
use simphoni::cli::{Cli, Commands, ConfigSubcommand, PersonasSubcommand, SchemasSubcommand, ThreadSubcommand};
use simphoni::config::{self, SimphoniConfig};
use simphoni::executor::{EngineConfig, ExecutionEngine, OutputEntry, Thread, ThreadOptions, ThreadStatus};
use simphoni::persona::{PersonaRegistry, PersonaUpdate};
use simphoni::schema::{expand, SaveSchemaRequest, Schema, SchemaBuilder, SchemaDocument, SchemaDraft, SchemaValidator};
use simphoni::storage::{collections, save_record, DocumentStore, FileStore};
use simphoni::{logging, version, Error, Result};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

/// Everything that holds resources lives in here, so the log file is
/// flushed before `main` picks an exit code.
fn run(cli: Cli) -> Result<()> {
    // Commands that don't need the store use minimal logging
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(cli.config.as_deref(), subcommand.clone());
        }
        _ => {}
    }

    let mut config = SimphoniConfig::load(cli.config.as_deref())?;
    if let Some(user) = &cli.user {
        config.user.id = user.clone();
    }

    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    debug!(
        version = %build.full_version(),
        target = %build.target,
        user = %config.user.id,
        "Starting Simphoni"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(1, 4))
        .thread_name("simphoni")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let result = runtime.block_on(dispatch(cli, config));
    // Step mode may leave a stdin read pending; it cannot be cancelled.
    runtime.shutdown_background();
    result
}

// ─────────────────────────────────────────────────────────────────
// Application context
// ─────────────────────────────────────────────────────────────────

struct App {
    config: SimphoniConfig,
    store: Arc<dyn DocumentStore>,
    builder: SchemaBuilder,
}

impl App {
    fn open(config: SimphoniConfig) -> Result<Self> {
        let data_dir = config.data_dir();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).map_err(|e| Error::IoWrite {
                path: data_dir.clone(),
                source: e,
            })?;
            info!(path = %data_dir.display(), "Created data directory");
        }
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(data_dir));
        let builder = SchemaBuilder::new(
            store.clone(),
            Arc::new(config.user.directory()),
            config.schema.limits(),
        );
        Ok(Self {
            config,
            store,
            builder,
        })
    }

    fn user(&self) -> &str {
        &self.config.user.id
    }

    async fn personas(&self, file: Option<&str>) -> Result<PersonaRegistry> {
        match file {
            Some(path) => PersonaRegistry::load_file(Path::new(path)),
            None => PersonaRegistry::load_from_store(self.store.as_ref()).await,
        }
    }

    fn invoker(&self, backend: Option<&str>) -> Result<SharedInvoker> {
        let mut settings = self.config.backend.clone();
        if let Some(name) = backend {
            settings.default = name.to_string();
            settings.routes.clear();
        }
        if settings.default == "mock" {
            return Ok(Arc::new(InvokerRegistry::mock()));
        }
        Ok(Arc::new(InvokerRegistry::from_settings(&settings)?))
    }

    /// Resolve a schema argument: a document file is imported, anything else is a stored id
    async fn schema(&self, reference: &str, personas: &PersonaRegistry) -> Result<Schema> {
        if Path::new(reference).is_file() {
            let document = read_document(reference)?;
            let schema = self.builder.import(self.user(), document, personas).await?;
            info!(schema_id = %schema.id, "Imported schema for this run");
            Ok(schema)
        } else {
            self.builder.load(Some(self.user()), reference).await
        }
    }
}

fn read_document(path: &str) -> Result<SchemaDocument> {
    let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
        path: path.into(),
        source: e,
    })?;
    Ok(SchemaDocument::from_json(&content)?)
}

async fn dispatch(cli: Cli, config: SimphoniConfig) -> Result<()> {
    let app = App::open(config)?;

    match cli.command {
        Commands::Run {
            schema,
            personas,
            backend,
            conductor,
            json,
            step,
        } => {
            let options = RunOptions {
                conductor,
                json,
                step,
                quiet: cli.quiet,
            };
            run_schema(&app, &schema, personas.as_deref(), backend.as_deref(), options).await
        }
        Commands::Validate { schema, personas } => {
            let personas = app.personas(personas.as_deref()).await?;
            let document = read_document(&schema)?;
            let validator = SchemaValidator::new(app.config.schema.limits());
            validator.validate(
                &document.name,
                &document.steps,
                document.access_level,
                &document.allowed_users,
                &personas,
            )?;
            let plan = expand(&document.steps);
            println!(
                "Schema '{}' is valid: {} steps, {} plan steps.",
                document.name,
                document.steps.len(),
                plan.len()
            );
            Ok(())
        }
        Commands::Expand { schema, json } => {
            let document = read_document(&schema)?;
            let plan = expand(&document.steps);
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                for (i, step) in plan.iter().enumerate() {
                    println!(
                        "{:>3}. [{} #{}] {}{}",
                        i,
                        step.source_step_id,
                        step.iteration_index,
                        step.persona_id.as_deref().map(|p| format!("({}) ", p)).unwrap_or_default(),
                        step.text
                    );
                }
                println!("fingerprint: {}", plan.fingerprint());
            }
            Ok(())
        }
        Commands::Schemas { subcommand } => handle_schemas_command(&app, subcommand).await,
        Commands::Personas { subcommand } => handle_personas_command(&app, subcommand).await,
        Commands::Thread { subcommand } => handle_thread_command(&app, subcommand).await,
        Commands::Version | Commands::Config { .. } => {
            // Already handled in run
            unreachable!();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────

struct RunOptions {
    conductor: Option<String>,
    json: bool,
    step: bool,
    quiet: bool,
}

async fn run_schema(
    app: &App,
    reference: &str,
    personas_file: Option<&str>,
    backend: Option<&str>,
    run: RunOptions,
) -> Result<()> {
    let RunOptions {
        conductor,
        json,
        mut step,
        quiet,
    } = run;
    let personas = Arc::new(app.personas(personas_file).await?);
    let schema = app.schema(reference, &personas).await?;
    let engine = ExecutionEngine::new(
        app.store.clone(),
        app.invoker(backend)?,
        personas,
        EngineConfig::from(&app.config),
    );

    let options = ThreadOptions {
        conductor_model: conductor,
        ..Default::default()
    };
    let thread = engine.create_thread(app.user(), &schema, options).await?;
    let mut rx = engine.subscribe(&thread.id)?;
    engine.start(app.user(), &thread.id).await?;

    // Step mode: pause before every step, resume on Enter.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut awaiting_enter = false;
    let mut repause = false;
    if step {
        request_pause(&engine, app.user(), &thread.id);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut interrupted = false;
    let mut printed = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown, if !interrupted => {
                warn!(thread_id = %thread.id, "Interrupted, cancelling thread");
                interrupted = true;
                if let Err(e) = engine.cancel(app.user(), &thread.id) {
                    debug!(error = %e, "Cancel not applied");
                }
            }
            line = stdin.next_line(), if awaiting_enter => {
                awaiting_enter = false;
                if !matches!(line, Ok(Some(_))) {
                    // No more input; run the rest straight through.
                    step = false;
                }
                match engine.resume(app.user(), &thread.id) {
                    Ok(()) => repause = step,
                    Err(e) => debug!(error = %e, "Resume not applied"),
                }
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                if !json && !quiet {
                    for entry in snapshot.outputs.since(printed) {
                        print_entry(&snapshot, entry);
                    }
                }
                printed = snapshot.outputs.len();
                if snapshot.status.is_terminal() {
                    break;
                }
                match snapshot.status {
                    ThreadStatus::Paused if step && !awaiting_enter => {
                        eprintln!(
                            "Paused before step {}/{}. Press Enter to continue.",
                            snapshot.cursor + 1,
                            snapshot.plan.len()
                        );
                        awaiting_enter = true;
                    }
                    // Only re-arm once the resume has landed, so the two never coalesce.
                    ThreadStatus::Running if repause => {
                        repause = false;
                        request_pause(&engine, app.user(), &thread.id);
                    }
                    _ => {}
                }
            }
        }
    }

    engine.wait_conductor(&thread.id).await?;
    let finished = engine.wait(&thread.id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else if !quiet {
        print_summary(&finished);
    }

    if finished.status == ThreadStatus::Failed {
        let message = finished
            .failure
            .map(|f| f.message)
            .unwrap_or_else(|| "no failure recorded".to_string());
        return Err(Error::ThreadFailed {
            thread_id: finished.id,
            message,
        });
    }
    Ok(())
}

fn request_pause(engine: &ExecutionEngine, user: &str, thread_id: &str) {
    if let Err(e) = engine.pause(user, thread_id) {
        debug!(error = %e, "Pause not applied");
    }
}

/// Apply `STEP=PERSONA` bindings to a draft
fn assign_all(draft: &mut SchemaDraft, assignments: &[(String, String)], personas: &PersonaRegistry) -> Result<()> {
    for (step_id, persona_id) in assignments {
        draft.assign_persona(step_id, persona_id, personas)?;
    }
    Ok(())
}

fn print_entry(thread: &Thread, entry: &OutputEntry) {
    let step = thread.plan.get(entry.plan_index);
    let label = step
        .map(|s| format!("{} #{}", s.source_step_id, s.iteration_index))
        .unwrap_or_default();
    let persona = entry.persona_id.as_deref().unwrap_or("-");
    match (&entry.output, &entry.error) {
        (Some(output), _) => println!(
            "[{}/{}] {} ({}): {}",
            entry.plan_index + 1,
            thread.plan.len(),
            label,
            persona,
            output
        ),
        (None, Some(error)) => println!(
            "[{}/{}] {} ({}) failed: {}",
            entry.plan_index + 1,
            thread.plan.len(),
            label,
            persona,
            error
        ),
        (None, None) => {}
    }
}

fn print_summary(thread: &Thread) {
    println!(
        "Thread {} {} ({}/{} steps)",
        thread.id,
        thread.status,
        thread.outputs.completed(),
        thread.plan.len()
    );
    if let Some(failure) = &thread.failure {
        println!("Failure: {}", failure.message);
    }
    if let Some(last) = thread.conductor_summaries.last() {
        match (&last.summary, &last.error) {
            (Some(summary), _) => println!("Conductor: {}", summary),
            (None, Some(error)) => println!("Conductor failed: {}", error),
            (None, None) => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Stored records
// ─────────────────────────────────────────────────────────────────

async fn handle_schemas_command(app: &App, subcommand: SchemasSubcommand) -> Result<()> {
    match subcommand {
        SchemasSubcommand::List => {
            let buckets = app.builder.list_visible(Some(app.user())).await?;
            for (title, schemas) in [
                ("Owned", &buckets.owned),
                ("Shared with you", &buckets.shared),
                ("Public", &buckets.public),
            ] {
                println!("{}:", title);
                if schemas.is_empty() {
                    println!("  (none)");
                }
                for s in schemas {
                    println!(
                        "  {}  {} v{} [{}] by {}",
                        s.id, s.name, s.version, s.access_level, s.owner
                    );
                }
            }
        }
        SchemasSubcommand::Import { file, personas } => {
            let personas = app.personas(personas.as_deref()).await?;
            let document = read_document(&file)?;
            let schema = app.builder.import(app.user(), document, &personas).await?;
            println!("{}", schema.id);
        }
        SchemasSubcommand::Save {
            file,
            name,
            access,
            allow,
            assign,
            personas,
        } => {
            let personas = app.personas(personas.as_deref()).await?;
            let document = read_document(&file)?;
            let request = SaveSchemaRequest {
                name: name.unwrap_or_else(|| document.name.clone()),
                access_level: access.into(),
                allowed_user_emails: allow,
            };
            let mut draft = document.into_draft();
            assign_all(&mut draft, &assign, &personas)?;
            let schema = app.builder.save(app.user(), &draft, &request, &personas).await?;
            println!("{}", schema.id);
        }
        SchemasSubcommand::NewVersion {
            id,
            file,
            assign,
            personas,
        } => {
            let personas = app.personas(personas.as_deref()).await?;
            let mut draft = read_document(&file)?.into_draft();
            assign_all(&mut draft, &assign, &personas)?;
            let schema = app
                .builder
                .save_new_version(app.user(), &id, &draft, &personas)
                .await?;
            println!("{}  v{}", schema.id, schema.version);
        }
        SchemasSubcommand::Export { id, output } => {
            let schema = app.builder.load(Some(app.user()), &id).await?;
            let json = schema.export().to_json()?;
            match output {
                Some(path) => fs::write(&path, json).map_err(|e| Error::IoWrite {
                    path: path.into(),
                    source: e,
                })?,
                None => println!("{}", json),
            }
        }
    }
    Ok(())
}

async fn handle_personas_command(app: &App, subcommand: PersonasSubcommand) -> Result<()> {
    match subcommand {
        PersonasSubcommand::List => {
            let personas = app.personas(None).await?;
            for p in personas.list() {
                println!(
                    "{}  {} ({}) creativity={} adherence={} v{}",
                    p.id, p.nickname, p.model_ref, p.creativity, p.adherence, p.version
                );
            }
        }
        PersonasSubcommand::Import { file } => {
            let personas = PersonaRegistry::load_file(Path::new(&file))?;
            personas.save_to_store(app.store.as_ref()).await?;
            println!("Imported {} personas.", personas.len());
        }
        PersonasSubcommand::Revise {
            id,
            nickname,
            model,
            creativity,
            adherence,
            definition,
        } => {
            let personas = app.personas(None).await?;
            let revised = personas.revise(
                &id,
                PersonaUpdate {
                    nickname,
                    model_ref: model,
                    creativity,
                    adherence,
                    definition,
                },
            )?;
            save_record(app.store.as_ref(), collections::PERSONAS, &revised.id, &revised).await?;
            println!("{}  v{}", revised.id, revised.version);
        }
    }
    Ok(())
}

async fn handle_thread_command(app: &App, subcommand: ThreadSubcommand) -> Result<()> {
    let engine = ExecutionEngine::new(
        app.store.clone(),
        Arc::new(InvokerRegistry::mock()),
        Arc::new(PersonaRegistry::new()),
        EngineConfig::from(&app.config),
    );
    match subcommand {
        ThreadSubcommand::Show { id, json } => {
            let thread = engine.load_thread(Some(app.user()), &id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&thread)?);
            } else {
                for entry in thread.outputs.entries() {
                    print_entry(&thread, entry);
                }
                print_summary(&thread);
            }
        }
        ThreadSubcommand::List => {
            for t in engine.list_threads(Some(app.user())).await? {
                println!(
                    "{}  schema={} {} {}/{} owner={}",
                    t.id,
                    t.schema_id,
                    t.status,
                    t.outputs.completed(),
                    t.plan.len(),
                    t.owner
                );
            }
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(config_path: Option<&str>, subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = SimphoniConfig::load(config_path)?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate => {
            SimphoniConfig::load(config_path)?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
