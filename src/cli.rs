//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for Simphoni.

use clap::{Parser, Subcommand, ValueEnum};

use crate::schema::AccessLevel;

/// Simphoni - instruct sequence runner
///
/// Expands saved schemas into execution plans and runs them step by step
/// against persona-configured models.
#[derive(Parser, Debug)]
#[command(name = "simphoni")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, env = "SIMPHONI_CONFIG", global = true)]
    pub config: Option<String>,

    /// Act as this user instead of the configured one
    #[arg(long, env = "SIMPHONI_USER", global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a schema file or a stored schema to completion
    Run {
        /// Schema document (JSON) or id of a stored schema
        schema: String,

        /// Persona array (JSON); defaults to the stored personas
        #[arg(short, long)]
        personas: Option<String>,

        /// Backend for every model: openai, ollama or mock
        #[arg(short, long)]
        backend: Option<String>,

        /// Summarize outputs with this model
        #[arg(long)]
        conductor: Option<String>,

        /// Print the finished thread as JSON
        #[arg(long)]
        json: bool,

        /// Pause after every step and wait for Enter before continuing
        #[arg(long)]
        step: bool,
    },

    /// Check a schema document without running it
    Validate {
        /// Schema document (JSON)
        schema: String,

        /// Persona array (JSON); defaults to the stored personas
        #[arg(short, long)]
        personas: Option<String>,
    },

    /// Print the execution plan a schema expands to
    Expand {
        /// Schema document (JSON)
        schema: String,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stored schema management
    Schemas {
        #[command(subcommand)]
        subcommand: SchemasSubcommand,
    },

    /// Stored persona management
    Personas {
        #[command(subcommand)]
        subcommand: PersonasSubcommand,
    },

    /// Inspect persisted threads
    Thread {
        #[command(subcommand)]
        subcommand: ThreadSubcommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Schema subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SchemasSubcommand {
    /// List schemas visible to the current user
    List,

    /// Import a schema document as a new schema owned by the current user
    Import {
        /// Schema document (JSON)
        file: String,

        /// Persona array (JSON); defaults to the stored personas
        #[arg(short, long)]
        personas: Option<String>,
    },

    /// Save a schema document with an explicit name and sharing policy
    Save {
        /// Schema document (JSON)
        file: String,

        /// Schema name; defaults to the document's name
        #[arg(long)]
        name: Option<String>,

        /// Who may see and run the schema
        #[arg(long, value_enum, default_value_t = AccessArg::Private)]
        access: AccessArg,

        /// Email of a user allowed to use an Exclusive schema (repeatable)
        #[arg(long = "allow")]
        allow: Vec<String>,

        /// Bind a persona to a step, as STEP=PERSONA (repeatable)
        #[arg(long = "assign", value_parser = parse_assignment)]
        assign: Vec<(String, String)>,

        /// Persona array (JSON); defaults to the stored personas
        #[arg(short, long)]
        personas: Option<String>,
    },

    /// Store a document's steps as the next version of a schema you own
    NewVersion {
        /// Id of the schema being replaced
        id: String,

        /// Schema document (JSON) with the new steps
        file: String,

        /// Bind a persona to a step, as STEP=PERSONA (repeatable)
        #[arg(long = "assign", value_parser = parse_assignment)]
        assign: Vec<(String, String)>,

        /// Persona array (JSON); defaults to the stored personas
        #[arg(short, long)]
        personas: Option<String>,
    },

    /// Export a stored schema as a document
    Export {
        /// Schema id
        id: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Persona subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum PersonasSubcommand {
    /// List stored personas
    List,

    /// Store every persona of a persona array
    Import {
        /// Persona array (JSON)
        file: String,
    },

    /// Store a new version of a persona; the old one is kept
    Revise {
        /// Persona id
        id: String,

        #[arg(long)]
        nickname: Option<String>,

        /// Model reference, e.g. "mistral:7b"
        #[arg(long)]
        model: Option<String>,

        /// Creativity (1-10)
        #[arg(long)]
        creativity: Option<u8>,

        /// Adherence (1-10)
        #[arg(long)]
        adherence: Option<u8>,

        /// Instruction text placed before every step prompt
        #[arg(long)]
        definition: Option<String>,
    },
}

/// Thread subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ThreadSubcommand {
    /// Show one thread's status and outputs
    Show {
        /// Thread id
        id: String,

        /// Print the thread as JSON
        #[arg(long)]
        json: bool,
    },

    /// List threads visible to the current user
    List,
}

/// Access level as typed on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessArg {
    Private,
    Exclusive,
    Public,
}

impl From<AccessArg> for AccessLevel {
    fn from(arg: AccessArg) -> Self {
        match arg {
            AccessArg::Private => AccessLevel::Private,
            AccessArg::Exclusive => AccessLevel::Exclusive,
            AccessArg::Public => AccessLevel::Public,
        }
    }
}

fn parse_assignment(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(step, persona)| (step.trim(), persona.trim()))
        .filter(|(step, persona)| !step.is_empty() && !persona.is_empty())
        .map(|(step, persona)| (step.to_string(), persona.to_string()))
        .ok_or_else(|| format!("expected STEP=PERSONA, got '{}'", value))
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show,

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration
    Validate,
}
