//! CLI parse: clap types for quizgen. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::{Difficulty, QuestionType};

/// Quizgen CLI - asynchronous AI question generation
#[derive(Parser)]
#[command(name = "quizgen")]
#[command(about = "Generate quiz questions through AI providers with a durable task queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off, except for `worker`)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool until Ctrl-C, then drain in-flight tasks
    Worker {
        /// Provider to generate with (defaults to `default_provider`)
        #[arg(long)]
        provider: Option<String>,
    },
    /// Generate questions: inline below the sync threshold, queued otherwise
    Generate {
        /// Owning user id
        #[arg(long)]
        user: String,
        /// Topic to write questions about
        #[arg(long)]
        topic: String,
        /// Number of questions
        #[arg(long)]
        count: u32,
        /// Difficulty (easy, medium, hard)
        #[arg(long, default_value = "medium")]
        difficulty: Difficulty,
        /// Allowed question type; repeat for several (default: multiple_choice)
        #[arg(long = "type", value_name = "TYPE")]
        question_types: Vec<QuestionType>,
        /// Restrict questions to material from this data source
        #[arg(long)]
        data_source: Option<String>,
        /// Question bank the questions are stored under
        #[arg(long)]
        bank: Option<String>,
        /// Provider to generate with (defaults to `default_provider`)
        #[arg(long)]
        provider: Option<String>,
        /// For queued requests, run a scheduler in-process and follow progress
        #[arg(long)]
        wait: bool,
    },
    /// Show the progress record of a task
    Progress {
        /// Owning user id
        #[arg(long)]
        user: String,
        /// Task id returned by `generate`
        task_id: String,
    },
    /// Remove expired progress records
    Purge {
        /// Also remove failed records older than this many seconds
        #[arg(long)]
        failed_older_than: Option<u64>,
    },
    /// Show the number of pending tasks
    Queue,
    /// Write a starter config/config.toml into the workspace
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}
