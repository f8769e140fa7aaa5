//! Quizgen: Asynchronous AI Question Generation
//!
//! A durable task queue, a bounded worker pool and a progress store around pluggable
//! AI providers. Small requests are generated inline; larger ones are queued and
//! tracked by task id.

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod init;
pub mod logging;
pub mod progress;
pub mod provider;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod transport;
pub mod types;

pub use error::GenerationError;
pub use service::{GenerateOutcome, GenerationService};
