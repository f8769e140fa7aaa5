//! CLI domain: parse, route, and output only.
//! No domain orchestration; single route table dispatches to pipeline services.

mod output;
mod parse;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use route::{run_init, RunContext};
