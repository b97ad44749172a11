//! netlua binary: run a Lua script that drives a TCP server.
//!
//! Usage: `netlua <script.lua>`. The script is re-executed from scratch
//! whenever its file changes on disk; SIGINT/SIGTERM terminate the
//! process. Diagnostics go to stderr (filter with `RUST_LOG`).

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use netlua::Supervisor;

/// Scriptable TCP server driven by Lua lifecycle callbacks.
#[derive(Parser)]
#[command(name = "netlua", version)]
struct Cli {
    /// Path to the Lua script controlling the server.
    script: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let supervisor = Supervisor::new(cli.script);
    supervisor.install_signal_handlers()?;
    supervisor.run()
}
