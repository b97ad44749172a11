//! Process supervision: signal state and the restart-on-reload loop.
//!
//! The supervisor owns the one piece of process-wide mutable state this
//! program has: an atomic word that signal handlers write the signal number
//! into and that everything else only reads. Around it sits the outer
//! driver — create a fresh script runtime, execute the script, tear the
//! runtime down, repeat — which is what turns a script-file change into a
//! full restart: the run loop inside the script merely returns, and the
//! next cycle re-executes the new file with nothing carried over.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use crate::script::ScriptRuntime;

/// Pause between script runs when no signal is pending, so a script that
/// exits immediately cannot hot-spin the restart loop.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Owns the termination-signal word and reruns the script until a signal
/// arrives.
#[derive(Debug)]
pub struct Supervisor {
    script_path: PathBuf,
    term_signal: Arc<AtomicUsize>,
}

impl Supervisor {
    /// Create a supervisor for `script_path`. No signal handlers are
    /// installed yet.
    #[must_use]
    pub fn new(script_path: PathBuf) -> Self {
        Self {
            script_path,
            term_signal: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The shared termination word: 0 until a signal arrives, then the
    /// signal number. Writable from signal context, read-only elsewhere.
    #[must_use]
    pub fn termination_flag(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.term_signal)
    }

    /// Install `SIGINT`/`SIGTERM` handlers that record the signal number
    /// into the termination word and do nothing else.
    pub fn install_signal_handlers(&self) -> Result<()> {
        for sig in [SIGINT, SIGTERM] {
            signal_hook::flag::register_usize(
                sig,
                Arc::clone(&self.term_signal),
                sig as usize,
            )
            .with_context(|| format!("failed to install handler for signal {sig}"))?;
        }
        Ok(())
    }

    /// Run script cycles until a termination signal is recorded, then log
    /// which signal ended the process.
    pub fn run(&self) -> Result<()> {
        while self.term_signal.load(Ordering::Relaxed) == 0 {
            self.run_cycle()?;
            if self.term_signal.load(Ordering::Relaxed) == 0 {
                std::thread::sleep(RESTART_DELAY);
            }
        }
        log::info!(
            "terminating on signal {}",
            self.term_signal.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// One full cycle: fresh runtime, execute the script, tear down.
    /// Script errors are logged and end the cycle without ending the
    /// supervisor; only a failure to build the runtime itself is fatal.
    pub fn run_cycle(&self) -> Result<()> {
        let runtime = ScriptRuntime::new(
            self.script_path.clone(),
            Arc::clone(&self.term_signal),
        )
        .context("failed to create script runtime")?;

        if let Err(e) = runtime.exec() {
            log::error!("{e:#}");
        }
        // The runtime (and with it every script value and native server)
        // is dropped here, once per cycle.
        Ok(())
    }
}
