//! Script runtime lifecycle.
//!
//! A [`ScriptRuntime`] owns one Lua state for exactly one execution of the
//! script file. The supervisor creates a fresh runtime per cycle and drops
//! it afterwards; a reload therefore discards every script value, every
//! connection object, and every native server — nothing is carried across.

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use mlua::Lua;

use super::{dispatch, log as script_log, server, BindingContext, SharedContext};

/// One Lua state plus the native bindings registered into it.
pub struct ScriptRuntime {
    lua: Lua,
    ctx: SharedContext,
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("script_path", &self.ctx.script_path())
            .finish_non_exhaustive()
    }
}

impl ScriptRuntime {
    /// Create a Lua state and register the native surface: the
    /// `NetEventManager` factory, the shared connection methods, and the
    /// `log` table.
    pub fn new(script_path: PathBuf, term_signal: Arc<AtomicUsize>) -> Result<Self> {
        let lua = Lua::new();
        let ctx = BindingContext::new(script_path, term_signal);

        script_log::register(&lua).context("failed to register log primitives")?;
        dispatch::register_conn_methods(&lua, &ctx)
            .map_err(|e| anyhow!("failed to register connection methods: {e}"))?;
        server::register(&lua, &ctx)
            .map_err(|e| anyhow!("failed to register NetEventManager: {e}"))?;

        log::debug!("script runtime created for {}", ctx.script_path().display());
        Ok(Self { lua, ctx })
    }

    /// Load and execute the script file this runtime was created for.
    /// Blocks for as long as the script does (typically inside `run()`).
    pub fn exec(&self) -> Result<()> {
        let path = self.ctx.script_path();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        self.lua
            .load(&source)
            .set_name(path.to_string_lossy())
            .exec()
            .map_err(|e| anyhow!("script error: {e}"))
    }

    /// The underlying Lua state.
    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// The context shared with the native closures.
    #[must_use]
    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }
}
