//! The `NetEventManager` factory and the server run loop.
//!
//! `NetEventManager(config)` is the script's entry point into the native
//! layer: it creates and binds a native server, then hands the script a
//! plain Lua table carrying everything the script works with — the copied
//! config properties, the `connections` registry, the `srv` capability id,
//! and the bound `run` method.
//!
//! `run()` is where the script blocks: it owns the native server for the
//! duration of the poll loop and returns only on termination signal, script
//! file change, or an invalidated listening socket.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mlua::{Lua, Table, Value};
use thiserror::Error;

use crate::mux::MuxServer;

use super::dispatch;
use super::watcher::ScriptWatcher;
use super::SharedContext;

/// Upper bound on one multiplexer drive. Also bounds how promptly the loop
/// notices a termination signal or a script-file change.
pub const POLL_QUANTUM: Duration = Duration::from_millis(200);

/// Why server creation was aborted. Raised into the script as a Lua error
/// from the factory call; nothing is created on either path.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The configuration value was missing or malformed.
    #[error("invalid server configuration: {0}")]
    Config(String),
    /// The native server could not be set up or bound.
    #[error("failed to bind '{spec}': {source}")]
    Bind {
        /// The stringified address spec.
        spec: String,
        /// Underlying socket error.
        source: io::Error,
    },
}

impl From<CreateError> for mlua::Error {
    fn from(e: CreateError) -> Self {
        mlua::Error::external(e)
    }
}

/// Register the global `NetEventManager` factory.
pub fn register(lua: &Lua, ctx: &SharedContext) -> mlua::Result<()> {
    let factory_ctx = SharedContext::clone(ctx);
    let factory = lua.create_function(move |lua, config: Value| {
        create_server(lua, &factory_ctx, &config)
    })?;
    lua.globals().set("NetEventManager", factory)
}

/// Build a bound server and its script-visible object.
fn create_server(lua: &Lua, ctx: &SharedContext, config: &Value) -> mlua::Result<Table> {
    let Value::Table(config) = config else {
        return Err(CreateError::Config("expected a configuration table".into()).into());
    };
    let spec = match config.get::<Value>("listening_port") {
        Ok(Value::Nil) | Err(_) => {
            return Err(CreateError::Config("'listening_port' is required".into()).into());
        }
        Ok(value) => stringify_port(&value).ok_or_else(|| {
            CreateError::Config("'listening_port' must be a string or number".into())
        })?,
    };

    let mut mux = MuxServer::new().map_err(|source| CreateError::Bind {
        spec: spec.clone(),
        source,
    })?;
    mux.bind(&spec).map_err(|source| CreateError::Bind {
        spec: spec.clone(),
        source,
    })?;
    log::info!("server bound to '{spec}'");

    let server = lua.create_table()?;
    for pair in config.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        server.set(key, value)?;
    }
    server.set("connections", lua.create_table()?)?;

    let run_ctx = SharedContext::clone(ctx);
    let run = lua.create_function(move |lua, this: Table| run_server(lua, &run_ctx, &this))?;
    server.set("run", run)?;
    server.set("srv", ctx.store_server(mux))?;

    Ok(server)
}

/// The poll/reload loop behind `server:run()`.
fn run_server(lua: &Lua, ctx: &SharedContext, this: &Table) -> mlua::Result<()> {
    let slot = match this.get::<Value>("srv") {
        Ok(Value::Integer(i)) if i >= 0 => i as u32,
        _ => return Err(mlua::Error::runtime("server already released")),
    };
    let Some(mut mux) = ctx.take_server(slot) else {
        return Err(mlua::Error::runtime("server already released"));
    };

    match this.get::<Value>("onstart") {
        Ok(Value::Function(f)) => {
            if let Err(e) = f.call::<Value>(this.clone()) {
                log::error!("error executing onstart handler: {e}");
            }
        }
        Ok(Value::Nil) | Err(_) => {}
        Ok(_) => log::warn!("'onstart' is set but not callable; ignoring"),
    }

    let mut watcher = ScriptWatcher::new(ctx.script_path().to_path_buf());
    while mux.is_listening() && ctx.term_signal().load(Ordering::Relaxed) == 0 {
        for event in mux.poll(POLL_QUANTUM) {
            dispatch::dispatch(lua, ctx, this, &mut mux, event);
        }
        if watcher.poll_changed() {
            log::info!(
                "script file {} changed; shutting the server down for reload",
                watcher.path().display()
            );
            break;
        }
    }

    // Dropping the mux here releases the native server — listener,
    // connections and all — exactly once, on every exit path.
    Ok(())
}

/// Coerce the `listening_port` value to an address spec string.
fn stringify_port(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(String::from_utf8_lossy(&s.as_bytes()).into_owned()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(f) if f.fract() == 0.0 => Some((*f as i64).to_string()),
        Value::Number(f) => Some(f.to_string()),
        _ => None,
    }
}
