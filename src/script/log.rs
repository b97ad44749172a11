//! Logging primitive exposed to scripts.
//!
//! Scripts get a global `log` table whose methods route through the host's
//! `log` facade under the `script` target, so script output lands in the
//! same stderr stream, with the same filtering, as native diagnostics.
//!
//! ```lua
//! log.info("listening")
//! log.warn("client misbehaving: " .. conn.nc)
//! ```

use anyhow::{anyhow, Result};
use log::Level;
use mlua::Lua;

/// Register the global `log` table (`error`, `warn`, `info`, `debug`).
pub fn register(lua: &Lua) -> Result<()> {
    let table = lua
        .create_table()
        .map_err(|e| anyhow!("failed to create log table: {e}"))?;

    for (name, level) in [
        ("error", Level::Error),
        ("warn", Level::Warn),
        ("info", Level::Info),
        ("debug", Level::Debug),
    ] {
        let f = lua
            .create_function(move |_, msg: String| {
                log::log!(target: "script", level, "{msg}");
                Ok(())
            })
            .map_err(|e| anyhow!("failed to create log.{name}: {e}"))?;
        table
            .set(name, f)
            .map_err(|e| anyhow!("failed to set log.{name}: {e}"))?;
    }

    lua.globals()
        .set("log", table)
        .map_err(|e| anyhow!("failed to register log table: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{Function, Table};

    #[test]
    fn test_log_table_registered() {
        let lua = Lua::new();
        register(&lua).expect("Should register log table");
        let table: Table = lua.globals().get("log").expect("log table should exist");
        for name in ["error", "warn", "info", "debug"] {
            let _: Function = table.get(name).expect("level function should exist");
        }
    }

    #[test]
    fn test_log_callable_from_script() {
        let lua = Lua::new();
        register(&lua).expect("Should register log table");
        lua.load(r#"log.info("hello from lua")"#)
            .exec()
            .expect("log.info should be callable");
    }
}
