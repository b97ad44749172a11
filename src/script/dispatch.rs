//! Event dispatch and connection lifecycle.
//!
//! Translates [`MuxEvent`]s into Lua callback invocations and keeps the
//! script-visible connection objects in lockstep with their native
//! counterparts. The server object's `connections` table is the sole owner
//! of connection objects: registration inserts there, dispatch resolves
//! through there, and deregistration removes from there. Lua's GC keeps a
//! registered object alive for exactly as long as its native connection.
//!
//! # Callback protocol
//!
//! Handlers are plain fields on the server object (`onaccept`, `onmessage`,
//! `onpoll`, `onclose`) and are invoked as methods: `handler(server, conn)`.
//! Before every invocation the connection's `data` field is set to the
//! current inbound buffer contents; `data` is only meaningful for the
//! duration of that call. A truthy return value marks the native connection
//! finished-sending, closing it once its outbound buffer drains. A handler
//! error is logged with the handler's name and never stops the loop.
//!
//! # send/discard
//!
//! The two connection methods run only inside a dispatched callback, so
//! they queue requests on the shared context; [`dispatch`] applies the
//! queue right after the callback returns, before the next event. Nothing
//! executes in between, so scripts cannot observe the difference from
//! direct mutation.

use mlua::{Function, Lua, Table, Value, Variadic};

use crate::mux::{ConnId, MuxEvent, MuxServer};

use super::SharedContext;

/// Upper bound, in bytes, on the textual form of a single `send()`
/// argument. Longer coercions are truncated, not rejected.
pub const SEND_COERCE_LIMIT: usize = 1024;

/// Lua registry names for the shared connection methods.
mod registry_keys {
    /// The `send` method attached to every connection object.
    pub const CONN_SEND: &str = "netlua_conn_send";
    /// The `discard` method attached to every connection object.
    pub const CONN_DISCARD: &str = "netlua_conn_discard";
}

/// A buffer operation requested by a script callback, applied by the
/// dispatcher once the callback returns.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeRequest {
    /// Append bytes to the connection's outbound buffer.
    Send {
        /// Target connection.
        conn: ConnId,
        /// Already-coerced, already-truncated payload.
        bytes: Vec<u8>,
    },
    /// Drop bytes from the front of the connection's inbound buffer.
    Discard {
        /// Target connection.
        conn: ConnId,
        /// Requested count, validated against the buffer at apply time.
        n: f64,
    },
}

/// Create the shared `send`/`discard` functions and park them in the Lua
/// registry; the lifecycle bridge attaches them to every connection object.
pub(crate) fn register_conn_methods(lua: &Lua, ctx: &SharedContext) -> mlua::Result<()> {
    let send_ctx = SharedContext::clone(ctx);
    let send = lua.create_function(
        move |lua, (this, values): (Value, Variadic<Value>)| {
            let Some(id) = resolve_nc(&this) else {
                return Ok(());
            };
            let tostring: Function = lua.globals().get("tostring")?;
            for value in values {
                let text: mlua::String = tostring.call(value)?;
                let mut bytes = text.as_bytes().to_vec();
                bytes.truncate(SEND_COERCE_LIMIT);
                send_ctx.push_request(NativeRequest::Send { conn: id, bytes });
            }
            Ok(())
        },
    )?;
    lua.set_named_registry_value(registry_keys::CONN_SEND, send)?;

    let discard_ctx = SharedContext::clone(ctx);
    let discard = lua.create_function(
        move |_, (this, args): (Value, Variadic<Value>)| {
            let Some(id) = resolve_nc(&this) else {
                return Ok(());
            };
            // Exactly one numeric argument; anything else is a no-op.
            if args.len() != 1 {
                return Ok(());
            }
            let n = match args[0] {
                Value::Integer(i) => i as f64,
                Value::Number(f) => f,
                _ => return Ok(()),
            };
            discard_ctx.push_request(NativeRequest::Discard { conn: id, n });
            Ok(())
        },
    )?;
    lua.set_named_registry_value(registry_keys::CONN_DISCARD, discard)?;

    Ok(())
}

/// Handle one multiplexer event to completion.
pub fn dispatch(
    lua: &Lua,
    ctx: &SharedContext,
    server: &Table,
    mux: &mut MuxServer,
    event: MuxEvent,
) {
    match event {
        MuxEvent::Accept(id) => {
            if let Err(e) = register_connection(lua, server, id) {
                // The connection cannot be represented script-side; force
                // it closed rather than leave it half-registered.
                log::warn!("failed to register connection {id}: {e}");
                if let Some(conn) = mux.connection_mut(id) {
                    conn.mark_close_immediately();
                }
                return;
            }
            call_handler(lua, ctx, server, mux, id, "onaccept");
        }
        MuxEvent::Recv(id) => call_handler(lua, ctx, server, mux, id, "onmessage"),
        MuxEvent::Poll(id) => call_handler(lua, ctx, server, mux, id, "onpoll"),
        MuxEvent::Close(id) => {
            call_handler(lua, ctx, server, mux, id, "onclose");
            deregister_connection(server, id);
            mux.remove_connection(id);
        }
    }
}

/// Build and register the script-visible connection object for `id`.
fn register_connection(lua: &Lua, server: &Table, id: ConnId) -> mlua::Result<()> {
    let conns: Table = server.get("connections")?;
    let conn = lua.create_table()?;
    conn.set("server", server.clone())?;
    conn.set("nc", id.as_u64() as i64)?;
    let send: Function = lua.named_registry_value(registry_keys::CONN_SEND)?;
    conn.set("send", send)?;
    let discard: Function = lua.named_registry_value(registry_keys::CONN_DISCARD)?;
    conn.set("discard", discard)?;
    conns.set(id.to_string(), conn)?;
    Ok(())
}

/// Remove the connection object from its server's `connections` table.
/// Removing an already-absent entry is a no-op.
fn deregister_connection(server: &Table, id: ConnId) {
    if let Ok(conns) = server.get::<Table>("connections") {
        let _ = conns.set(id.to_string(), Value::Nil);
    }
}

/// Invoke the named handler for connection `id`, if the server object has a
/// registered connection for it and the field holds a function; then apply
/// any buffer requests the handler queued.
fn call_handler(
    lua: &Lua,
    ctx: &SharedContext,
    server: &Table,
    mux: &mut MuxServer,
    id: ConnId,
    name: &str,
) {
    let Ok(conns) = server.get::<Table>("connections") else {
        return;
    };
    let Ok(Value::Table(conn)) = conns.get::<Value>(id.to_string()) else {
        // No script object (e.g. registration failed); the event stays a
        // native-level affair.
        return;
    };

    let handler = match server.get::<Value>(name) {
        Ok(Value::Function(f)) => f,
        Ok(Value::Nil) | Err(_) => return,
        Ok(_) => {
            log::warn!("'{name}' is set but not callable; ignoring");
            return;
        }
    };

    // data always reflects the inbound buffer at dispatch time, and is only
    // valid for the duration of this call.
    let inbound = mux.connection(id).map(|c| c.inbound().to_vec()).unwrap_or_default();
    let data = match lua.create_string(&inbound) {
        Ok(s) => s,
        Err(e) => {
            log::error!("error preparing data for {name} handler: {e}");
            return;
        }
    };
    if let Err(e) = conn.set("data", data) {
        log::error!("error preparing data for {name} handler: {e}");
        return;
    }

    match handler.call::<Value>((server.clone(), conn.clone())) {
        Ok(result) => {
            // A truthy return asks for the connection to be closed once
            // everything queued has been flushed.
            if is_truthy(&result) {
                if let Some(c) = mux.connection_mut(id) {
                    c.mark_finished_sending();
                }
            }
        }
        Err(e) => {
            log::error!("error executing {name} handler: {e}");
        }
    }

    apply_requests(ctx, mux);
}

/// Apply queued `send`/`discard` requests in call order. Requests against
/// connections that are no longer resident are dropped silently.
fn apply_requests(ctx: &SharedContext, mux: &mut MuxServer) {
    for request in ctx.drain_requests() {
        match request {
            NativeRequest::Send { conn, bytes } => {
                if let Some(c) = mux.connection_mut(conn) {
                    c.enqueue_outbound(&bytes);
                }
            }
            NativeRequest::Discard { conn, n } => {
                if let Some(c) = mux.connection_mut(conn) {
                    // Valid only for 0 < n <= buffered length; anything
                    // else leaves the buffer untouched.
                    if n > 0.0 && (n as usize) <= c.inbound_len() {
                        c.discard_inbound(n as usize);
                    }
                }
            }
        }
    }
}

/// Lua truthiness: everything except `nil` and `false`.
fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

/// Read a connection capability from a receiver's `nc` field.
fn resolve_nc(receiver: &Value) -> Option<ConnId> {
    let Value::Table(table) = receiver else {
        return None;
    };
    match table.get::<Value>("nc").ok()? {
        Value::Integer(i) if i > 0 => Some(ConnId::from_u64(i as u64)),
        Value::Number(f) if f > 0.0 => Some(ConnId::from_u64(f as u64)),
        _ => None,
    }
}
