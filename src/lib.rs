//! Scriptable TCP server: Lua lifecycle callbacks over a non-blocking
//! socket event loop.
//!
//! A user-supplied Lua script builds a server through the global
//! `NetEventManager` factory, attaches callbacks, and hands control to the
//! native layer:
//!
//! ```lua
//! local srv = NetEventManager({ listening_port = 8080 })
//!
//! srv.onmessage = function(self, conn)
//!     conn:send(conn.data)
//!     conn:discard(#conn.data)
//! end
//!
//! srv:run()
//! ```
//!
//! The native layer drives the sockets single-threaded in 200 ms quanta,
//! dispatching `onstart`/`onaccept`/`onmessage`/`onpoll`/`onclose` as
//! events arrive, and restarts the whole runtime when the script file
//! changes on disk. SIGINT/SIGTERM end the process cleanly.
//!
//! Crate layout: [`mux`] is the socket side (listener, per-connection
//! buffers, bounded poll); [`script`] is the Lua side (runtime, factory,
//! event dispatch, reload watcher); [`supervisor`] ties them together with
//! the restart loop and signal state.

pub mod mux;
pub mod script;
pub mod supervisor;

pub use supervisor::Supervisor;
