//! Lua side of the bridge.
//!
//! A fresh Lua state is created for every run of the script file and torn
//! down with it; nothing survives a reload. The script drives everything
//! through the `NetEventManager` factory:
//!
//! ```text
//! ScriptRuntime
//!  ├── Lua state (mlua)
//!  ├── BindingContext (shared with every native closure)
//!  │    ├── script path + termination-signal word
//!  │    ├── native server slots (capability ids)
//!  │    └── send/discard request queue
//!  └── Primitives
//!       ├── NetEventManager (server factory + run loop)
//!       ├── connection send/discard (Lua registry)
//!       └── log (error, warn, info, debug)
//! ```
//!
//! Native servers live in the context's slot table between the factory call
//! and `run()`, which takes ownership for the duration of the loop. Script
//! code never sees more than the slot id.

pub mod dispatch;
pub mod log;
pub mod runtime;
pub mod server;
pub mod watcher;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::mux::MuxServer;

use self::dispatch::NativeRequest;

pub use runtime::ScriptRuntime;
pub use watcher::ScriptWatcher;

/// State shared between the run loop and the native closures registered in
/// Lua. One per [`ScriptRuntime`]; closures hold it via `Rc` (the whole
/// bridge is single-threaded).
#[derive(Debug)]
pub struct BindingContext {
    script_path: PathBuf,
    term_signal: Arc<AtomicUsize>,
    servers: RefCell<HashMap<u32, MuxServer>>,
    next_server: Cell<u32>,
    requests: RefCell<Vec<NativeRequest>>,
}

/// Shared handle to a [`BindingContext`].
pub type SharedContext = Rc<BindingContext>;

impl BindingContext {
    /// Create a context for one script execution cycle.
    #[must_use]
    pub fn new(script_path: PathBuf, term_signal: Arc<AtomicUsize>) -> SharedContext {
        Rc::new(Self {
            script_path,
            term_signal,
            servers: RefCell::new(HashMap::new()),
            next_server: Cell::new(1),
            requests: RefCell::new(Vec::new()),
        })
    }

    /// Path of the executing script file, watched for reload.
    #[must_use]
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Process-wide termination-signal word (0 = no signal observed).
    #[must_use]
    pub fn term_signal(&self) -> &Arc<AtomicUsize> {
        &self.term_signal
    }

    /// Park a native server, returning the capability id under which the
    /// script object refers to it.
    pub fn store_server(&self, server: MuxServer) -> u32 {
        let id = self.next_server.get();
        self.next_server.set(id + 1);
        self.servers.borrow_mut().insert(id, server);
        id
    }

    /// Take a parked native server out of its slot. Each id yields its
    /// server at most once; stale ids return `None`.
    pub fn take_server(&self, id: u32) -> Option<MuxServer> {
        self.servers.borrow_mut().remove(&id)
    }

    /// Queue a `send`/`discard` request for the dispatcher to apply after
    /// the current callback returns.
    pub fn push_request(&self, request: NativeRequest) {
        self.requests.borrow_mut().push(request);
    }

    /// Take all queued requests, in call order.
    pub fn drain_requests(&self) -> Vec<NativeRequest> {
        std::mem::take(&mut *self.requests.borrow_mut())
    }
}
