//! Single-threaded non-blocking TCP multiplexer.
//!
//! This module is the socket side of the house and knows nothing about
//! scripting. It owns the listener and every accepted connection, buffers
//! inbound and outbound bytes per connection, and reports all activity as
//! [`MuxEvent`]s from a bounded [`poll`](MuxServer::poll) quantum. The
//! scripting layer consumes those events and manipulates connections only
//! through their [`ConnId`]s.

pub mod buffer;
pub mod connection;
pub mod server;

pub use buffer::Buffer;
pub use connection::{ConnId, Connection};
pub use server::{MuxEvent, MuxServer};
