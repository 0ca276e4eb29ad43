// Server layer - JSON-RPC tool surface over stdio.
//
// Clients (desktop assistants, scripts) speak line-delimited JSON-RPC 2.0 on
// stdin/stdout. Every log line goes to stderr so stdout carries protocol
// messages only.

#[path = "protocol.rs"]
pub mod protocol;

#[path = "tools.rs"]
pub mod tools;

#[path = "resources.rs"]
pub mod resources;

#[path = "dispatcher.rs"]
pub mod dispatcher;

pub use dispatcher::AgentServer;
