// The core module contains all business logic.
// Nothing in here knows about HTTP, Google or the stdio protocol; it only
// talks to the outside world through the traits in `agent_ports`.

#[path = "agent/mod.rs"]
pub mod agent;
