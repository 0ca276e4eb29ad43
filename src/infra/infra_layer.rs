// The infra module contains implementations of core traits.
// Each adapter goes in its own submodule.

#[path = "ai/mod.rs"]
pub mod ai;

#[path = "http/mod.rs"]
pub mod http;

#[path = "google/mod.rs"]
pub mod google;
