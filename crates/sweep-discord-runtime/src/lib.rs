//! Discord transport for the sweep deletion engine.
//!
//! Provides the REST client that backs the engine's channel log and message
//! store, the gateway session that receives chat commands, and the runtime
//! loop that turns `!d` / `!cancel` commands into registry-guarded runs.

mod discord_runtime;

pub use discord_runtime::*;
