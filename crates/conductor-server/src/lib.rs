//! HTTP and WebSocket surface for the conductor engine.

pub mod client;
pub mod error;
pub mod event_bridge;
pub mod handlers;
pub mod http;
pub mod orchestrator;
pub mod recorder;
pub mod rpc;
pub mod server;

pub use error::ServerError;
pub use orchestrator::{RunManager, StartedRun};
pub use server::{start, ServerConfig, ServerHandle};
