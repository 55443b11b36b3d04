//! Server module
//!
//! Testable startup and shutdown for the connection provider's HTTP and
//! WebSocket surface.

pub mod startup;

pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
