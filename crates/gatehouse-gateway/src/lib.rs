//! Gatehouse control plane.
//!
//! The gateway hosts the WebSocket and HTTP server, authenticates peers,
//! meters traffic through the admission stack (rate limiters, priority
//! queue, governors), runs tasks, and parks tool calls on durable
//! interrupts until an outside party resumes them.

pub mod admission;
pub mod connection;
pub mod events;
pub mod executor;
pub mod governor;
pub mod hooks;
pub mod interrupts;
pub mod methods;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod rate_limit;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod tasks;

pub use server::{router, start_gateway};
pub use state::GatewayState;
