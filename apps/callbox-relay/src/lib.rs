//! Signaling relay: maps registered endpoint ids to live WebSockets and
//! forwards targeted messages between them, stamping the sender's id.

pub mod config;
pub mod relay;
pub mod server;
pub mod telemetry;

pub use config::{Cli, LogFormat, RelayConfig};
pub use relay::{Connection, FrameOutcome, RelayError, RelayState};
pub use server::serve;
