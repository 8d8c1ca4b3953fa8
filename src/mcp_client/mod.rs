//! MCP client: transports, sessions, and connection management.
//!
//! This module handles:
//! - JSON-RPC 2.0 over stdio, streamable HTTP, and legacy HTTP+SSE
//! - The initialize handshake and the list/call methods
//! - Negotiating a transport for remote servers
//! - Spawning, watching, and stopping local server processes
//! - Caching one live session per service id
//!
//! The capability dispatcher is the only intended caller.

pub mod capabilities;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod negotiator;
pub mod registry;
pub mod session;
pub mod sse;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::{McpError, TransportAttempt};
pub use lifecycle::{LocalProcessSupervisor, LocalServerInfo, ProcessState};
pub use negotiator::{build_request_headers, RemoteTransportNegotiator};
pub use registry::{AccessTokenSource, ServiceClient, ServiceConnectionRegistry};
pub use session::{McpSession, SessionSettings};
pub use types::{
    CapabilitySet, PromptArgument, ServicePrompt, ServiceResource, ServiceTool, TransportKind,
};
