//! Capability dispatch across remote MCP, local MCP and A2A services.

pub mod a2a;
pub mod backend;
pub mod dispatcher;
pub mod errors;
pub mod response;

pub use a2a::A2aClient;
pub use backend::{A2aBackend, McpBackend, ServiceBackend};
pub use dispatcher::CapabilityDispatcher;
pub use errors::DispatchError;
pub use response::OperationResponse;
