//! pulse-mcp: MCP adapter for the Pulse tool executor
//!
//! The LLM runtime reaches Pulse tools through this server only.
//!
//! Methods:
//! - initialize / initialized → handshake
//! - ping → empty object
//! - tools/list → executor.list_tools()
//! - tools/call → executor.execute_tool(), failures as `isError` results
//! - resources/list, prompts/list → empty

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{JsonRpcError, McpRequest, McpResponse};
pub use server::McpServer;
pub use transport::{router, HttpTransport};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "pulse";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
