//! Node agent and agent client for kubetail
//!
//! The agent runs on every node and serves log file listings, watches and
//! record streams for that node over a multiplexed line-delimited JSON
//! protocol. The client side pools one connection per node and fans
//! requests out across nodes.

mod connection;
mod dispatcher;
mod error;
mod protocol;
mod server;

pub use connection::{AgentConnection, AgentStream};
pub use dispatcher::{
    AgentIo, AgentResolver, BoxedIo, ConnectionManager, PortForwardResolver, ServiceResolver,
    StaticResolver,
};
pub use error::{AgentError, Result};
pub use protocol::{
    AgentItem, AgentRequest, ErrorKind, Frame, FrameReader, FrameWriter, RemoteError,
};
pub use server::AgentServer;
