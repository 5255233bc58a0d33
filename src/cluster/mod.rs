pub mod agent;
pub mod assemble;
pub mod broadcast;
pub mod config;
pub mod contact;
pub mod depict;
pub mod error;
pub mod grid;
pub mod handle;
pub mod hex;
pub mod net;
pub mod node;
pub mod partition;
pub mod proxy;
pub mod ranges;
pub mod renderer;
pub mod scene;
pub mod space;
pub mod table;
pub mod transform;

#[cfg(test)]
mod testkit;

pub use agent::{AgentMessage, AgentResponse, AgentTemplate, ComputeAgent, PrepareAction};
pub use config::ClusterConfig;
pub use contact::{AgentContact, Link, NodeLink};
pub use error::{Error, Result};
pub use handle::ClusterDataHandle;
pub use node::{DataSource, Node};
pub use partition::SpatialPartition;
pub use renderer::{ClientRenderer, UserRenderer};
pub use table::ClusterTable;

// A session is one client and N worker nodes. The client holds a handle
// whose partition maps every point to a worker slot, and a table with one
// endpoint per slot plus its own endpoint last, which owns whatever the
// partition cannot place.

// Nothing moves data between participants. The client ships small compute
// agents to the nodes, each agent depicts the node's local data into a
// scene fragment, and the client composes the fragments. A broadcast round
// waits on every slot under a single deadline; late or failed slots simply
// don't appear in that round's scene, and a disconnected slot is dropped
// for the rest of the session.

// Worker-side state lives in one task per agent, so a slow transform on one
// agent never blocks another agent on the same node.
