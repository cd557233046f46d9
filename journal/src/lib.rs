//! Node-local manager for a replicated metadata journal.
//!
//! A [`JournalEnvironment`] binds a node to its replication group, joins or
//! bootstraps the group, catches up with its committed history and then
//! hands out [`CloseSafeSegment`] handles to the journal's segments.

pub mod command;
pub mod config;
pub mod directory;
pub mod environment;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod raft;
pub mod raft_client;
pub mod raft_service;

pub use config::{JournalConfig, NodeConfig, ServerConfig};
pub use directory::Record;
pub use environment::{EnvironmentState, JournalEnvironment};
pub use error::{JournalError, Result};
pub use handle::{CloseSafeSegment, ReadMode};
pub use node::NodeRole;
