//! ridge-services — the pieces every Ridge node is built from: the message
//! transport, the controller's cluster table, and a server's chunk storage.

pub mod cluster;
pub mod inventory;
pub mod messenger;
pub mod store;

pub use cluster::{ClusterState, NodeRecord, TableError};
pub use inventory::ChunkInventory;
pub use messenger::{Event, Messenger, TransportError};
pub use store::ChunkStore;
