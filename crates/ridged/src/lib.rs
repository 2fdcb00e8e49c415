//! ridged — the two Ridge node roles.
//!
//! The controller tracks storage servers and replica placement; a server
//! stores chunks, heartbeats to the controller, and repairs corrupted
//! chunks from other replicas.

pub mod controller;
pub mod recovery;
pub mod server;

pub use controller::Controller;
pub use server::Server;
