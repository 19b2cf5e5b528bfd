#![forbid(unsafe_code)]

//! User-space ACNET multiplexing daemon.
//!
//! One daemon process owns one or more virtual ACNET nodes and routes the
//! three legacy datagram kinds - unsolicited messages, requests, and
//! replies - between local clients on the loopback command channel,
//! TCP-fronted remote clients, and peer daemons on the network UDP port.
//!
//! Module layout mirrors the moving parts:
//! - [`idpool`] / [`deadline`]: the bounded id allocator and the
//!   expiration-ordered queues built on it,
//! - [`nodetable`]: trunk/node to name/address mapping and self identity,
//! - [`reqpool`] / [`rpypool`]: in-flight request and reply state,
//! - [`task`] / [`taskpool`]: attached clients per virtual node,
//! - [`dispatcher`] / [`command`] / [`service`]: the three packet entry
//!   points (peers, clients, the internal diagnostic task),
//! - [`daemon`]: the single-threaded event loop tying it together.

pub mod command;
pub mod config;
pub mod daemon;
pub mod deadline;
pub mod dispatcher;
pub mod idpool;
pub mod nodetable;
pub mod report;
pub mod reqpool;
pub mod rpypool;
pub mod service;
pub mod stats;
pub mod task;
pub mod taskpool;
pub mod transport;

#[cfg(test)]
mod scenario_tests;

pub use config::DaemonConfig;
pub use daemon::Daemon;
