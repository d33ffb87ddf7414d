//! Core of a single raft replica: durable log and metadata storage,
//! the event-loop role state machine (follower/candidate/leader), and
//! a small in-memory key-value machine applied from the committed log.
//!
//! The transport and CLI binaries are a reference wiring of these
//! pieces over TCP; an embedder is free to drive [`node::Node`]
//! through its own transport by implementing [`requester::PeerRequester`].

pub mod command;
pub mod config;
pub mod error;
pub mod log_view;
pub mod node;
pub mod requester;
pub mod role;
pub mod store;
pub mod transport;
