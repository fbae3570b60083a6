//! Peer mesh networking module using Chitchat.
//!
//! This module implements the peer-to-peer mesh used to share limiter state
//! between Rampart nodes. It uses the chitchat library for gossip-based
//! cluster membership and state dissemination, and exposes the shared state
//! as a [`CounterStore`](crate::ratelimit::CounterStore).

mod cluster;
mod store;

pub use cluster::{Cluster, ClusterConfig, ClusterError, MeshAdmission, StateKey};
pub use store::MeshCounterStore;
