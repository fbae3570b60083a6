//! Rampart - Adaptive Rate Limiting and Attack Detection
//!
//! This crate decides, for every inbound request, whether it is admitted, how
//! much quota the caller has left, and whether the caller's recent behavior
//! matches a known attack pattern. Quotas shrink adaptively for callers that
//! look hostile and recover slowly once they behave. Window counters can be
//! shared between nodes over a peer-to-peer gossip mesh, with in-process
//! counters taking over whenever the mesh is unavailable.

pub mod adaptive;
pub mod clock;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod mesh;
pub mod ratelimit;
