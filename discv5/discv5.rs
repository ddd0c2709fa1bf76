//! # discv5
//!
//! A standalone implementation of Discovery v5 (discv5), a UDP-based
//! Kademlia-style peer discovery protocol over authenticated, encrypted
//! sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Discv5Service                          │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌─────────────┐  │
//! │  │ sessions  │  │ routing   │  │ requests  │  │  lookups    │  │
//! │  │ (session) │  │  table    │  │ (engine)  │  │ (iterative) │  │
//! │  └───────────┘  └───────────┘  └───────────┘  └─────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//!                               │
//!                        UDP transport
//! ```
//!
//! ## Key modules
//!
//! - [`node`]: `NodeId`, `Enr`, `LocalEnr`, XOR distance.
//! - [`crypto`]: pluggable crypto provider (HKDF, AES-GCM, ECDH, signatures).
//! - [`packet`]: wire codec, header masking, encode/decode.
//! - [`session`]: session key derivation and the per-peer handshake FSM.
//! - [`message`]: RLP message payloads (PING/PONG/FINDNODE/NODES/TALKREQ/TALKRESP).
//! - [`routing_table`]: Kademlia buckets.
//! - [`requests`]: request/response engine with retries and NODES aggregation.
//! - [`lookup`]: iterative FINDNODE lookup.
//! - [`service`]: the orchestrator tying everything together.
//! - [`config`]: tunables.
//! - [`error`]: per-subsystem error types.
//! - [`metrics`]: exported counters/gauges.
pub mod config;
pub mod crypto;
pub mod error;
pub mod lookup;
pub mod message;
pub(crate) mod metrics;
pub mod node;
pub mod packet;
pub mod requests;
pub mod routing_table;
pub mod service;
pub mod session;

pub use config::Discv5Config;
pub use error::Discv5Error;
pub use node::{Enr, LocalEnr, NodeId};
pub use service::{Discv5Event, Discv5Service};
