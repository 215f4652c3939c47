//! # icelink Agent
//!
//! Controlled-role ICE (RFC 8445) agent for a single-component media stream.
//!
//! This crate provides:
//! - Host candidate gathering, one UDP base per interface address
//! - Server reflexive discovery through a pluggable resolver
//! - Candidate text encoding and strict parsing
//! - The connectivity check state machine (pairing, pruning, freezing,
//!   retransmission, triggered checks, nomination)
//! - A datagram stream over the selected pair
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Agent                                  │
//! │   (tasks: gathering, remote ingestion, checklist loop)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Checklist                                │
//! │   (pairs, triggered queue, selection; no I/O)                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                           Bases                                  │
//! │   (UDP socket + STUN transaction table + data queue)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Signaling is left to the caller: local candidates come out of
//! [`Agent::start`] and remote ones go in through the channel passed to it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod base;
pub mod candidate;
pub mod checklist;
pub mod config;
pub mod error;
pub mod gather;
pub mod pair;
pub mod reflexive;
pub mod stream;

pub use agent::Agent;
pub use base::{Base, Datagram, InboundHandler, StunHandler};
pub use candidate::{
    COMPONENT_RTP, Candidate, CandidateType, MAX_PRIORITY, TransportAddress, TransportProtocol,
    candidate_priority,
};
pub use checklist::{CheckAction, Checklist, Rejection, Selection};
pub use config::{AgentConfig, CheckTiming, Credentials};
pub use error::{IceError, Result};
pub use pair::{CandidatePair, PairKey, PairState, pair_priority};
pub use reflexive::{ReflexiveResolver, StunResolver};
pub use stream::DataStream;
