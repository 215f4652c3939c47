//! Candidate pairs

use crate::candidate::{Candidate, TransportAddress};
use icelink_stun::{StunMessage, TransactionId};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Compute pair priority (RFC 8445 Section 6.1.2.3)
///
/// `2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)` where G is the controlling
/// agent's candidate priority and D the controlled agent's. Candidate
/// priorities are at most [`MAX_PRIORITY`](crate::MAX_PRIORITY); larger inputs saturate at
/// `u64::MAX`.
#[must_use]
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let g = u128::from(controlling);
    let d = u128::from(controlled);
    let priority = (g.min(d) << 32) + 2 * g.max(d) + u128::from(g > d);
    u64::try_from(priority).unwrap_or(u64::MAX)
}

/// Connectivity check state of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairState {
    /// Waiting for a sibling in its foundation group to complete
    Frozen,
    /// Eligible for a check
    Waiting,
    /// Binding request outstanding
    InProgress,
    /// Valid response received
    Succeeded,
    /// No valid response within the retransmission budget
    Failed,
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frozen => write!(f, "frozen"),
            Self::Waiting => write!(f, "waiting"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Identity of a pair: the local base it is sent from and the remote
/// transport address. No two pairs in a checklist share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    /// Local base address
    pub base: SocketAddr,
    /// Remote transport address
    pub remote: TransportAddress,
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.base, self.remote)
    }
}

/// Outstanding binding request of a pair
#[derive(Debug, Clone)]
pub(crate) struct Transaction {
    pub(crate) request: StunMessage,
    pub(crate) attempts: u32,
    pub(crate) deadline: Instant,
}

/// A local and a remote candidate checked together
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub(crate) local: Candidate,
    pub(crate) remote: Candidate,
    pub(crate) priority: u64,
    pub(crate) state: PairState,
    pub(crate) nominated: bool,
    pub(crate) use_candidate_received: bool,
    pub(crate) attempts: u32,
    pub(crate) transaction: Option<Transaction>,
}

impl CandidatePair {
    /// Pair `local` with `remote` for the controlled role.
    ///
    /// The remote side is controlling, so its priority is G.
    #[must_use]
    pub fn new(local: Candidate, remote: Candidate) -> Self {
        let priority = pair_priority(remote.priority(), local.priority());
        Self {
            local,
            remote,
            priority,
            state: PairState::Frozen,
            nominated: false,
            use_candidate_received: false,
            attempts: 0,
            transaction: None,
        }
    }

    /// Local candidate
    #[must_use]
    pub fn local(&self) -> &Candidate {
        &self.local
    }

    /// Remote candidate
    #[must_use]
    pub fn remote(&self) -> &Candidate {
        &self.remote
    }

    /// Identity within the checklist
    #[must_use]
    pub fn key(&self) -> PairKey {
        PairKey {
            base: self.local.base_address(),
            remote: self.remote.address(),
        }
    }

    /// Foundation group: local and remote foundations joined
    #[must_use]
    pub fn foundation(&self) -> String {
        format!("{}:{}", self.local.foundation(), self.remote.foundation())
    }

    /// Pair priority
    #[must_use]
    pub fn priority(&self) -> u64 {
        self.priority
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PairState {
        self.state
    }

    /// Whether the peer nominated this pair and it was selected
    #[must_use]
    pub fn is_nominated(&self) -> bool {
        self.nominated
    }

    /// Binding requests sent on this pair, retransmissions included
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Transaction ID of the outstanding request
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|t| t.request.transaction_id)
    }

    /// When the outstanding request is retransmitted or given up on
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transaction.as_ref().map(|t| t.deadline)
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) -> {} ({}) [{}]",
            self.local.socket_addr(),
            self.local.candidate_type(),
            self.remote.socket_addr(),
            self.remote.candidate_type(),
            self.state
        )
    }
}
