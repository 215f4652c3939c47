//! Connectivity check state machine for the controlled role.
//!
//! The checklist holds no sockets and reads no clock. The agent feeds it
//! candidates, inbound checks and responses, and calls [`Checklist::poll`]
//! on every tick; the checklist answers with the requests to transmit.
//!
//! # Pair Lifecycle
//!
//! ```text
//! Frozen ──→ Waiting ──→ InProgress ──┬→ Succeeded
//!                                     └→ Failed
//! ```
//!
//! A pair is Waiting when it is the first of its foundation group and
//! Frozen otherwise. When a pair completes, the rest of its group thaws.
//! A Succeeded pair the peer nominated with USE-CANDIDATE is selected and
//! the checklist stops.

use crate::candidate::Candidate;
use crate::config::{CheckTiming, Credentials};
use crate::error::{IceError, Result};
use crate::pair::{CandidatePair, PairKey, PairState, Transaction};
use icelink_stun::{StunAttribute, StunError, StunMessage, StunMessageClass, TransactionId};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Transmission the agent must perform
#[derive(Debug, Clone)]
pub enum CheckAction {
    /// First transmission of a check; a response handler for the pair must
    /// be registered with the request's transaction ID
    Send {
        /// Pair being checked
        key: PairKey,
        /// Binding request
        request: StunMessage,
    },
    /// Retransmission of the pair's outstanding request
    Retransmit {
        /// Pair being checked
        key: PairKey,
        /// Same request as the first transmission
        request: StunMessage,
    },
    /// The pair gave up; stop waiting for this transaction
    Cancel {
        /// Base the request was sent from
        base: SocketAddr,
        /// Abandoned transaction
        transaction_id: TransactionId,
    },
}

/// A nominated pair, and the transactions left behind by selecting it
#[derive(Debug, Clone)]
pub struct Selection {
    /// The selected pair
    pub pair: CandidatePair,
    /// Outstanding checks on other pairs, by base
    pub abandoned: Vec<(SocketAddr, TransactionId)>,
}

/// Why an inbound check is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// STUN error code
    pub code: u16,
    /// Reason phrase
    pub reason: &'static str,
}

impl Rejection {
    /// Required attribute missing or malformed
    pub const BAD_REQUEST: Self = Self {
        code: 400,
        reason: "Bad Request",
    };

    /// Wrong username or bad MESSAGE-INTEGRITY
    pub const UNAUTHORIZED: Self = Self {
        code: 401,
        reason: "Unauthorized",
    };

    /// The peer also claims the controlled role
    pub const ROLE_CONFLICT: Self = Self {
        code: 487,
        reason: "Role Conflict",
    };
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

impl From<Rejection> for IceError {
    fn from(rejection: Rejection) -> Self {
        IceError::Authentication(Cow::Owned(rejection.to_string()))
    }
}

/// Checklist of one component
#[derive(Debug)]
pub struct Checklist {
    credentials: Credentials,
    timing: CheckTiming,
    tie_breaker: u64,
    pairs: Vec<CandidatePair>,
    triggered: VecDeque<PairKey>,
    selected: Option<usize>,
    exhausted: bool,
    local_done: bool,
    remote_done: bool,
    started: Instant,
    next_check: Instant,
}

impl Checklist {
    /// Empty checklist started at `now`
    #[must_use]
    pub fn new(credentials: Credentials, timing: CheckTiming, now: Instant) -> Self {
        Self {
            credentials,
            timing,
            tie_breaker: rand::random(),
            pairs: Vec::new(),
            triggered: VecDeque::new(),
            selected: None,
            exhausted: false,
            local_done: false,
            remote_done: false,
            started: now,
            next_check: now,
        }
    }

    /// ICE-CONTROLLED tie-breaker sent with every check
    #[must_use]
    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    /// All pairs
    #[must_use]
    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    /// Pair by key
    #[must_use]
    pub fn pair(&self, key: &PairKey) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.key() == *key)
    }

    /// The selected pair, once nominated
    #[must_use]
    pub fn selected(&self) -> Option<&CandidatePair> {
        self.selected.map(|i| &self.pairs[i])
    }

    /// Whether every pair failed with no input left to add more
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether a pair was selected or the checklist is exhausted
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.selected.is_some() || self.exhausted
    }

    fn index(&self, key: &PairKey) -> Option<usize> {
        self.pairs.iter().position(|p| p.key() == *key)
    }

    // ========================================================================
    // Pair formation
    // ========================================================================

    /// Add the pair `(local, remote)`.
    ///
    /// Returns false when the candidates are incompatible or an existing
    /// pair with the same key wins. An existing pair with lower priority is
    /// only replaced while it is still unchecked.
    pub fn add_pair(&mut self, local: &Candidate, remote: &Candidate) -> bool {
        if self.is_finished() || !local.is_compatible(remote) {
            return false;
        }

        let mut pair = CandidatePair::new(local.clone(), remote.clone());
        let key = pair.key();

        if let Some(i) = self.index(&key) {
            let existing = &mut self.pairs[i];
            let unchecked = matches!(existing.state, PairState::Frozen | PairState::Waiting);
            if !unchecked || existing.priority >= pair.priority {
                tracing::trace!(pair = %key, "Pruned redundant pair");
                return false;
            }
            tracing::debug!(pair = %key, priority = pair.priority, "Replacing pair with higher priority candidates");
            existing.local = pair.local;
            existing.remote = pair.remote;
            existing.priority = pair.priority;
            return true;
        }

        let foundation = pair.foundation();
        pair.state = if self.pairs.iter().any(|p| p.foundation() == foundation) {
            PairState::Frozen
        } else {
            PairState::Waiting
        };
        tracing::debug!(pair = %key, state = %pair.state, priority = pair.priority, "Pair added");
        self.pairs.push(pair);
        true
    }

    /// Pair a new local candidate with every known remote one.
    ///
    /// Returns the number of pairs added.
    pub fn add_local(&mut self, local: &Candidate, remotes: &[Candidate]) -> usize {
        remotes
            .iter()
            .filter(|remote| self.add_pair(local, remote))
            .count()
    }

    /// Pair a new remote candidate with every known local one.
    ///
    /// Returns the number of pairs added.
    pub fn add_remote(&mut self, remote: &Candidate, locals: &[Candidate]) -> usize {
        locals
            .iter()
            .filter(|local| self.add_pair(local, remote))
            .count()
    }

    /// No more local candidates will be gathered
    pub fn set_local_done(&mut self) {
        self.local_done = true;
    }

    /// No more remote candidates will arrive
    pub fn set_remote_done(&mut self) {
        self.remote_done = true;
    }

    // ========================================================================
    // Timer processing
    // ========================================================================

    /// Advance the checklist to `now`.
    ///
    /// Retransmits or fails overdue checks and starts at most one new check
    /// per pacing interval: the oldest triggered check if any, otherwise the
    /// highest-priority Waiting pair.
    ///
    /// # Errors
    ///
    /// `ChecklistExhausted` once every pair failed after both candidate
    /// inputs finished, or the completion timeout passed without a
    /// selection.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<CheckAction>> {
        if self.exhausted {
            return Err(IceError::ChecklistExhausted);
        }
        if self.selected.is_some() {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        self.service_transactions(now, &mut actions);

        let timed_out = self
            .timing
            .completion_timeout
            .is_some_and(|limit| now.saturating_duration_since(self.started) >= limit);
        let all_failed = self.pairs.iter().all(|p| p.state == PairState::Failed);
        if timed_out || (self.local_done && self.remote_done && all_failed) {
            tracing::debug!(pairs = self.pairs.len(), timed_out, "Checklist exhausted");
            self.exhausted = true;
            return Err(IceError::ChecklistExhausted);
        }

        if now >= self.next_check {
            if let Some(action) = self.start_next_check(now) {
                self.next_check = now + self.timing.pacing;
                actions.push(action);
            }
        }

        Ok(actions)
    }

    fn service_transactions(&mut self, now: Instant, actions: &mut Vec<CheckAction>) {
        let mut completed = Vec::new();

        for pair in &mut self.pairs {
            let key = pair.key();
            match pair.next_deadline() {
                Some(deadline) if deadline <= now => {}
                _ => continue,
            }
            let Some(tx) = pair.transaction.as_mut() else {
                continue;
            };

            if tx.attempts >= self.timing.max_attempts {
                let transaction_id = tx.request.transaction_id;
                pair.transaction = None;
                pair.state = PairState::Failed;
                let err = IceError::CheckTimeout {
                    pair: key.to_string(),
                    attempts: pair.attempts,
                };
                tracing::debug!("{}", err);
                actions.push(CheckAction::Cancel {
                    base: key.base,
                    transaction_id,
                });
                completed.push(pair.foundation());
            } else {
                tx.attempts += 1;
                tx.deadline = now + retransmit_timeout(&self.timing, tx.attempts);
                pair.attempts += 1;
                tracing::trace!(pair = %key, attempt = tx.attempts, "Retransmitting check");
                actions.push(CheckAction::Retransmit {
                    key,
                    request: tx.request.clone(),
                });
            }
        }

        for foundation in completed {
            self.thaw_group(&foundation);
        }
    }

    fn start_next_check(&mut self, now: Instant) -> Option<CheckAction> {
        let i = self
            .next_triggered()
            .or_else(|| self.highest_waiting())
            .or_else(|| self.thaw_idle_group())?;

        let request = match self.build_request(&self.pairs[i]) {
            Ok(request) => request,
            Err(e) => {
                let pair = &mut self.pairs[i];
                tracing::warn!(pair = %pair.key(), "Cannot build check: {}", e);
                pair.state = PairState::Failed;
                let foundation = pair.foundation();
                self.thaw_group(&foundation);
                return None;
            }
        };
        let pair = &mut self.pairs[i];
        pair.state = PairState::InProgress;
        pair.attempts += 1;
        pair.transaction = Some(Transaction {
            request: request.clone(),
            attempts: 1,
            deadline: now + self.timing.initial_rto,
        });

        let key = pair.key();
        tracing::debug!(pair = %key, txid = %request.transaction_id, "Starting check");
        Some(CheckAction::Send { key, request })
    }

    fn next_triggered(&mut self) -> Option<usize> {
        while let Some(key) = self.triggered.pop_front() {
            if let Some(i) = self.index(&key) {
                if self.pairs[i].state == PairState::Waiting {
                    return Some(i);
                }
            }
        }
        None
    }

    fn highest_waiting(&self) -> Option<usize> {
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PairState::Waiting)
            .max_by_key(|(_, p)| p.priority)
            .map(|(i, _)| i)
    }

    /// Nothing Waiting: thaw the best Frozen pair whose group has no check
    /// in flight.
    fn thaw_idle_group(&mut self) -> Option<usize> {
        let busy: Vec<String> = self
            .pairs
            .iter()
            .filter(|p| p.state == PairState::InProgress)
            .map(CandidatePair::foundation)
            .collect();

        let i = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PairState::Frozen && !busy.contains(&p.foundation()))
            .max_by_key(|(_, p)| p.priority)
            .map(|(i, _)| i)?;
        self.pairs[i].state = PairState::Waiting;
        Some(i)
    }

    fn thaw_group(&mut self, foundation: &str) {
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen && pair.foundation() == foundation {
                pair.state = PairState::Waiting;
            }
        }
    }

    /// Binding request for a check on `pair`
    fn build_request(&self, pair: &CandidatePair) -> Result<StunMessage> {
        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::Username(
            self.credentials.outbound_username(),
        ));
        request.add_attribute(StunAttribute::Priority(
            pair.local.peer_reflexive_priority(),
        ));
        request.add_attribute(StunAttribute::IceControlled(self.tie_breaker));
        request.add_message_integrity(self.credentials.remote_password.as_bytes())?;
        request.add_fingerprint()?;
        Ok(request)
    }

    // ========================================================================
    // Responses to our checks
    // ========================================================================

    /// Apply the response to the check outstanding on `key`.
    ///
    /// A success response must come from the pair's remote address and
    /// carry MESSAGE-INTEGRITY keyed with the remote password; anything else
    /// fails the pair. Responses to transactions the pair no longer waits
    /// on are ignored.
    pub fn handle_response(
        &mut self,
        key: &PairKey,
        transaction_id: TransactionId,
        response: &StunMessage,
        raw: &[u8],
        from: SocketAddr,
    ) -> Option<Selection> {
        if self.is_finished() {
            return None;
        }
        let i = self.index(key)?;
        let pair = &self.pairs[i];
        if pair.state != PairState::InProgress || pair.transaction_id() != Some(transaction_id) {
            tracing::trace!(pair = %key, txid = %transaction_id, "Ignoring stale response");
            return None;
        }

        let verdict = validate_response(
            &self.credentials,
            response,
            raw,
            from,
            pair.remote.socket_addr(),
        );

        let pair = &mut self.pairs[i];
        pair.transaction = None;
        let foundation = pair.foundation();
        match verdict {
            Ok(()) => {
                pair.state = PairState::Succeeded;
                tracing::debug!(pair = %key, mapped = ?response.mapped_address(), "Check succeeded");
            }
            Err(e) => {
                pair.state = PairState::Failed;
                tracing::debug!(pair = %key, "Check failed: {}", e);
            }
        }
        let nominate = pair.state == PairState::Succeeded && pair.use_candidate_received;
        self.thaw_group(&foundation);

        nominate.then(|| self.select(i))
    }

    // ========================================================================
    // Checks from the peer
    // ========================================================================

    /// Authenticate an inbound Binding request.
    ///
    /// # Errors
    ///
    /// The rejection to answer with: 400 when USERNAME, PRIORITY or
    /// MESSAGE-INTEGRITY is missing or FINGERPRINT is wrong, 401 when the
    /// USERNAME is not ours or MESSAGE-INTEGRITY does not verify with the
    /// local password, 487 when the peer claims the controlled role too.
    pub fn authenticate(&self, request: &StunMessage, raw: &[u8]) -> std::result::Result<(), Rejection> {
        let Some(username) = request.username() else {
            return Err(Rejection::BAD_REQUEST);
        };
        if request.priority().is_none() || !request.has_message_integrity() {
            return Err(Rejection::BAD_REQUEST);
        }
        let has_fingerprint = request
            .attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::Fingerprint(_)));
        if has_fingerprint && StunMessage::verify_fingerprint(raw).is_err() {
            return Err(Rejection::BAD_REQUEST);
        }

        if username != self.credentials.inbound_username() {
            return Err(Rejection::UNAUTHORIZED);
        }
        match StunMessage::verify_message_integrity(raw, self.credentials.local_password.as_bytes()) {
            Ok(()) => {}
            Err(StunError::AuthenticationFailed) => return Err(Rejection::UNAUTHORIZED),
            Err(_) => return Err(Rejection::BAD_REQUEST),
        }

        if request.ice_controlled().is_some() {
            return Err(Rejection::ROLE_CONFLICT);
        }
        Ok(())
    }

    /// Success response to an authenticated check from `from`
    ///
    /// # Errors
    ///
    /// Returns [`IceError::Parse`] if the signed response does not fit a
    /// STUN message.
    pub fn success_response(&self, request: &StunMessage, from: SocketAddr) -> Result<StunMessage> {
        let mut response = StunMessage::binding_success(request, from);
        response.add_message_integrity(self.credentials.local_password.as_bytes())?;
        response.add_fingerprint()?;
        Ok(response)
    }

    /// Error response for a rejected check.
    ///
    /// Only a role conflict passed authentication, so only it is signed.
    ///
    /// # Errors
    ///
    /// Returns [`IceError::Parse`] if the response does not fit a STUN
    /// message.
    pub fn error_response(&self, request: &StunMessage, rejection: Rejection) -> Result<StunMessage> {
        let mut response = StunMessage::binding_error(request, rejection.code, rejection.reason);
        if rejection == Rejection::ROLE_CONFLICT {
            response.add_message_integrity(self.credentials.local_password.as_bytes())?;
        }
        response.add_fingerprint()?;
        Ok(response)
    }

    /// Record an authenticated check from `remote` received on `local`'s
    /// base.
    ///
    /// Creates the pair if needed and schedules a triggered check on it. A
    /// nominated pair whose own check already succeeded is selected at once;
    /// one still in flight is selected when its response arrives.
    pub fn handle_inbound_check(
        &mut self,
        local: &Candidate,
        remote: &Candidate,
        use_candidate: bool,
    ) -> Option<Selection> {
        if self.is_finished() {
            return None;
        }
        self.add_pair(local, remote);

        let key = PairKey {
            base: local.base_address(),
            remote: remote.address(),
        };
        let i = self.index(&key)?;
        let pair = &mut self.pairs[i];
        if use_candidate {
            pair.use_candidate_received = true;
        }
        let (state, nominated) = (pair.state, pair.use_candidate_received);

        match state {
            PairState::Succeeded if nominated => {
                return Some(self.select(i));
            }
            PairState::Frozen | PairState::Waiting => {
                self.pairs[i].state = PairState::Waiting;
                if !self.triggered.contains(&key) {
                    tracing::trace!(pair = %key, "Queued triggered check");
                    self.triggered.push_back(key);
                }
            }
            PairState::Succeeded | PairState::InProgress | PairState::Failed => {}
        }
        None
    }

    fn select(&mut self, i: usize) -> Selection {
        self.selected = Some(i);
        self.triggered.clear();
        self.pairs[i].nominated = true;
        let abandoned = self.abandon_in_flight();
        tracing::info!(pair = %self.pairs[i], "Selected candidate pair");
        Selection {
            pair: self.pairs[i].clone(),
            abandoned,
        }
    }

    /// Drop every outstanding transaction, returning them by base
    pub fn abandon_in_flight(&mut self) -> Vec<(SocketAddr, TransactionId)> {
        self.pairs
            .iter_mut()
            .filter_map(|pair| {
                let tx = pair.transaction.take()?;
                Some((pair.key().base, tx.request.transaction_id))
            })
            .collect()
    }

    /// A base died: every unfinished pair on it fails.
    ///
    /// Returns the number of pairs failed.
    pub fn base_closed(&mut self, base: SocketAddr) -> usize {
        if self.is_finished() {
            return 0;
        }
        let mut failed = 0;
        for pair in &mut self.pairs {
            let unfinished = !matches!(pair.state, PairState::Succeeded | PairState::Failed);
            if unfinished && pair.key().base == base {
                pair.state = PairState::Failed;
                pair.transaction = None;
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(base = %base, failed, "Base closed, pairs failed");
        }
        failed
    }
}

/// Wait after the `attempt`-th transmission: RTO doubled per retry
fn retransmit_timeout(timing: &CheckTiming, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    timing.initial_rto.saturating_mul(1 << doublings)
}

fn validate_response(
    credentials: &Credentials,
    response: &StunMessage,
    raw: &[u8],
    from: SocketAddr,
    remote: SocketAddr,
) -> Result<()> {
    match response.class {
        StunMessageClass::SuccessResponse => {}
        StunMessageClass::ErrorResponse => {
            let (code, reason) = response.error_code().unwrap_or((0, ""));
            return Err(IceError::Authentication(Cow::Owned(format!(
                "peer answered {code} {reason}"
            ))));
        }
        _ => return Err(IceError::parse("response is not a response")),
    }
    if from != remote {
        return Err(IceError::Transport(Cow::Owned(format!(
            "response from {from}, check sent to {remote}"
        ))));
    }
    StunMessage::verify_message_integrity(raw, credentials.remote_password.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateType;

    const LOCAL_PWD: &str = "localpasswordlocalpassword";
    const REMOTE_PWD: &str = "remotepasswordremotepassword";

    fn creds() -> Credentials {
        Credentials::new("locl", LOCAL_PWD, "remt", REMOTE_PWD)
    }

    fn timing(max_attempts: u32) -> CheckTiming {
        CheckTiming {
            pacing: Duration::from_millis(10),
            initial_rto: Duration::from_millis(100),
            max_attempts,
            ..CheckTiming::default()
        }
    }

    fn checklist(max_attempts: u32, now: Instant) -> Checklist {
        Checklist::new(creds(), timing(max_attempts), now)
    }

    fn local() -> Candidate {
        Candidate::host("10.0.0.1:4000".parse().unwrap(), 65535)
    }

    fn remote(line: &str) -> Candidate {
        Candidate::parse(line).unwrap()
    }

    fn remote_a() -> Candidate {
        remote("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host")
    }

    fn remote_b() -> Candidate {
        remote("candidate:2 1 udp 2130706175 10.0.0.3 5000 typ host")
    }

    fn key(local: &Candidate, remote: &Candidate) -> PairKey {
        PairKey {
            base: local.base_address(),
            remote: remote.address(),
        }
    }

    fn sent(actions: &[CheckAction]) -> Vec<(PairKey, StunMessage)> {
        actions
            .iter()
            .filter_map(|a| match a {
                CheckAction::Send { key, request } => Some((*key, request.clone())),
                _ => None,
            })
            .collect()
    }

    /// Success response the controlling peer would send
    fn success(request: &StunMessage, mapped: SocketAddr, password: &str) -> (StunMessage, Vec<u8>) {
        let mut response = StunMessage::binding_success(request, mapped);
        response.add_message_integrity(password.as_bytes()).unwrap();
        response.add_fingerprint().unwrap();
        let raw = response.encode().unwrap();
        (response, raw)
    }

    /// Check the controlling peer would send
    fn peer_check(username: &str, password: &str, controlled: bool) -> (StunMessage, Vec<u8>) {
        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::Username(username.to_string()));
        request.add_attribute(StunAttribute::Priority(1_862_270_975));
        if controlled {
            request.add_attribute(StunAttribute::IceControlled(7));
        } else {
            request.add_attribute(StunAttribute::IceControlling(7));
        }
        request.add_message_integrity(password.as_bytes()).unwrap();
        request.add_fingerprint().unwrap();
        let raw = request.encode().unwrap();
        (request, raw)
    }

    #[test]
    fn test_first_pair_of_group_waiting_rest_frozen() {
        let now = Instant::now();
        let mut list = checklist(3, now);
        let other = remote("candidate:1 1 udp 2130706175 10.0.0.3 5000 typ host");

        assert!(list.add_pair(&local(), &remote_a()));
        assert!(list.add_pair(&local(), &other));
        assert!(list.add_pair(&local(), &remote_b()));

        assert_eq!(list.pair(&key(&local(), &remote_a())).unwrap().state(), PairState::Waiting);
        assert_eq!(list.pair(&key(&local(), &other)).unwrap().state(), PairState::Frozen);
        assert_eq!(list.pair(&key(&local(), &remote_b())).unwrap().state(), PairState::Waiting);
    }

    #[test]
    fn test_incompatible_candidates_not_paired() {
        let mut list = checklist(3, Instant::now());
        let v6 = remote("candidate:1 1 udp 2130706431 2001:db8::2 5000 typ host");
        assert!(!list.add_pair(&local(), &v6));
        assert!(list.pairs().is_empty());
    }

    #[test]
    fn test_pruning_keeps_higher_priority() {
        let host = local();
        let srflx = Candidate::server_reflexive(
            "203.0.113.9:41000".parse().unwrap(),
            host.socket_addr(),
            "198.51.100.1:3478".parse().unwrap(),
            65535,
        );

        // Host first: the srflx duplicate loses
        let mut list = checklist(3, Instant::now());
        assert!(list.add_pair(&host, &remote_a()));
        assert!(!list.add_pair(&srflx, &remote_a()));
        assert_eq!(list.pairs().len(), 1);
        assert_eq!(list.pairs()[0].local().candidate_type(), CandidateType::Host);

        // Srflx first: the host pair replaces it
        let mut list = checklist(3, Instant::now());
        assert!(list.add_pair(&srflx, &remote_a()));
        assert!(list.add_pair(&host, &remote_a()));
        assert_eq!(list.pairs().len(), 1);
        assert_eq!(list.pairs()[0].local().candidate_type(), CandidateType::Host);
    }

    #[test]
    fn test_pruning_never_replaces_checked_pair() {
        let now = Instant::now();
        let host = local();
        let srflx = Candidate::server_reflexive(
            "203.0.113.9:41000".parse().unwrap(),
            host.socket_addr(),
            "198.51.100.1:3478".parse().unwrap(),
            65535,
        );
        let mut list = checklist(3, now);
        assert!(list.add_pair(&srflx, &remote_a()));
        assert_eq!(sent(&list.poll(now).unwrap()).len(), 1);

        assert!(!list.add_pair(&host, &remote_a()));
        assert_eq!(
            list.pairs()[0].local().candidate_type(),
            CandidateType::ServerReflexive
        );
    }

    #[test]
    fn test_check_request_attributes() {
        let now = Instant::now();
        let mut list = checklist(3, now);
        list.add_pair(&local(), &remote_a());

        let sends = sent(&list.poll(now).unwrap());
        assert_eq!(sends.len(), 1);
        let (key, request) = &sends[0];
        assert_eq!(key.remote.socket_addr(), remote_a().socket_addr());
        assert_eq!(request.class, StunMessageClass::Request);
        assert_eq!(request.username(), Some("remt:locl"));
        assert_eq!(request.priority(), Some(local().peer_reflexive_priority()));
        assert_eq!(request.ice_controlled(), Some(list.tie_breaker()));
        assert!(request.ice_controlling().is_none());
        assert!(!request.use_candidate());

        let raw = request.encode().unwrap();
        assert!(StunMessage::verify_message_integrity(&raw, REMOTE_PWD.as_bytes()).is_ok());
        assert!(StunMessage::verify_fingerprint(&raw).is_ok());
    }

    #[test]
    fn test_unanswered_check_fails_after_max_attempts() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_a());
        let k = key(&local(), &remote_a());

        let sends = sent(&list.poll(t0).unwrap());
        let id = sends[0].1.transaction_id;
        assert_eq!(list.pair(&k).unwrap().next_deadline(), Some(t0 + ms(100)));

        assert!(list.poll(t0 + ms(99)).unwrap().is_empty());
        let actions = list.poll(t0 + ms(100)).unwrap();
        assert!(matches!(&actions[..], [CheckAction::Retransmit { request, .. }] if request.transaction_id == id));
        assert_eq!(list.pair(&k).unwrap().next_deadline(), Some(t0 + ms(300)));

        assert!(list.poll(t0 + ms(299)).unwrap().is_empty());
        let actions = list.poll(t0 + ms(300)).unwrap();
        assert!(matches!(&actions[..], [CheckAction::Retransmit { .. }]));
        assert_eq!(list.pair(&k).unwrap().state(), PairState::InProgress);

        assert!(list.poll(t0 + ms(699)).unwrap().is_empty());
        let actions = list.poll(t0 + ms(700)).unwrap();
        assert!(matches!(
            &actions[..],
            [CheckAction::Cancel { transaction_id, base }] if *transaction_id == id && *base == k.base
        ));
        let pair = list.pair(&k).unwrap();
        assert_eq!(pair.state(), PairState::Failed);
        assert_eq!(pair.attempts(), 3);
        assert!(pair.transaction_id().is_none());
        assert!(pair.next_deadline().is_none());
    }

    #[test]
    fn test_failed_pair_thaws_next_in_group() {
        let t0 = Instant::now();
        let mut list = checklist(1, t0);
        let sibling = remote("candidate:1 1 udp 2130706175 10.0.0.3 5000 typ host");
        list.add_pair(&local(), &remote_a());
        list.add_pair(&local(), &sibling);

        let sends = sent(&list.poll(t0).unwrap());
        assert_eq!(sends[0].0, key(&local(), &remote_a()));

        // Sibling stays frozen while its group has a check in flight
        assert!(list.poll(t0 + Duration::from_millis(50)).unwrap().is_empty());

        let actions = list.poll(t0 + Duration::from_millis(100)).unwrap();
        assert!(matches!(actions[0], CheckAction::Cancel { .. }));
        let sends = sent(&actions);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, key(&local(), &sibling));
    }

    #[test]
    fn test_highest_priority_waiting_checked_first_and_paced() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_b());
        list.add_pair(&local(), &remote_a());

        let first = sent(&list.poll(t0).unwrap());
        assert_eq!(first[0].0, key(&local(), &remote_a()));

        // Pacing holds the second check back
        assert!(sent(&list.poll(t0 + Duration::from_millis(5)).unwrap()).is_empty());
        let second = sent(&list.poll(t0 + Duration::from_millis(10)).unwrap());
        assert_eq!(second[0].0, key(&local(), &remote_b()));
    }

    #[test]
    fn test_success_then_nomination_selects() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_a());
        let (k, request) = sent(&list.poll(t0).unwrap()).remove(0);

        let (response, raw) = success(&request, local().socket_addr(), REMOTE_PWD);
        let selection = list.handle_response(&k, request.transaction_id, &response, &raw, remote_a().socket_addr());
        assert!(selection.is_none());
        assert_eq!(list.pair(&k).unwrap().state(), PairState::Succeeded);
        assert!(list.selected().is_none());

        let selection = list.handle_inbound_check(&local(), &remote_a(), true).unwrap();
        assert_eq!(selection.pair.key(), k);
        assert!(selection.pair.is_nominated());
        assert!(list.is_finished());
        assert!(list.poll(t0 + Duration::from_secs(10)).unwrap().is_empty());
    }

    #[test]
    fn test_nomination_before_check_selects_on_response() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_b());
        list.add_pair(&local(), &remote_a());

        // The lower-priority pair is nominated, so its triggered check goes first
        assert!(list.handle_inbound_check(&local(), &remote_b(), true).is_none());
        let (k, request) = sent(&list.poll(t0).unwrap()).remove(0);
        assert_eq!(k, key(&local(), &remote_b()));

        let (response, raw) = success(&request, local().socket_addr(), REMOTE_PWD);
        let selection = list
            .handle_response(&k, request.transaction_id, &response, &raw, remote_b().socket_addr())
            .unwrap();
        assert_eq!(selection.pair.key(), k);
        assert_eq!(list.selected().unwrap().key(), k);
    }

    #[test]
    fn test_selection_abandons_outstanding_checks() {
        let t0 = Instant::now();
        let mut list = checklist(5, t0);
        list.add_pair(&local(), &remote_a());
        list.add_pair(&local(), &remote_b());

        let (ka, req_a) = sent(&list.poll(t0).unwrap()).remove(0);
        let (kb, req_b) = sent(&list.poll(t0 + Duration::from_millis(10)).unwrap()).remove(0);
        assert_eq!(ka, key(&local(), &remote_a()));

        assert!(list.handle_inbound_check(&local(), &remote_a(), true).is_none());
        let (response, raw) = success(&req_a, local().socket_addr(), REMOTE_PWD);
        let selection = list
            .handle_response(&ka, req_a.transaction_id, &response, &raw, remote_a().socket_addr())
            .unwrap();
        assert_eq!(selection.abandoned, vec![(kb.base, req_b.transaction_id)]);

        // No retransmissions after selection
        assert!(list.poll(t0 + Duration::from_secs(30)).unwrap().is_empty());
    }

    #[test]
    fn test_non_symmetric_response_fails_pair() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_a());
        let (k, request) = sent(&list.poll(t0).unwrap()).remove(0);

        let (response, raw) = success(&request, local().socket_addr(), REMOTE_PWD);
        list.handle_response(&k, request.transaction_id, &response, &raw, "10.9.9.9:5000".parse().unwrap());
        assert_eq!(list.pair(&k).unwrap().state(), PairState::Failed);
    }

    #[test]
    fn test_response_with_wrong_integrity_fails_pair() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_a());
        let (k, request) = sent(&list.poll(t0).unwrap()).remove(0);

        let (response, raw) = success(&request, local().socket_addr(), "wrongpasswordwrongpassword");
        list.handle_response(&k, request.transaction_id, &response, &raw, remote_a().socket_addr());
        assert_eq!(list.pair(&k).unwrap().state(), PairState::Failed);
    }

    #[test]
    fn test_error_response_fails_pair() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_a());
        let (k, request) = sent(&list.poll(t0).unwrap()).remove(0);

        let response = StunMessage::binding_error(&request, 401, "Unauthorized");
        let raw = response.encode().unwrap();
        list.handle_response(&k, request.transaction_id, &response, &raw, remote_a().socket_addr());
        assert_eq!(list.pair(&k).unwrap().state(), PairState::Failed);
    }

    #[test]
    fn test_stale_response_ignored() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.add_pair(&local(), &remote_a());
        let (k, request) = sent(&list.poll(t0).unwrap()).remove(0);

        let other = StunMessage::binding_request();
        let (response, raw) = success(&other, local().socket_addr(), REMOTE_PWD);
        assert!(list.handle_response(&k, other.transaction_id, &response, &raw, remote_a().socket_addr()).is_none());
        let pair = list.pair(&k).unwrap();
        assert_eq!(pair.state(), PairState::InProgress);
        assert_eq!(pair.transaction_id(), Some(request.transaction_id));
    }

    #[test]
    fn test_failed_pair_not_revived_by_inbound_check() {
        let t0 = Instant::now();
        let mut list = checklist(1, t0);
        list.add_pair(&local(), &remote_a());
        list.poll(t0).unwrap();
        list.poll(t0 + Duration::from_millis(100)).unwrap();
        let k = key(&local(), &remote_a());
        assert_eq!(list.pair(&k).unwrap().state(), PairState::Failed);

        assert!(list.handle_inbound_check(&local(), &remote_a(), true).is_none());
        assert_eq!(list.pair(&k).unwrap().state(), PairState::Failed);
    }

    #[test]
    fn test_inbound_check_from_unknown_address_creates_pair() {
        let mut list = checklist(3, Instant::now());
        let prflx = Candidate::peer_reflexive("10.0.0.9:6000".parse().unwrap(), 1_862_270_975);
        list.handle_inbound_check(&local(), &prflx, false);

        let pair = list.pair(&key(&local(), &prflx)).unwrap();
        assert_eq!(pair.state(), PairState::Waiting);
        assert_eq!(pair.remote().candidate_type(), CandidateType::PeerReflexive);
    }

    #[test]
    fn test_authenticate_inbound_checks() {
        let list = checklist(3, Instant::now());

        let (request, raw) = peer_check("locl:remt", LOCAL_PWD, false);
        assert_eq!(list.authenticate(&request, &raw), Ok(()));

        let (request, raw) = peer_check("othr:remt", LOCAL_PWD, false);
        assert_eq!(list.authenticate(&request, &raw), Err(Rejection::UNAUTHORIZED));

        for username in ["locl:othr", "locl:", "locl:remt:extra"] {
            let (request, raw) = peer_check(username, LOCAL_PWD, false);
            assert_eq!(list.authenticate(&request, &raw), Err(Rejection::UNAUTHORIZED), "{username}");
        }

        let (request, raw) = peer_check("locl:remt", "wrongpasswordwrongpassword", false);
        assert_eq!(list.authenticate(&request, &raw), Err(Rejection::UNAUTHORIZED));

        let (request, raw) = peer_check("locl:remt", LOCAL_PWD, true);
        assert_eq!(list.authenticate(&request, &raw), Err(Rejection::ROLE_CONFLICT));

        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::Priority(1));
        request.add_message_integrity(LOCAL_PWD.as_bytes()).unwrap();
        let raw = request.encode().unwrap();
        assert_eq!(list.authenticate(&request, &raw), Err(Rejection::BAD_REQUEST));
    }

    #[test]
    fn test_responses_signed_with_local_password() {
        let list = checklist(3, Instant::now());
        let (request, _) = peer_check("locl:remt", LOCAL_PWD, false);
        let from: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        let response = list.success_response(&request, from).unwrap();
        let raw = response.encode().unwrap();
        assert_eq!(response.transaction_id, request.transaction_id);
        assert_eq!(response.mapped_address(), Some(from));
        assert!(StunMessage::verify_message_integrity(&raw, LOCAL_PWD.as_bytes()).is_ok());
        assert!(StunMessage::verify_fingerprint(&raw).is_ok());

        let error = list.error_response(&request, Rejection::UNAUTHORIZED).unwrap();
        assert_eq!(error.error_code(), Some((401, "Unauthorized")));
        assert!(!error.has_message_integrity());
    }

    #[test]
    fn test_base_closed_fails_unfinished_pairs() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        let other = Candidate::host("10.0.0.5:4000".parse().unwrap(), 65534);
        list.add_pair(&local(), &remote_a());
        list.add_pair(&other, &remote_a());
        list.poll(t0).unwrap();

        assert_eq!(list.base_closed(local().socket_addr()), 1);
        assert_eq!(list.pair(&key(&local(), &remote_a())).unwrap().state(), PairState::Failed);
        assert_eq!(list.pair(&key(&other, &remote_a())).unwrap().state(), PairState::Waiting);
    }

    #[test]
    fn test_exhaustion_requires_both_inputs_done() {
        let t0 = Instant::now();
        let mut list = checklist(1, t0);
        list.add_pair(&local(), &remote_a());
        list.poll(t0).unwrap();
        list.poll(t0 + Duration::from_millis(100)).unwrap();

        list.set_local_done();
        assert!(list.poll(t0 + Duration::from_millis(200)).is_ok());
        list.set_remote_done();
        assert_eq!(
            list.poll(t0 + Duration::from_millis(300)).unwrap_err(),
            IceError::ChecklistExhausted
        );
        assert!(list.is_exhausted());
        assert!(list.poll(t0 + Duration::from_millis(400)).is_err());
    }

    #[test]
    fn test_exhaustion_without_pairs() {
        let t0 = Instant::now();
        let mut list = checklist(3, t0);
        list.set_local_done();
        list.set_remote_done();
        assert_eq!(list.poll(t0).unwrap_err(), IceError::ChecklistExhausted);
    }

    #[test]
    fn test_completion_timeout() {
        let t0 = Instant::now();
        let mut timing = timing(3);
        timing.completion_timeout = Some(Duration::from_secs(2));
        let mut list = Checklist::new(creds(), timing, t0);
        list.add_pair(&local(), &remote_a());

        assert!(list.poll(t0 + Duration::from_secs(1)).is_ok());
        assert_eq!(
            list.poll(t0 + Duration::from_secs(2)).unwrap_err(),
            IceError::ChecklistExhausted
        );
    }

    #[test]
    fn test_retransmit_timeout_doubles() {
        let timing = timing(7);
        assert_eq!(retransmit_timeout(&timing, 1), Duration::from_millis(100));
        assert_eq!(retransmit_timeout(&timing, 2), Duration::from_millis(200));
        assert_eq!(retransmit_timeout(&timing, 4), Duration::from_millis(800));
    }
}
