//! Agent - orchestrates bases, candidate exchange and the checklist
//!
//! # Example
//!
//! ```no_run
//! use icelink_agent::{Agent, AgentConfig, Candidate, Credentials};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = Agent::new();
//!     agent.configure(AgentConfig::new(
//!         "0",
//!         Credentials::new("locl", "localpasswordlocalpassword", "remt", "remotepasswordremotepassword"),
//!     ))?;
//!
//!     let (remote_tx, remote_rx) = mpsc::channel(16);
//!     let mut local = agent.start(remote_rx)?;
//!     while let Some(candidate) = local.recv().await {
//!         println!("a={candidate}"); // hand to signaling
//!     }
//!
//!     remote_tx.send("candidate:1 1 udp 2130706431 192.0.2.7 40000 typ host".parse::<Candidate>()?).await?;
//!     drop(remote_tx);
//!
//!     let mut stream = agent.get_data_stream().await?;
//!     stream.send(b"hello").await?;
//!     Ok(())
//! }
//! ```

use crate::base::{Base, InboundHandler, StunHandler};
use crate::candidate::{Candidate, CandidateType};
use crate::checklist::{CheckAction, Checklist, Selection};
use crate::config::AgentConfig;
use crate::error::{IceError, Result};
use crate::gather;
use crate::pair::{CandidatePair, PairKey};
use crate::reflexive::{ReflexiveResolver, StunResolver};
use crate::stream::DataStream;
use dashmap::DashMap;
use icelink_stun::{StunMessage, StunMessageClass, TransactionId};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Local candidates buffered for the caller
const LOCAL_CANDIDATE_QUEUE: usize = 16;

/// Terminal result of the checklist
#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Selected(CandidatePair),
    Failed(IceError),
}

/// Candidate lists and pair table, guarded by one lock
#[derive(Default)]
struct AgentState {
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    checklist: Option<Checklist>,
}

/// Agent inner state
pub(crate) struct AgentInner {
    /// Configuration, set before start
    config: Mutex<Option<AgentConfig>>,
    /// Candidates and checklist
    state: Mutex<AgentState>,
    /// Live bases by local address
    bases: DashMap<SocketAddr, Arc<Base>>,
    /// First fatal error
    failure: Mutex<Option<IceError>>,
    /// Selection or failure, published once
    outcome: watch::Sender<Outcome>,
    /// Wakes the checklist loop early
    wake: Notify,
    /// Stops every task
    cancel: CancellationToken,
    /// Server reflexive discovery
    resolver: Arc<dyn ReflexiveResolver>,
    started: AtomicBool,
    stream_taken: AtomicBool,
}

/// Controlled-role ICE agent for one media stream
///
/// Cloning is cheap; clones share the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Agent {
    /// Create an unconfigured agent resolving reflexive addresses over STUN
    #[must_use]
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(StunResolver::default()))
    }

    /// Create an unconfigured agent with a custom reflexive resolver
    #[must_use]
    pub fn with_resolver(resolver: Arc<dyn ReflexiveResolver>) -> Self {
        let (outcome, _) = watch::channel(Outcome::Pending);
        let inner = AgentInner {
            config: Mutex::new(None),
            state: Mutex::new(AgentState::default()),
            bases: DashMap::new(),
            failure: Mutex::new(None),
            outcome,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            resolver,
            started: AtomicBool::new(false),
            stream_taken: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Agent {
    /// Supply stream identifier, credentials and options.
    ///
    /// # Errors
    ///
    /// `Configuration` if the configuration is invalid, `InvalidState` once
    /// the agent has started.
    pub fn configure(&self, config: AgentConfig) -> Result<()> {
        if self.is_started() {
            return Err(IceError::invalid_state("agent already started"));
        }
        config.validate()?;
        tracing::debug!(mid = %config.mid, ipv6 = config.enable_ipv6, "Agent configured");
        *lock(&self.inner.config) = Some(config);
        Ok(())
    }

    /// Start gathering and checking.
    ///
    /// `remote` delivers the peer's candidates; closing it tells the agent
    /// none will follow. The returned receiver yields local candidates as they
    /// are gathered and closes when gathering ends.
    ///
    /// # Errors
    ///
    /// `Configuration` if [`configure`](Self::configure) was never called,
    /// `InvalidState` if already started.
    pub fn start(&self, remote: mpsc::Receiver<Candidate>) -> Result<mpsc::Receiver<Candidate>> {
        let config = lock(&self.inner.config)
            .clone()
            .ok_or(IceError::configuration("agent not configured"))?;

        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IceError::invalid_state("agent already started"));
        }

        lock(&self.inner.state).checklist = Some(Checklist::new(
            config.credentials.clone(),
            config.timing.clone(),
            Instant::now(),
        ));

        tracing::info!(mid = %config.mid, "Starting ICE agent (controlled)");

        let (local_tx, local_rx) = mpsc::channel(LOCAL_CANDIDATE_QUEUE);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.establish(config, remote, local_tx).await {
                inner.cancel.cancel();
                inner.fail(e);
            }
        });

        Ok(local_rx)
    }

    /// Wait for the selected pair and return a stream bound to it.
    ///
    /// # Errors
    ///
    /// The first fatal error the agent recorded (`ChecklistExhausted`,
    /// `Cancelled`, `Transport`), or `InvalidState` if the agent was never
    /// started or the stream was already taken.
    pub async fn get_data_stream(&self) -> Result<DataStream> {
        if !self.is_started() {
            return Err(IceError::invalid_state("agent not started"));
        }

        let mut outcome = self.inner.outcome.subscribe();
        let outcome = outcome
            .wait_for(|o| !matches!(o, Outcome::Pending))
            .await
            .map_err(|_| IceError::Cancelled)?
            .clone();

        let pair = match outcome {
            Outcome::Selected(pair) => pair,
            Outcome::Failed(e) => return Err(e),
            Outcome::Pending => return Err(IceError::invalid_state("no outcome")),
        };

        if self.inner.stream_taken.swap(true, Ordering::SeqCst) {
            return Err(IceError::invalid_state("data stream already taken"));
        }
        let base = self
            .inner
            .bases
            .get(&pair.key().base)
            .map(|b| Arc::clone(b.value()))
            .ok_or(IceError::invalid_state("selected base closed"))?;
        let rx = base
            .take_data_receiver()
            .ok_or(IceError::invalid_state("data stream already taken"))?;

        Ok(DataStream::new(
            base,
            pair.remote().socket_addr(),
            rx,
            self.inner.cancel.clone(),
        ))
    }

    /// Stop every task. A pending [`get_data_stream`](Self::get_data_stream)
    /// returns `Cancelled` and an open data stream ends.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down ICE agent");
        self.inner.cancel.cancel();
    }

    /// Token cancelled on shutdown or fatal failure
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Whether [`start`](Self::start) has been called
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// State Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Agent {
    /// Local candidates gathered so far
    #[must_use]
    pub fn local_candidates(&self) -> Vec<Candidate> {
        lock(&self.inner.state).local_candidates.clone()
    }

    /// Remote candidates received or learned from checks
    #[must_use]
    pub fn remote_candidates(&self) -> Vec<Candidate> {
        lock(&self.inner.state).remote_candidates.clone()
    }

    /// Snapshot of the pair table
    #[must_use]
    pub fn pairs(&self) -> Vec<CandidatePair> {
        lock(&self.inner.state)
            .checklist
            .as_ref()
            .map(|c| c.pairs().to_vec())
            .unwrap_or_default()
    }

    /// The selected pair, once nominated
    #[must_use]
    pub fn selected_pair(&self) -> Option<CandidatePair> {
        match &*self.inner.outcome.borrow() {
            Outcome::Selected(pair) => Some(pair.clone()),
            _ => None,
        }
    }

    /// First fatal error recorded, if any
    #[must_use]
    pub fn failure(&self) -> Option<IceError> {
        lock(&self.inner.failure).clone()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("started", &self.is_started())
            .field("bases", &self.inner.bases.len())
            .field("outcome", &*self.inner.outcome.borrow())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════════════════════════════════════

impl AgentInner {
    /// Bind bases, spawn the read loops and candidate tasks, then run the
    /// checklist until it finishes.
    async fn establish(
        self: &Arc<Self>,
        config: AgentConfig,
        remote: mpsc::Receiver<Candidate>,
        local_tx: mpsc::Sender<Candidate>,
    ) -> Result<()> {
        let addrs: Vec<IpAddr> = if config.bind_addrs.is_empty() {
            let interfaces = gather::enumerate_interfaces()?;
            gather::usable_addresses(&interfaces, config.enable_ipv6)
        } else {
            config
                .bind_addrs
                .iter()
                .copied()
                .filter(|ip| config.enable_ipv6 || ip.is_ipv4())
                .collect()
        };

        let bases: Vec<Arc<Base>> = gather::bind_bases(&addrs, config.data_queue_capacity)
            .await
            .into_iter()
            .map(Arc::new)
            .collect();
        if bases.is_empty() {
            tracing::warn!("No usable interface address, gathering no candidates");
        }

        let mut hosts = Vec::with_capacity(bases.len());
        for (index, base) in bases.iter().enumerate() {
            self.bases.insert(base.local_addr(), Arc::clone(base));
            let host = gather::host_candidate(base, index);
            self.add_local(&host);
            hosts.push(host);
            self.spawn_read_loop(Arc::clone(base), config.timing.idle_timeout);
        }

        self.spawn_remote_ingestion(remote);
        self.spawn_local_gathering(bases, hosts, config.stun_servers.clone(), local_tx);
        self.check_loop(config.timing.pacing).await
    }

    fn spawn_read_loop(self: &Arc<Self>, base: Arc<Base>, idle_timeout: Duration) {
        let inner = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = base.run(inner.as_ref(), idle_timeout, cancel).await;
            inner.base_closed(&base, result);
        });
    }

    /// Pair each remote candidate as it arrives
    fn spawn_remote_ingestion(self: &Arc<Self>, mut remote: mpsc::Receiver<Candidate>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = inner.cancel.cancelled() => return,
                    c = remote.recv() => c,
                };
                match next {
                    Some(candidate) => inner.add_remote(candidate),
                    None => {
                        tracing::debug!("Remote candidate input closed");
                        if let Some(checklist) = lock(&inner.state).checklist.as_mut() {
                            checklist.set_remote_done();
                        }
                        inner.wake.notify_one();
                        return;
                    }
                }
            }
        });
    }

    /// Forward host candidates, then gather and forward reflexive ones
    fn spawn_local_gathering(
        self: &Arc<Self>,
        bases: Vec<Arc<Base>>,
        hosts: Vec<Candidate>,
        stun_servers: Vec<SocketAddr>,
        local_tx: mpsc::Sender<Candidate>,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            for host in hosts {
                if !inner.forward(&local_tx, host).await {
                    return;
                }
            }

            for (index, base) in bases.iter().enumerate() {
                for server in &stun_servers {
                    let resolved = tokio::select! {
                        () = inner.cancel.cancelled() => return,
                        r = inner.resolver.resolve(base, *server) => r,
                    };
                    let mapped = match resolved {
                        Ok(mapped) => mapped,
                        Err(e) => {
                            tracing::warn!(base = %base.local_addr(), server = %server, "Reflexive discovery failed: {}", e);
                            continue;
                        }
                    };
                    if mapped == base.local_addr() {
                        tracing::debug!(base = %mapped, server = %server, "Base is not behind a NAT");
                        continue;
                    }

                    let srflx = Candidate::server_reflexive(
                        mapped,
                        base.local_addr(),
                        *server,
                        gather::local_preference(index),
                    );
                    if inner.add_local(&srflx) && !inner.forward(&local_tx, srflx).await {
                        return;
                    }
                }
            }

            tracing::debug!("Local gathering finished");
            if let Some(checklist) = lock(&inner.state).checklist.as_mut() {
                checklist.set_local_done();
            }
            inner.wake.notify_one();
        });
    }

    /// Hand a local candidate to the caller. Returns false on cancellation.
    async fn forward(&self, tx: &mpsc::Sender<Candidate>, candidate: Candidate) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = tx.send(candidate) => {
                if sent.is_err() {
                    tracing::trace!("Local candidate receiver dropped");
                }
                true
            }
        }
    }

    /// Drive the checklist until a pair is selected or it gives up
    async fn check_loop(self: &Arc<Self>, pacing: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(pacing);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(IceError::Cancelled),
                _ = ticker.tick() => {}
                () = self.wake.notified() => {}
            }

            let polled = {
                let mut state = lock(&self.state);
                let Some(checklist) = state.checklist.as_mut() else {
                    return Err(IceError::invalid_state("checklist missing"));
                };
                if checklist.selected().is_some() {
                    return Ok(());
                }
                checklist
                    .poll(Instant::now())
                    .map_err(|e| (e, checklist.abandon_in_flight()))
            };

            match polled {
                Ok(actions) => self.perform(actions).await,
                Err((e, abandoned)) => {
                    self.cancel_transactions(abandoned);
                    return Err(e);
                }
            }
        }
    }

    async fn perform(self: &Arc<Self>, actions: Vec<CheckAction>) {
        for action in actions {
            match action {
                CheckAction::Send { key, request } => {
                    let Some(base) = self.base(key.base) else {
                        continue;
                    };
                    let handler = self.response_handler(key, request.transaction_id);
                    if let Err(e) = base
                        .send_stun(&request, key.remote.socket_addr(), Some(handler))
                        .await
                    {
                        tracing::debug!(pair = %key, "Check send failed: {}", e);
                    }
                }
                CheckAction::Retransmit { key, request } => {
                    let Some(base) = self.base(key.base) else {
                        continue;
                    };
                    if let Err(e) = base.send_stun(&request, key.remote.socket_addr(), None).await {
                        tracing::debug!(pair = %key, "Retransmission failed: {}", e);
                    }
                }
                CheckAction::Cancel {
                    base,
                    transaction_id,
                } => {
                    if let Some(base) = self.base(base) {
                        base.cancel_transaction(&transaction_id);
                    }
                }
            }
        }
    }

    /// Route a check response back into the checklist. Holds only a weak
    /// reference so a forgotten transaction cannot keep the agent alive.
    fn response_handler(self: &Arc<Self>, key: PairKey, id: TransactionId) -> StunHandler {
        let inner = Arc::downgrade(self);
        Box::new(move |response: &StunMessage, raw: &[u8], from: SocketAddr| {
            if let Some(inner) = inner.upgrade() {
                inner.on_response(&key, id, response, raw, from);
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// State Updates
// ═══════════════════════════════════════════════════════════════════════════

impl AgentInner {
    fn base(&self, addr: SocketAddr) -> Option<Arc<Base>> {
        self.bases.get(&addr).map(|b| Arc::clone(b.value()))
    }

    /// Record and pair a local candidate. Returns false for a duplicate
    /// address.
    fn add_local(&self, candidate: &Candidate) -> bool {
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state
                .local_candidates
                .iter()
                .any(|c| c.address() == candidate.address())
            {
                return false;
            }
            state.local_candidates.push(candidate.clone());
            if let Some(checklist) = state.checklist.as_mut() {
                checklist.add_local(candidate, &state.remote_candidates);
            }
        }
        tracing::debug!(candidate = %candidate, "Local candidate");
        self.wake.notify_one();
        true
    }

    fn add_remote(&self, candidate: Candidate) {
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state
                .remote_candidates
                .iter()
                .any(|c| c.address() == candidate.address())
            {
                tracing::trace!(candidate = %candidate, "Duplicate remote candidate");
                return;
            }
            if let Some(checklist) = state.checklist.as_mut() {
                checklist.add_remote(&candidate, &state.local_candidates);
            }
            tracing::debug!(candidate = %candidate, "Remote candidate");
            state.remote_candidates.push(candidate);
        }
        self.wake.notify_one();
    }

    fn on_response(
        &self,
        key: &PairKey,
        id: TransactionId,
        response: &StunMessage,
        raw: &[u8],
        from: SocketAddr,
    ) {
        let selection = lock(&self.state)
            .checklist
            .as_mut()
            .and_then(|c| c.handle_response(key, id, response, raw, from));
        if let Some(selection) = selection {
            self.on_selected(selection);
        }
        self.wake.notify_one();
    }

    fn on_selected(&self, selection: Selection) {
        let key = selection.pair.key();
        if let Some(base) = self.base(key.base) {
            base.mark_in_use();
        }
        self.cancel_transactions(selection.abandoned);

        let pair = selection.pair;
        self.outcome.send_if_modified(|outcome| {
            if matches!(outcome, Outcome::Pending) {
                *outcome = Outcome::Selected(pair);
                true
            } else {
                false
            }
        });
    }

    fn cancel_transactions(&self, transactions: Vec<(SocketAddr, TransactionId)>) {
        for (addr, id) in transactions {
            if let Some(base) = self.base(addr) {
                base.cancel_transaction(&id);
            }
        }
    }

    fn base_closed(&self, base: &Base, result: Result<()>) {
        let addr = base.local_addr();
        match result {
            Ok(()) => tracing::debug!(base = %addr, "Base closed"),
            Err(e) => tracing::warn!(base = %addr, "Base failed: {}", e),
        }
        if !base.is_in_use() {
            self.bases.remove(&addr);
        }
        if let Some(checklist) = lock(&self.state).checklist.as_mut() {
            checklist.base_closed(addr);
        }
        self.wake.notify_one();
    }

    /// Record a fatal error. Only the first one sticks.
    fn fail(&self, err: IceError) {
        let first = {
            let mut failure = lock(&self.failure);
            match &*failure {
                Some(first) => {
                    tracing::debug!("Discarding later failure: {}", err);
                    first.clone()
                }
                None => {
                    tracing::warn!("ICE agent failed: {}", err);
                    *failure = Some(err.clone());
                    err
                }
            }
        };
        self.outcome.send_if_modified(|outcome| {
            if matches!(outcome, Outcome::Pending) {
                *outcome = Outcome::Failed(first);
                true
            } else {
                false
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inbound Checks
// ═══════════════════════════════════════════════════════════════════════════

impl InboundHandler for AgentInner {
    fn handle_stun(
        &self,
        base: &Base,
        message: &StunMessage,
        raw: &[u8],
        from: SocketAddr,
    ) -> Option<StunMessage> {
        if message.class != StunMessageClass::Request {
            tracing::trace!(base = %base.local_addr(), remote = %from, txid = %message.transaction_id, "Unmatched STUN response");
            return None;
        }

        let (response, selection) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let checklist = state.checklist.as_mut()?;

            if let Err(rejection) = checklist.authenticate(message, raw) {
                tracing::debug!(base = %base.local_addr(), remote = %from, "Rejected check: {}", IceError::from(rejection));
                return checklist
                    .error_response(message, rejection)
                    .map_err(|e| tracing::debug!(remote = %from, "Cannot answer check: {}", e))
                    .ok();
            }
            let response = match checklist.success_response(message, from) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(remote = %from, "Cannot answer check: {}", e);
                    return None;
                }
            };

            let local = state.local_candidates.iter().find(|c| {
                c.candidate_type() == CandidateType::Host && c.socket_addr() == base.local_addr()
            });
            let Some(local) = local.cloned() else {
                tracing::debug!(base = %base.local_addr(), "Check on a base without a host candidate");
                return Some(response);
            };

            let remote = match state.remote_candidates.iter().find(|c| c.socket_addr() == from) {
                Some(remote) => remote.clone(),
                None => {
                    let prflx = Candidate::peer_reflexive(from, message.priority().unwrap_or_default());
                    tracing::debug!(candidate = %prflx, "Learned peer reflexive candidate");
                    state.remote_candidates.push(prflx.clone());
                    prflx
                }
            };

            let selection = checklist.handle_inbound_check(&local, &remote, message.use_candidate());
            (response, selection)
        };

        if let Some(selection) = selection {
            self.on_selected(selection);
        }
        self.wake.notify_one();
        Some(response)
    }
}

/// Lock a std mutex, recovering the data from a panicked holder
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
