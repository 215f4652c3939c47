//! Base: one UDP socket on one local interface address.
//!
//! # Datagram Flow
//!
//! ```text
//! UDP Socket → recv_from → decode ─┬→ STUN, outstanding txid → transaction handler (once)
//!                                  ├→ STUN, anything else    → InboundHandler → response
//!                                  ├→ not STUN               → data queue (drop if full)
//!                                  └→ broken STUN            → dropped
//! ```

use crate::error::Result;
use dashmap::DashMap;
use icelink_stun::{StunMessage, TransactionId};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Largest UDP payload
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Called with the response that matched an outstanding transaction, the raw
/// bytes it was decoded from, and its source address.
pub type StunHandler = Box<dyn FnOnce(&StunMessage, &[u8], SocketAddr) + Send + Sync + 'static>;

/// Receives STUN messages that match no outstanding transaction.
pub trait InboundHandler: Send + Sync {
    /// Handle an unsolicited message; a returned message is sent back to
    /// `from` through `base`.
    fn handle_stun(
        &self,
        base: &Base,
        message: &StunMessage,
        raw: &[u8],
        from: SocketAddr,
    ) -> Option<StunMessage>;
}

/// Application datagram received on a base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender
    pub from: SocketAddr,
    /// Payload
    pub payload: Vec<u8>,
}

/// A local socket and its STUN transaction table
pub struct Base {
    socket: UdpSocket,
    local_addr: SocketAddr,
    transactions: DashMap<TransactionId, StunHandler>,
    data_tx: mpsc::Sender<Datagram>,
    data_rx: Mutex<Option<mpsc::Receiver<Datagram>>>,
    in_use: AtomicBool,
}

impl Base {
    /// Bind a UDP socket on an ephemeral port of `ip`.
    ///
    /// # Errors
    ///
    /// `Transport` if the socket cannot be created or bound.
    pub async fn bind(ip: IpAddr, data_queue_capacity: usize) -> Result<Self> {
        let addr = SocketAddr::new(ip, 0);
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        let (data_tx, data_rx) = mpsc::channel(data_queue_capacity.max(1));

        Ok(Self {
            socket,
            local_addr,
            transactions: DashMap::new(),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            in_use: AtomicBool::new(false),
        })
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a STUN message, optionally registering `handler` for the
    /// response with the message's transaction ID.
    ///
    /// The handler is registered before the datagram leaves so a fast
    /// response cannot race past it, and removed again if sending fails.
    ///
    /// # Errors
    ///
    /// `Parse` if the message does not encode, `Transport` if the send
    /// fails.
    pub async fn send_stun(
        &self,
        message: &StunMessage,
        to: SocketAddr,
        handler: Option<StunHandler>,
    ) -> Result<()> {
        let id = message.transaction_id;
        let bytes = message.encode()?;
        if let Some(handler) = handler {
            self.transactions.insert(id, handler);
        }

        if let Err(e) = self.socket.send_to(&bytes, to).await {
            self.transactions.remove(&id);
            return Err(e.into());
        }

        tracing::trace!(base = %self.local_addr, remote = %to, txid = %id, class = ?message.class, "STUN sent");
        Ok(())
    }

    /// Send an application datagram.
    ///
    /// # Errors
    ///
    /// `Transport` if the send fails.
    pub async fn send_to(&self, payload: &[u8], to: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, to).await?)
    }

    /// Forget an outstanding transaction without invoking its handler.
    ///
    /// Returns whether it was still outstanding.
    pub fn cancel_transaction(&self, id: &TransactionId) -> bool {
        self.transactions.remove(id).is_some()
    }

    /// Number of outstanding transactions
    #[must_use]
    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Take the application data queue. Only the first caller gets it.
    pub fn take_data_receiver(&self) -> Option<mpsc::Receiver<Datagram>> {
        self.data_rx
            .lock()
            .map(|mut rx| rx.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take())
    }

    /// Keep the read loop alive through idle periods.
    pub fn mark_in_use(&self) {
        self.in_use.store(true, Ordering::Release);
    }

    /// Whether the base carries the selected pair
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Read loop.
    ///
    /// Returns `Ok` on cancellation or after `idle_timeout` without any
    /// datagram (unless the base is in use), and `Err` on a fatal read error.
    ///
    /// # Errors
    ///
    /// `Transport` when the socket fails.
    pub async fn run(
        &self,
        handler: &dyn InboundHandler,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(base = %self.local_addr, "Read loop cancelled");
                    return Ok(());
                }
                r = tokio::time::timeout(idle_timeout, self.socket.recv_from(&mut buf)) => r,
            };

            match received {
                Ok(Ok((size, from))) => {
                    if let Some(reply) = self.dispatch(handler, &buf[..size], from) {
                        if let Err(e) = self.send_stun(&reply, from, None).await {
                            tracing::debug!(base = %self.local_addr, remote = %from, "Failed to send STUN reply: {}", e);
                        }
                    }
                }
                Ok(Err(e)) if is_transient(&e) => {
                    tracing::debug!(base = %self.local_addr, "Ignoring transient receive error: {}", e);
                }
                Ok(Err(e)) => {
                    tracing::warn!(base = %self.local_addr, "Receive failed: {}", e);
                    return Err(e.into());
                }
                Err(_) if self.is_in_use() => {}
                Err(_) => {
                    tracing::debug!(base = %self.local_addr, "No traffic for {:?}, closing base", idle_timeout);
                    return Ok(());
                }
            }
        }
    }

    /// Classify one datagram. Returns a reply to send, if any.
    fn dispatch(
        &self,
        handler: &dyn InboundHandler,
        data: &[u8],
        from: SocketAddr,
    ) -> Option<StunMessage> {
        match StunMessage::decode(data) {
            Ok(message) => {
                if let Some((_, on_response)) = self.transactions.remove(&message.transaction_id) {
                    on_response(&message, data, from);
                    return None;
                }
                handler.handle_stun(self, &message, data, from)
            }
            Err(e) if e.is_not_stun() => {
                let datagram = Datagram {
                    from,
                    payload: data.to_vec(),
                };
                if let Err(e) = self.data_tx.try_send(datagram) {
                    tracing::trace!(base = %self.local_addr, remote = %from, "Dropping application datagram: {}", e);
                }
                None
            }
            Err(e) => {
                tracing::debug!(base = %self.local_addr, remote = %from, "Dropping malformed STUN message: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for Base {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Base")
            .field("local_addr", &self.local_addr)
            .field("pending_transactions", &self.transactions.len())
            .field("in_use", &self.is_in_use())
            .finish()
    }
}

/// ICMP errors surfaced on unconnected sockets by some platforms
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}
