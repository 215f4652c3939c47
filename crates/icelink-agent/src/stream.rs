//! Data stream over the selected pair

use crate::base::{Base, Datagram};
use crate::error::{IceError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bidirectional datagram stream bound to the selected pair's base and
/// remote address.
///
/// Datagrams from any other source are dropped.
pub struct DataStream {
    base: Arc<Base>,
    remote: SocketAddr,
    rx: mpsc::Receiver<Datagram>,
    cancel: CancellationToken,
}

impl DataStream {
    pub(crate) fn new(
        base: Arc<Base>,
        remote: SocketAddr,
        rx: mpsc::Receiver<Datagram>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            base,
            remote,
            rx,
            cancel,
        }
    }

    /// Send one datagram to the remote address.
    ///
    /// # Errors
    ///
    /// `Cancelled` after shutdown, `Transport` if the send fails.
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(IceError::Cancelled);
        }
        self.base.send_to(payload, self.remote).await
    }

    /// Next datagram from the remote address, or `None` once the agent shuts
    /// down.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            let datagram = tokio::select! {
                () = self.cancel.cancelled() => return None,
                d = self.rx.recv() => d?,
            };
            if datagram.from == self.remote {
                return Some(datagram.payload);
            }
            tracing::trace!(remote = %datagram.from, "Dropping datagram from unselected address");
        }
    }

    /// Local address of the base
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.base.local_addr()
    }

    /// Selected remote address
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("local", &self.base.local_addr())
            .field("remote", &self.remote)
            .finish()
    }
}
