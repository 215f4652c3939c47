//! Server reflexive address discovery.
//!
//! The agent asks a [`ReflexiveResolver`] for the public address of each
//! base as seen by each configured STUN server. [`StunResolver`] does this
//! with a plain Binding request sent through the base's own socket, so the
//! response is picked up by the base's transaction table.

use crate::base::Base;
use crate::error::{IceError, Result};
use async_trait::async_trait;
use icelink_stun::{StunAttribute, StunMessage, StunMessageClass};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default wait for a STUN server response
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// SOFTWARE attribute value
const SOFTWARE: &str = concat!("icelink ", env!("CARGO_PKG_VERSION"));

/// Maps a base to its address as seen by a STUN server
#[async_trait]
pub trait ReflexiveResolver: Send + Sync {
    /// Mapped address of `base` as seen from `server`.
    ///
    /// # Errors
    ///
    /// Any failure; the agent logs it and skips the server.
    async fn resolve(&self, base: &Base, server: SocketAddr) -> Result<SocketAddr>;
}

/// Binding request resolver
#[derive(Debug, Clone)]
pub struct StunResolver {
    timeout: Duration,
}

impl StunResolver {
    /// Create a resolver waiting `timeout` for each server
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for StunResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl ReflexiveResolver for StunResolver {
    async fn resolve(&self, base: &Base, server: SocketAddr) -> Result<SocketAddr> {
        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::Software(SOFTWARE.to_string()));
        request.add_fingerprint()?;
        let id = request.transaction_id;

        let (tx, rx) = oneshot::channel();
        base.send_stun(
            &request,
            server,
            Some(Box::new(move |response: &StunMessage, _raw: &[u8], _from: SocketAddr| {
                let _ = tx.send(response.clone());
            })),
        )
        .await?;

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(IceError::Cancelled),
            Err(_) => {
                base.cancel_transaction(&id);
                return Err(IceError::Transport(Cow::Owned(format!(
                    "STUN server {server} did not answer within {:?}",
                    self.timeout
                ))));
            }
        };

        match response.class {
            StunMessageClass::SuccessResponse => response
                .mapped_address()
                .ok_or_else(|| IceError::parse("STUN response without mapped address")),
            _ => {
                let (code, reason) = response.error_code().unwrap_or((0, "unknown"));
                Err(IceError::Transport(Cow::Owned(format!(
                    "STUN server {server} answered {code} {reason}"
                ))))
            }
        }
    }
}
