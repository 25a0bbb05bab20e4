//! # 🚚 RPC call channels
// (c) 2025 Ross Younger
//!
//! A call channel sends a call to one remote program and waits for the matching reply.
//!
//! * Over a **stream** ([`stream`]) each message is record-marked. If the peer
//!   drops the connection before replying, we reconnect once and resend;
//!   a second failure is reported as [`RpcError::Transport`].
//! * Over **datagrams** ([`datagram`]) the call is resent on timeout with an
//!   exponentially increasing interval, up to a fixed number of retries, after
//!   which the call fails with [`RpcError::Timeout`].
//!   Only idempotent (or otherwise de-duplicated) calls should be sent this way.
//!
//! Transaction ids come from an injected [`XidSource`], normally one
//! [`XidCounter`] shared by every channel in the process.
//!
//! Credentials and security contexts are handled by [`RpcClient`]; see [`security`].

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::FormatError;
use crate::protocol::rpc::{AcceptStatus, RejectStatus};

mod client;
pub use client::{ClientCredential, RpcClient};
pub mod datagram;
pub use datagram::{DatagramExchange, RetryPolicy};
mod lazy;
pub use lazy::{Connector, LazyClient, ProgramConnector};
pub mod portmap;
pub mod security;
pub mod stream;
pub use stream::StreamExchange;

/// Errors arising from a remote call
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A message could not be encoded or decoded
    #[error(transparent)]
    Format(#[from] FormatError),
    /// The connection failed, could not be established, or was lost
    #[error("transport error: {0}")]
    Transport(String),
    /// The datagram retry budget was exhausted
    #[error("no reply after {attempts} attempts")]
    Timeout {
        /// Number of sends made
        attempts: u32,
    },
    /// A verifier, checksum or sequence number did not match
    #[error("security error: {0}")]
    Security(String),
    /// The peer denied the call
    #[error("call rejected: {0}")]
    Rejected(RejectStatus),
    /// The peer accepted the call but did not run it successfully
    #[error("call failed: {0}")]
    NotAccepted(AcceptStatus),
    /// The peer ran the procedure but reported failure
    #[error("peer refused the request: {0}")]
    PeerRefused(String),
    /// The portmapper could not resolve a program
    #[error("portmapper: {0}")]
    Portmap(String),
}

impl RpcError {
    /// Convenience constructor for transport errors
    pub(crate) fn transport<E: std::fmt::Display>(context: &str, err: E) -> Self {
        RpcError::Transport(format!("{context}: {err}"))
    }
}

/// Transport protocol
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Connection-oriented, record-marked
    #[default]
    Tcp,
    /// Connectionless
    Udp,
}

impl Protocol {
    /// IP protocol number, as used by the portmapper
    #[must_use]
    pub fn ipproto(self) -> u32 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

/// Issues transaction ids
pub trait XidSource: Send + Sync + Debug {
    /// Returns the next id
    fn next_xid(&self) -> u32;
}

/// The standard [`XidSource`]: a counter that wraps modulo 2^31
#[derive(Debug)]
pub struct XidCounter(AtomicU32);

impl XidCounter {
    const MASK: u32 = 0x7fff_ffff;

    /// Creates a counter whose first id will be `start + 1`
    #[must_use]
    pub fn starting_at(start: u32) -> Self {
        Self(AtomicU32::new(start & Self::MASK))
    }

    /// Creates a counter with a random starting point, so restarts are unlikely to reuse recent ids
    #[must_use]
    pub fn random() -> Self {
        Self::starting_at(rand::random::<u32>())
    }

    /// Convenience constructor for the usual shared form
    #[must_use]
    pub fn shared() -> Arc<dyn XidSource> {
        Arc::new(Self::random())
    }
}

impl XidSource for XidCounter {
    fn next_xid(&self) -> u32 {
        let advance = |n: u32| n.wrapping_add(1) & Self::MASK;
        match self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(advance(n)))
        {
            Ok(n) | Err(n) => advance(n),
        }
    }
}

/// Moves an encoded call to the peer and brings back the matching reply
#[async_trait]
pub trait Exchange: Send + Sync + Debug {
    /// Sends `request` (whose transaction id is `xid`) and returns the reply message
    /// carrying the same id. Replies with other ids are discarded.
    async fn exchange(&mut self, xid: u32, request: Bytes) -> Result<Bytes, RpcError>;

    /// Which protocol this exchange uses
    fn protocol(&self) -> Protocol;

    /// Address of the peer
    fn peer(&self) -> SocketAddr;
}

/// A channel able to call procedures of one remote program
#[async_trait]
pub trait CallChannel: Send + Sync + Debug {
    /// Calls a procedure with XDR-encoded arguments, returning the XDR-encoded results
    async fn call(&self, procedure: u32, args: Bytes) -> Result<Bytes, RpcError>;
}

/// Where to find a remote program
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Host name or address
    pub host: String,
    /// Fixed port; if `None`, the portmapper on `host` is consulted
    pub port: Option<u16>,
    /// Protocol to use
    pub protocol: Protocol,
    /// Program number
    pub program: u32,
    /// Program version
    pub version: u32,
}

/// Tunables for a call channel
#[derive(Clone, Debug, Default)]
pub struct ChannelOptions {
    /// Datagram resend schedule (also bounds portmapper queries)
    pub retry: RetryPolicy,
    /// Credential to present
    pub credential: ClientCredential,
}

/// Resolves a host and port to a socket address, preferring IPv4
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr, RpcError> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RpcError::transport(&format!("host name lookup for {host} failed"), e))?
        .collect();
    candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| RpcError::Transport(format!("host {host} has no addresses")))
}

/// Opens a call channel to the target, asking the portmapper for the port if necessary
pub async fn connect(
    target: &Target,
    xids: Arc<dyn XidSource>,
    options: &ChannelOptions,
) -> Result<RpcClient, RpcError> {
    let port = match target.port {
        Some(p) => p,
        None => {
            portmap::PortmapClient::connect(&target.host, xids.clone(), options.retry)
                .await?
                .getport(target.program, target.version, target.protocol)
                .await?
        }
    };
    let addr = resolve(&target.host, port).await?;
    let exchange: Box<dyn Exchange> = match target.protocol {
        Protocol::Tcp => Box::new(StreamExchange::connect(addr).await?),
        Protocol::Udp => Box::new(DatagramExchange::connect(addr, options.retry).await?),
    };
    tracing::debug!(
        "opened {} channel to {host} ({addr}) for program {program:#x} v{version}",
        target.protocol,
        host = target.host,
        program = target.program,
        version = target.version
    );
    Ok(RpcClient::new(
        exchange,
        target.program,
        target.version,
        xids,
        options.credential.clone(),
    ))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::str::FromStr as _;

    use pretty_assertions::assert_eq;

    use super::{Protocol, XidCounter, XidSource as _};

    #[test]
    fn xids_increase_and_wrap() {
        let c = XidCounter::starting_at(0x7fff_fffe);
        assert_eq!(c.next_xid(), 0x7fff_ffff);
        assert_eq!(c.next_xid(), 0);
        assert_eq!(c.next_xid(), 1);
    }

    #[test]
    fn xids_unique_across_threads() {
        let c = std::sync::Arc::new(XidCounter::starting_at(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                std::thread::spawn(move || (0..100).map(|_| c.next_xid()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }

    #[test]
    fn protocol_names() {
        assert_eq!(Protocol::from_str("UDP").unwrap(), Protocol::Udp);
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
        assert_eq!(Protocol::Udp.ipproto(), 17);
    }
}
