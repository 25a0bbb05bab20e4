//! Connectionless call exchange with resend and backoff
// (c) 2025 Ross Younger

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{Exchange, Protocol, RpcError};
use crate::protocol::rpc::peek_xid;

/// Largest datagram we will receive
pub const MAX_DATAGRAM: usize = 8192;

/// Resend schedule for datagram calls.
///
/// The first wait is `initial`; each subsequent wait doubles, capped at `max_interval`.
/// The call is sent `retries + 1` times in total.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Initial wait for a reply
    pub initial: Duration,
    /// Longest wait between sends
    pub max_interval: Duration,
    /// Number of resends after the first send
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_interval: Duration::from_secs(25),
            retries: 5,
        }
    }
}

impl RetryPolicy {
    /// The wait after each send, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let max = self.max_interval.max(self.initial);
        std::iter::successors(Some(self.initial), move |d| Some((*d * 2).min(max)))
            .take(self.retries as usize + 1)
    }
}

/// Sends calls as single datagrams on a connected UDP socket
#[derive(Debug)]
pub struct DatagramExchange {
    socket: UdpSocket,
    peer: SocketAddr,
    policy: RetryPolicy,
}

impl DatagramExchange {
    /// Binds an ephemeral local port and connects it to `peer`
    pub async fn connect(peer: SocketAddr, policy: RetryPolicy) -> Result<Self, RpcError> {
        let local = match peer.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local, 0))
            .await
            .map_err(|e| RpcError::transport("bind", e))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| RpcError::transport(&format!("connect to {peer}"), e))?;
        Ok(Self {
            socket,
            peer,
            policy,
        })
    }
}

#[async_trait]
impl Exchange for DatagramExchange {
    async fn exchange(&mut self, xid: u32, request: Bytes) -> Result<Bytes, RpcError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut attempts = 0;
        for wait in self.policy.delays() {
            attempts += 1;
            if attempts > 1 {
                debug!("resending xid {xid:#x} to {} (attempt {attempts})", self.peer);
            }
            let _ = self
                .socket
                .send(&request)
                .await
                .map_err(|e| RpcError::transport(&format!("send to {}", self.peer), e))?;
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        return Err(RpcError::transport(
                            &format!("receive from {}", self.peer),
                            e,
                        ));
                    }
                    Ok(Ok(n)) => {
                        let reply = &buf[..n];
                        if peek_xid(reply) == Some(xid) {
                            return Ok(Bytes::copy_from_slice(reply));
                        }
                        trace!("discarding datagram with unexpected xid {:?}", peek_xid(reply));
                    }
                }
            }
        }
        Err(RpcError::Timeout { attempts })
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::net::UdpSocket;

    use super::{DatagramExchange, MAX_DATAGRAM, RetryPolicy};
    use crate::transport::{Exchange as _, RpcError};

    #[test]
    fn default_schedule() {
        let d: Vec<_> = RetryPolicy::default().delays().map(|d| d.as_secs()).collect();
        assert_eq!(d, vec![1, 2, 4, 8, 16, 25]);
    }

    #[test]
    fn schedule_is_monotonic() {
        let p = RetryPolicy {
            initial: Duration::from_millis(300),
            max_interval: Duration::from_secs(2),
            retries: 9,
        };
        let d: Vec<_> = p.delays().collect();
        assert_eq!(d.len(), 10);
        assert!(d.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*d.last().unwrap(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_after_all_sends() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            retries: 3,
        };
        let mut ex = DatagramExchange::connect(peer.local_addr().unwrap(), policy)
            .await
            .unwrap();
        let e = ex
            .exchange(7, Bytes::from_static(b"\0\0\0\x07hello"))
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, RpcError::Timeout { attempts: 4 }), "{e:?}");

        let mut buf = [0u8; 64];
        let mut received = 0;
        while let Ok(n) = peer.try_recv(&mut buf) {
            assert_eq!(&buf[..n], b"\0\0\0\x07hello");
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn mismatched_replies_are_ignored() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let (_, from) = peer.recv_from(&mut buf).await.unwrap();
            let _ = peer.send_to(b"\0\0\0\x01stale", from).await.unwrap();
            let _ = peer.send_to(b"\0\0\0\x02fresh", from).await.unwrap();
        });
        let mut ex = DatagramExchange::connect(addr, RetryPolicy::default())
            .await
            .unwrap();
        let reply = ex.exchange(2, Bytes::from_static(b"\0\0\0\x02")).await.unwrap();
        assert_eq!(reply.as_ref(), b"\0\0\0\x02fresh");
        responder.await.unwrap();
    }
}
