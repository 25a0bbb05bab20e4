//! Connection-oriented call exchange
// (c) 2025 Ross Younger

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{Exchange, Protocol, RpcError};
use crate::protocol::record::{MAX_RECORD_SIZE, RecordError, read_record, write_record};
use crate::protocol::rpc::peek_xid;

/// Outcome of one attempt at a call
enum Attempt {
    /// The connection went away; worth one reconnect
    Reset(String),
    /// Give up now
    Fatal(RpcError),
}

/// Sends record-marked calls over a TCP connection.
///
/// The connection is opened eagerly and reopened (once per call) if the peer drops it.
#[derive(Debug)]
pub struct StreamExchange {
    peer: SocketAddr,
    stream: Option<TcpStream>,
}

impl StreamExchange {
    /// Connects to `peer`
    pub async fn connect(peer: SocketAddr) -> Result<Self, RpcError> {
        let stream = Self::open(peer).await?;
        Ok(Self {
            peer,
            stream: Some(stream),
        })
    }

    async fn open(peer: SocketAddr) -> Result<TcpStream, RpcError> {
        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| RpcError::transport(&format!("connect to {peer}"), e))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn attempt(&mut self, xid: u32, request: &[u8]) -> Result<Bytes, Attempt> {
        let stream = match self.stream.take() {
            Some(s) => s,
            None => Self::open(self.peer).await.map_err(Attempt::Fatal)?,
        };
        let stream = self.stream.insert(stream);
        write_record(stream, request)
            .await
            .map_err(|e| Attempt::Reset(e.to_string()))?;
        loop {
            match read_record(stream, MAX_RECORD_SIZE).await {
                Ok(reply) => {
                    if peek_xid(&reply) == Some(xid) {
                        return Ok(reply);
                    }
                    debug!(
                        "discarding reply with unexpected xid {:?} from {}",
                        peek_xid(&reply),
                        self.peer
                    );
                }
                Err(RecordError::TooLarge(n)) => {
                    return Err(Attempt::Fatal(RpcError::Transport(format!(
                        "reply from {} too large ({n} bytes)",
                        self.peer
                    ))));
                }
                Err(e) => return Err(Attempt::Reset(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl Exchange for StreamExchange {
    async fn exchange(&mut self, xid: u32, request: Bytes) -> Result<Bytes, RpcError> {
        match self.attempt(xid, &request).await {
            Ok(reply) => return Ok(reply),
            Err(Attempt::Fatal(e)) => {
                self.stream = None;
                return Err(e);
            }
            Err(Attempt::Reset(why)) => {
                warn!("connection to {} lost ({why}); reconnecting", self.peer);
                self.stream = None;
            }
        }
        match self.attempt(xid, &request).await {
            Ok(reply) => {
                debug!("reconnected to {}", self.peer);
                Ok(reply)
            }
            Err(Attempt::Fatal(e)) => {
                self.stream = None;
                Err(e)
            }
            Err(Attempt::Reset(why)) => {
                self.stream = None;
                Err(RpcError::Transport(format!(
                    "connection to {} lost again after reconnecting: {why}",
                    self.peer
                )))
            }
        }
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}
