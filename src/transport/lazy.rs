//! Per-host call channels, opened on first use
// (c) 2025 Ross Younger

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CallChannel, ChannelOptions, Protocol, RpcError, Target, XidSource, connect};

/// Opens a call channel to a named host
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Opens a channel
    async fn connect(&self, host: &str) -> Result<Arc<dyn CallChannel>, RpcError>;
}

/// The usual [`Connector`]: one program, reached via the portmapper or a fixed port
#[derive(Debug)]
pub struct ProgramConnector {
    /// Program number
    pub program: u32,
    /// Program version
    pub version: u32,
    /// Protocol
    pub protocol: Protocol,
    /// Fixed port, if any
    pub port: Option<u16>,
    /// Transaction id source
    pub xids: Arc<dyn XidSource>,
    /// Channel tunables
    pub options: ChannelOptions,
}

#[async_trait]
impl Connector for ProgramConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn CallChannel>, RpcError> {
        let target = Target {
            host: host.to_string(),
            port: self.port,
            protocol: self.protocol,
            program: self.program,
            version: self.version,
        };
        Ok(Arc::new(connect(&target, self.xids.clone(), &self.options).await?))
    }
}

/// Caches one call channel per destination host.
///
/// A channel is opened on the first call to a host. If a call fails at the
/// transport level the channel is dropped, so the next call reconnects; the
/// failed call itself is reported, never replayed.
#[derive(Debug)]
pub struct LazyClient {
    connector: Box<dyn Connector>,
    channels: Mutex<HashMap<String, Arc<dyn CallChannel>>>,
}

impl LazyClient {
    /// Constructor
    #[must_use]
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            channels: Mutex::default(),
        }
    }

    async fn channel(&self, host: &str) -> Result<Arc<dyn CallChannel>, RpcError> {
        let mut channels = self.channels.lock().await;
        if let Some(ch) = channels.get(host) {
            return Ok(ch.clone());
        }
        let ch = self.connector.connect(host).await?;
        debug!("opened channel to {host}");
        let _ = channels.insert(host.to_string(), ch.clone());
        Ok(ch)
    }

    /// Calls a procedure on `host`
    pub async fn call(&self, host: &str, procedure: u32, args: Bytes) -> Result<Bytes, RpcError> {
        let ch = self.channel(host).await?;
        let result = ch.call(procedure, args).await;
        if let Err(e @ (RpcError::Transport(_) | RpcError::Timeout { .. })) = &result {
            warn!("dropping channel to {host}: {e}");
            let _ = self.channels.lock().await.remove(host);
        }
        result
    }

    /// Number of cached channels
    pub async fn cached(&self) -> usize {
        self.channels.lock().await.len()
    }
}
