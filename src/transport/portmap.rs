//! Portmapper (program 100000 version 2) client
// (c) 2025 Ross Younger
//!
//! The portmapper maps `(program, version, protocol)` to a port on its host.
//! Responders register themselves with it; callers without a fixed port ask it
//! where to find a program.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::{DatagramExchange, Protocol, RetryPolicy, RpcClient, RpcError, XidSource, resolve};
use crate::protocol::FormatError;
use crate::protocol::xdr::{Packer, Unpacker};

/// Portmapper program number
pub const PMAP_PROGRAM: u32 = 100_000;
/// Portmapper version
pub const PMAP_VERSION: u32 = 2;
/// Well-known portmapper port
pub const PMAP_PORT: u16 = 111;

const PMAPPROC_SET: u32 = 1;
const PMAPPROC_UNSET: u32 = 2;
const PMAPPROC_GETPORT: u32 = 3;
const PMAPPROC_DUMP: u32 = 4;
const PMAPPROC_CALLIT: u32 = 5;

/// One portmapper entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Program number
    pub program: u32,
    /// Program version
    pub version: u32,
    /// IP protocol number (6 or 17)
    pub protocol: u32,
    /// Port; ignored by UNSET and GETPORT
    pub port: u32,
}

impl Mapping {
    /// Constructor
    #[must_use]
    pub fn new(program: u32, version: u32, protocol: Protocol, port: u16) -> Self {
        Self {
            program,
            version,
            protocol: protocol.ipproto(),
            port: u32::from(port),
        }
    }

    fn pack(&self, p: &mut Packer) {
        let _ = p
            .pack_u32(self.program)
            .pack_u32(self.version)
            .pack_u32(self.protocol)
            .pack_u32(self.port);
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, FormatError> {
        Ok(Self {
            program: u.unpack_u32()?,
            version: u.unpack_u32()?,
            protocol: u.unpack_u32()?,
            port: u.unpack_u32()?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut p = Packer::with_capacity(16);
        self.pack(&mut p);
        p.finish()
    }
}

/// Decodes a reply which must be exactly one bool
fn bool_result(results: Bytes) -> Result<bool, RpcError> {
    let mut u = Unpacker::new(results);
    let b = u.unpack_bool()?;
    u.finish()?;
    Ok(b)
}

/// Talks to the portmapper on one host, over UDP
#[derive(Debug)]
pub struct PortmapClient {
    host: String,
    client: RpcClient,
}

impl PortmapClient {
    /// Connects to the portmapper on `host`
    pub async fn connect(
        host: &str,
        xids: Arc<dyn XidSource>,
        retry: RetryPolicy,
    ) -> Result<Self, RpcError> {
        let addr = resolve(host, PMAP_PORT).await?;
        let exchange = DatagramExchange::connect(addr, retry).await?;
        Ok(Self {
            host: host.to_string(),
            client: RpcClient::new(
                Box::new(exchange),
                PMAP_PROGRAM,
                PMAP_VERSION,
                xids,
                super::ClientCredential::None,
            ),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_client(host: &str, client: RpcClient) -> Self {
        Self {
            host: host.to_string(),
            client,
        }
    }

    /// Pings the portmapper
    pub async fn null(&self) -> Result<(), RpcError> {
        self.client.null().await
    }

    /// Registers a mapping. Returns false if the portmapper refused (usually because
    /// the program/version/protocol is already registered).
    pub async fn set(&self, mapping: &Mapping) -> Result<bool, RpcError> {
        bool_result(self.client.call_raw(PMAPPROC_SET, mapping.encode()).await?)
    }

    /// Removes all mappings for a program and version
    pub async fn unset(&self, program: u32, version: u32) -> Result<bool, RpcError> {
        let m = Mapping {
            program,
            version,
            protocol: 0,
            port: 0,
        };
        bool_result(self.client.call_raw(PMAPPROC_UNSET, m.encode()).await?)
    }

    /// Looks up the port for a program
    pub async fn getport(
        &self,
        program: u32,
        version: u32,
        protocol: Protocol,
    ) -> Result<u16, RpcError> {
        let m = Mapping::new(program, version, protocol, 0);
        let results = self.client.call_raw(PMAPPROC_GETPORT, m.encode()).await?;
        let mut u = Unpacker::new(results);
        let port = u.unpack_u32()?;
        u.finish()?;
        match u16::try_from(port) {
            Ok(0) => Err(RpcError::Portmap(format!(
                "program {program:#x} v{version} ({protocol}) is not registered on {}",
                self.host
            ))),
            Ok(p) => {
                debug!("program {program:#x} v{version} is at {}:{p}/{protocol}", self.host);
                Ok(p)
            }
            Err(_) => Err(RpcError::Portmap(format!(
                "portmapper on {} returned invalid port {port}",
                self.host
            ))),
        }
    }

    /// Lists all registrations
    pub async fn dump(&self) -> Result<Vec<Mapping>, RpcError> {
        let results = self.client.call_raw(PMAPPROC_DUMP, Bytes::new()).await?;
        let mut u = Unpacker::new(results);
        let mut out = Vec::new();
        while u.unpack_bool()? {
            out.push(Mapping::unpack(&mut u)?);
        }
        u.finish()?;
        Ok(out)
    }

    /// Asks the portmapper to forward a call to a local program.
    /// Returns the program's port and its encoded results.
    pub async fn callit(
        &self,
        program: u32,
        version: u32,
        procedure: u32,
        args: &[u8],
    ) -> Result<(u32, Bytes), RpcError> {
        let mut p = Packer::with_capacity(16 + args.len());
        let _ = p
            .pack_u32(program)
            .pack_u32(version)
            .pack_u32(procedure)
            .pack_opaque(args);
        let results = self.client.call_raw(PMAPPROC_CALLIT, p.finish()).await?;
        let mut u = Unpacker::new(results);
        let port = u.unpack_u32()?;
        let res = u.unpack_opaque()?;
        u.finish()?;
        Ok((port, res))
    }
}
