//! # 📡 RPC responders
// (c) 2025 Ross Younger
//!
//! An [`RpcServer`] serves one [`Program`] over TCP (record-marked, one task per
//! connection) or UDP. The listener only decodes the call and hands it to the
//! program, which is expected to queue any real work and return promptly.
//!
//! Servers bind a fixed port, or a random free port from a configured range.
//! Optionally they register with the local portmapper while running.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use rand::Rng as _;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, trace, trace_span, warn};

use crate::protocol::record::{MAX_RECORD_SIZE, RecordError, read_record, write_record};
use crate::transport::datagram::MAX_DATAGRAM;
use crate::transport::portmap::{Mapping, PortmapClient};
use crate::transport::{Protocol, RetryPolicy, XidSource};
use crate::util::PortRange;

mod dispatch;
pub use dispatch::{CallContext, ProcedureError, Program, handle_request};

/// Number of random ports tried before giving up
const BIND_ATTEMPTS: usize = 500;

/// How a responder listens
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Protocol to serve
    pub protocol: Protocol,
    /// Fixed port; if `None`, a random port from `port_range` is used
    pub port: Option<u16>,
    /// Ports to choose from
    pub port_range: PortRange,
    /// Register with the local portmapper
    pub register: bool,
    /// Local address to bind
    pub address: IpAddr,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            port: None,
            port_range: PortRange {
                begin: 20000,
                end: 30000,
            },
            register: false,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl Listener {
    async fn bind(protocol: Protocol, addr: SocketAddr) -> std::io::Result<Self> {
        Ok(match protocol {
            Protocol::Tcp => Listener::Tcp(TcpListener::bind(addr).await?),
            Protocol::Udp => Listener::Udp(UdpSocket::bind(addr).await?),
        })
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Udp(s) => s.local_addr(),
        }
    }
}

/// Binds a fixed port, or tries random ports from the range
async fn bind(options: &ServerOptions) -> anyhow::Result<Listener> {
    if let Some(port) = options.port {
        return Listener::bind(options.protocol, SocketAddr::new(options.address, port))
            .await
            .with_context(|| format!("binding {} port {port}", options.protocol));
    }
    let range = options.port_range;
    if range.begin == range.end {
        return Listener::bind(options.protocol, SocketAddr::new(options.address, range.begin))
            .await
            .with_context(|| format!("binding {} port {}", options.protocol, range.begin));
    }
    for _ in 0..BIND_ATTEMPTS {
        let port = rand::thread_rng().gen_range(range.begin..=range.end);
        let addr = SocketAddr::new(options.address, port);
        if let Ok(l) = Listener::bind(options.protocol, addr).await {
            debug!("bound {} port {port}", options.protocol);
            return Ok(l);
        }
    }
    anyhow::bail!("failed to bind a {} port in the range {range}", options.protocol);
}

/// A running responder
#[derive(Debug)]
pub struct RpcServer {
    program: u32,
    version: u32,
    protocol: Protocol,
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
    portmapper: Option<PortmapClient>,
}

impl RpcServer {
    /// Binds and starts serving `program`
    pub async fn start(
        program: Arc<dyn Program>,
        options: &ServerOptions,
        xids: Arc<dyn XidSource>,
    ) -> anyhow::Result<Self> {
        let listener = bind(options).await?;
        let local_addr = listener.local_addr()?;
        let prog = program.program();
        let vers = program.version();

        let portmapper = if options.register {
            let pm = PortmapClient::connect("localhost", xids, RetryPolicy::default())
                .await
                .context("contacting the local portmapper")?;
            // clear out anything left behind by a previous run
            let _ = pm.unset(prog, vers).await;
            let port = local_addr.port();
            let ok = pm
                .set(&Mapping::new(prog, vers, options.protocol, port))
                .await
                .context("registering with the portmapper")?;
            anyhow::ensure!(ok, "portmapper refused to register program {prog:#x} v{vers}");
            Some(pm)
        } else {
            None
        };

        let token = CancellationToken::new();
        let span = trace_span!("server", program = format!("{prog:#x}"));
        let task = match listener {
            Listener::Tcp(l) => tokio::spawn(
                serve_tcp(l, program, token.clone()).instrument(span),
            ),
            Listener::Udp(s) => tokio::spawn(
                serve_udp(s, program, token.clone()).instrument(span),
            ),
        };
        info!(
            "serving program {prog:#x} v{vers} on {}/{}",
            local_addr, options.protocol
        );
        Ok(Self {
            program: prog,
            version: vers,
            protocol: options.protocol,
            local_addr,
            token,
            task,
            portmapper,
        })
    }

    /// The address actually bound
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The protocol served
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Stops serving and unregisters from the portmapper
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
        if let Some(pm) = self.portmapper {
            if let Err(e) = pm.unset(self.program, self.version).await {
                warn!("failed to unregister program {:#x}: {e}", self.program);
            }
        }
        debug!("stopped serving program {:#x}", self.program);
    }
}

async fn serve_tcp(listener: TcpListener, program: Arc<dyn Program>, token: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            () = token.cancelled() => return,
            r = listener.accept() => match r {
                Ok(s) => s,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };
        trace!("connection from {peer}");
        let _ = stream.set_nodelay(true);
        let _ = tokio::spawn(
            serve_connection(stream, peer, program.clone(), token.clone()).in_current_span(),
        );
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    program: Arc<dyn Program>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = token.cancelled() => return,
            r = read_record(&mut stream, MAX_RECORD_SIZE) => match r {
                Ok(m) => m,
                Err(RecordError::Closed) => {
                    trace!("{peer} disconnected");
                    return;
                }
                Err(e) => {
                    debug!("dropping connection from {peer}: {e}");
                    return;
                }
            },
        };
        if let Some(reply) = handle_request(program.as_ref(), message, peer, Protocol::Tcp).await {
            if let Err(e) = write_record(&mut stream, &reply).await {
                debug!("failed to reply to {peer}: {e}");
                return;
            }
        }
    }
}

async fn serve_udp(socket: UdpSocket, program: Arc<dyn Program>, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, peer) = tokio::select! {
            () = token.cancelled() => return,
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    debug!("receive failed: {e}");
                    continue;
                }
            },
        };
        let message = bytes::Bytes::copy_from_slice(&buf[..n]);
        if let Some(reply) = handle_request(program.as_ref(), message, peer, Protocol::Udp).await {
            if let Err(e) = socket.send_to(&reply, peer).await {
                debug!("failed to reply to {peer}: {e}");
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use rstest::rstest;

    use super::{CallContext, ProcedureError, Program, RpcServer, ServerOptions};
    use crate::protocol::xdr::{Packer, Unpacker};
    use crate::transport::{
        ChannelOptions, Protocol, RpcError, Target, XidCounter, XidSource, connect,
    };
    use crate::util::PortRange;

    #[derive(Debug)]
    struct Doubler;

    #[async_trait]
    impl Program for Doubler {
        fn program(&self) -> u32 {
            0x2000_0042
        }
        fn version(&self) -> u32 {
            1
        }
        async fn call(
            &self,
            procedure: u32,
            args: Bytes,
            _: &CallContext,
        ) -> Result<Bytes, ProcedureError> {
            if procedure != 1 {
                return Err(ProcedureError::Unavailable);
            }
            let mut u = Unpacker::new(args);
            let n = u.unpack_u32()?;
            u.finish()?;
            let mut p = Packer::new();
            let _ = p.pack_u32(n * 2);
            Ok(p.finish())
        }
    }

    fn options(protocol: Protocol) -> ServerOptions {
        ServerOptions {
            protocol,
            port_range: PortRange {
                begin: 40000,
                end: 49000,
            },
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(Protocol::Tcp)]
    #[case(Protocol::Udp)]
    #[tokio::test]
    async fn serves_calls(#[case] protocol: Protocol) {
        let xids: Arc<dyn XidSource> = Arc::new(XidCounter::starting_at(100));
        let server = RpcServer::start(Arc::new(Doubler), &options(protocol), xids.clone())
            .await
            .unwrap();
        let port = server.local_addr().port();
        assert!((40000..=49000).contains(&port));

        let target = Target {
            host: "127.0.0.1".into(),
            port: Some(port),
            protocol,
            program: 0x2000_0042,
            version: 1,
        };
        let client = connect(&target, xids, &ChannelOptions::default()).await.unwrap();
        client.null().await.unwrap();
        let mut p = Packer::new();
        let _ = p.pack_u32(21);
        let r = client.call_raw(1, p.finish()).await.unwrap();
        assert_eq!(r.as_ref(), b"\0\0\0\x2a");
        let e = client
            .call_raw(7, Bytes::new())
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, RpcError::NotAccepted(_)));

        server.stop().await;
    }
}
