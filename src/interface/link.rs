//! Client/server pairing for one SOSS service
// (c) 2025 Ross Younger
//!
//! A SOSS service uses two RPC programs. A [`SossLink`] serves one of them
//! (receiving messages, which are queued for the interface's [`SossHandler`])
//! and a [`SossSender`] calls the other, on whichever host the header names.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{Instrument as _, debug, info_span, warn};

use crate::container::WorkerPool;
use crate::protocol::FormatError;
use crate::protocol::service::{ProgramPair, Service, UnknownService};
use crate::protocol::soss::{SossBody, SossHeader, SossMessage};
use crate::protocol::xdr::{Packer, Unpacker};
use crate::server::{CallContext, ProcedureError, Program, RpcServer, ServerOptions};
use crate::transport::{LazyClient, RpcError, XidSource};

/// Version number of every SOSS program
pub const SOSS_VERSION: u32 = 1;
/// The procedure that carries SOSS messages
pub const SOSS_PROCEDURE: u32 = 1;

/// A received SOSS message.
///
/// The header always parsed; the body may not have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    /// Message header
    pub header: SossHeader,
    /// Two letter message type
    pub msg_type: String,
    /// Raw payload text
    pub payload: String,
    /// Decoded payload
    pub body: Result<SossBody, FormatError>,
}

impl Inbound {
    /// Parses a message string.
    /// Fails only if the header cannot be understood.
    pub fn parse(message: &str) -> Result<Self, FormatError> {
        let (header, msg_type, payload) = SossMessage::parse_header(message)?;
        Ok(Self {
            header,
            msg_type: msg_type.to_string(),
            payload: payload.to_string(),
            body: SossBody::parse(msg_type, payload),
        })
    }

    /// Lower-cased sending host
    #[must_use]
    pub fn sender(&self) -> String {
        self.header.sender.to_lowercase()
    }
}

/// Something that handles received SOSS messages
#[async_trait]
pub trait SossHandler: Send + Sync + Debug {
    /// Handles one message. Runs as a worker pool task; errors are logged by the
    /// handler itself.
    async fn handle(&self, message: Inbound);
}

/// Which end of a service we are
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// We start transactions (commands)
    Initiator,
    /// The peer starts transactions (everything else)
    Responder,
}

/// The programs we serve and call for a service in a given role.
///
/// Returns `(listen, send)`; either may be absent for one-way services.
pub fn programs_for(
    service: Service,
    role: Role,
) -> Result<(Option<u32>, Option<u32>), UnknownService> {
    let ProgramPair {
        server_receive,
        server_send,
    } = service.programs()?;
    Ok(match role {
        Role::Initiator => (server_send, Some(server_receive)),
        Role::Responder => (Some(server_receive), server_send),
    })
}

/// The sending half of a link
#[derive(Debug)]
pub struct SossSender {
    program: u32,
    client: LazyClient,
}

impl SossSender {
    /// Constructor
    #[must_use]
    pub fn new(program: u32, client: LazyClient) -> Self {
        Self { program, client }
    }

    /// Creates the sender for `service` in `role`, or `None` if that end never sends
    pub fn for_service(
        service: Service,
        role: Role,
        client: LazyClient,
    ) -> Result<Option<Self>, UnknownService> {
        let (_, send) = programs_for(service, role)?;
        Ok(send.map(|program| Self::new(program, client)))
    }

    /// Program number we call
    #[must_use]
    pub fn program(&self) -> u32 {
        self.program
    }

    /// Sends a message to the host named in its header
    pub async fn send(&self, message: &SossMessage) -> Result<(), RpcError> {
        let text = message.format();
        let host = message.header.receiver.to_lowercase();
        debug!(
            "sending {} seq {} to {host}",
            message.body.msg_type(),
            message.header.seq_num
        );
        let mut p = Packer::new();
        let _ = p.pack_string(&text);
        let reply = self.client.call(&host, SOSS_PROCEDURE, p.finish()).await?;
        let mut u = Unpacker::new(reply);
        let accepted = u.unpack_bool()?;
        u.finish()?;
        if accepted {
            Ok(())
        } else {
            Err(RpcError::PeerRefused(format!(
                "{host} did not accept {} seq {}",
                message.body.msg_type(),
                message.header.seq_num
            )))
        }
    }
}

/// The receiving half of a link, as served by an [`RpcServer`]
#[derive(Debug)]
pub struct SossProgram {
    program: u32,
    name: String,
    handler: Arc<dyn SossHandler>,
    pool: WorkerPool,
}

impl SossProgram {
    /// Constructor
    #[must_use]
    pub fn new(
        program: u32,
        name: &str,
        handler: Arc<dyn SossHandler>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            program,
            name: name.to_string(),
            handler,
            pool,
        }
    }
}

#[async_trait]
impl Program for SossProgram {
    fn program(&self) -> u32 {
        self.program
    }

    fn version(&self) -> u32 {
        SOSS_VERSION
    }

    async fn call(
        &self,
        procedure: u32,
        args: Bytes,
        context: &CallContext,
    ) -> Result<Bytes, ProcedureError> {
        if procedure != SOSS_PROCEDURE {
            return Err(ProcedureError::Unavailable);
        }
        let mut u = Unpacker::new(args);
        let text = u.unpack_string()?;
        u.finish()?;
        match Inbound::parse(&text) {
            Ok(message) => {
                let handler = self.handler.clone();
                let span = info_span!("rx", iface = %self.name, seq = message.header.seq_num);
                self.pool
                    .submit(async move { handler.handle(message).await }.instrument(span));
            }
            Err(e) => warn!("{}: unparseable message from {}: {e}", self.name, context.peer),
        }
        let mut p = Packer::new();
        let _ = p.pack_bool(true);
        Ok(p.finish())
    }
}

/// The receive half of a service, while it is being served
#[derive(Debug)]
pub struct SossLink {
    service: Service,
    server: Option<RpcServer>,
}

impl SossLink {
    /// Starts serving the program we listen on in `role` (if there is one),
    /// queueing received messages for `handler`
    pub async fn start(
        service: Service,
        role: Role,
        handler: Arc<dyn SossHandler>,
        pool: WorkerPool,
        options: &ServerOptions,
        xids: Arc<dyn XidSource>,
    ) -> anyhow::Result<Self> {
        let (listen, _) = programs_for(service, role)?;
        let server = match listen {
            Some(prog) => {
                let program = SossProgram::new(prog, &service.to_string(), handler, pool);
                Some(RpcServer::start(Arc::new(program), options, xids).await?)
            }
            None => None,
        };
        Ok(Self { service, server })
    }

    /// Service this link carries
    #[must_use]
    pub fn service(&self) -> Service {
        self.service
    }

    /// Address of the receive server, if there is one
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(RpcServer::local_addr)
    }

    /// Stops the receive server
    pub async fn stop(self) {
        if let Some(s) = self.server {
            s.stop().await;
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::{Inbound, Role, SossHandler, SossProgram, SossSender, programs_for};
    use crate::container::WorkerPool;
    use crate::protocol::auth::Credential;
    use crate::protocol::service::Service;
    use crate::protocol::soss::{PacketType, SossBody, SossMessage};
    use crate::protocol::xdr::{Packer, Unpacker};
    use crate::server::{CallContext, ProcedureError, Program as _};
    use crate::transport::{LazyClient, Protocol, RpcError};
    use crate::util::test_protocol::SossRecorder;

    #[derive(Debug)]
    struct Forward(Mutex<mpsc::UnboundedSender<Inbound>>);

    #[async_trait]
    impl SossHandler for Forward {
        async fn handle(&self, message: Inbound) {
            let _ = self.0.lock().unwrap().send(message);
        }
    }

    fn context() -> CallContext {
        CallContext {
            peer: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 600),
            protocol: Protocol::Tcp,
            credential: Credential::None,
        }
    }

    fn xdr_string(s: &str) -> bytes::Bytes {
        let mut p = Packer::new();
        let _ = p.pack_string(s);
        p.finish()
    }

    #[test]
    fn roles() {
        assert_eq!(
            programs_for(Service::Command(9), Role::Initiator).unwrap(),
            (Some(0x2102_0903), Some(0x2101_0903))
        );
        assert_eq!(
            programs_for(Service::StatusPush(3), Role::Responder).unwrap(),
            (Some(0x2103_0023), None)
        );
    }

    #[tokio::test]
    async fn received_messages_are_queued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(1);
        let handler = Arc::new(Forward(Mutex::new(tx)));
        let program = SossProgram::new(0x2101_0012, "sreq", handler, pool);

        let msg = SossMessage::new(
            "obcp1",
            "obs",
            5,
            PacketType::Command,
            SossBody::Command {
                command: "STATUS,A".into(),
            },
        );
        let reply = program
            .call(1, xdr_string(&msg.format()), &context())
            .await
            .unwrap();
        assert!(Unpacker::new(reply).unpack_bool().unwrap());
        let got = rx.recv().await.unwrap();
        assert_eq!(got.header.seq_num, 5);
        assert_eq!(got.sender(), "obcp1");
        assert_eq!(got.body.unwrap(), msg.body);

        // garbage is accepted at the RPC level and dropped
        let reply = program.call(1, xdr_string("junk"), &context()).await.unwrap();
        assert!(Unpacker::new(reply).unpack_bool().unwrap());
        assert_eq!(
            program.call(2, xdr_string("junk"), &context()).await,
            Err(ProcedureError::Unavailable)
        );
    }

    #[test]
    fn malformed_payload_keeps_header() {
        let msg = SossMessage::new(
            "obcp1",
            "obs",
            8,
            PacketType::Data,
            SossBody::Command {
                command: "x,1".into(),
            },
        );
        // relabel the CD payload as a DS manifest
        let text = msg.format().replacen(",CD,", ",DS,", 1);
        let inbound = Inbound::parse(&text).unwrap();
        assert_eq!(inbound.msg_type, "DS");
        assert_eq!(inbound.header.seq_num, 8);
        assert!(inbound.body.is_err());
    }

    #[tokio::test]
    async fn sender_targets_receiver_host() {
        let rec = SossRecorder::default();
        let sender = SossSender::for_service(
            Service::Command(9),
            Role::Initiator,
            LazyClient::new(Box::new(rec.clone())),
        )
        .unwrap()
        .unwrap();
        assert_eq!(sender.program(), 0x2101_0903);
        let msg = SossMessage::new(
            "obs",
            "OBCP9",
            1,
            PacketType::Command,
            SossBody::Command {
                command: "EXEC TEST".into(),
            },
        );
        sender.send(&msg).await.unwrap();
        let sent = rec.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "obcp9");

        let broken = SossSender::new(1, LazyClient::new(Box::new(SossRecorder::failing())));
        assert!(matches!(
            broken.send(&msg).await,
            Err(RpcError::Transport(_))
        ));
    }
}
