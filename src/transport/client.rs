//! RPC client: credentials, security contexts and reply interpretation
// (c) 2025 Ross Younger

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::security::{SecurityMechanism, SecuritySession, verify_window};
use super::{CallChannel, Exchange, Protocol, RpcError, XidSource};
use crate::protocol::auth::{
    Credential, GSS_S_COMPLETE, GSS_S_CONTINUE_NEEDED, GssCredential, GssInitResult, GssProc,
    GssService, OpaqueAuth, UnixCredential,
};
use crate::protocol::rpc::{
    AcceptStatus, CallHeader, NULL_PROCEDURE, ReplyBody, decode_reply, encode_call,
};
use crate::protocol::xdr::{Packer, Unpacker};

/// Context establishment gives up after this many round trips
const MAX_ESTABLISH_ROUNDS: usize = 8;

/// Credential presented on calls made without a security context
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClientCredential {
    /// `AUTH_NONE`
    #[default]
    None,
    /// `AUTH_SYS`
    UnixLike(UnixCredential),
}

impl ClientCredential {
    fn to_opaque(&self) -> Result<OpaqueAuth, RpcError> {
        Ok(match self {
            ClientCredential::None => OpaqueAuth::none(),
            ClientCredential::UnixLike(c) => Credential::UnixLike(c.clone()).to_opaque()?,
        })
    }
}

#[derive(Debug)]
struct Inner {
    exchange: Box<dyn Exchange>,
    credential: ClientCredential,
    security: Option<SecuritySession>,
}

/// A call channel to one program and version on one peer.
///
/// Calls are serialised; one call is outstanding at a time.
#[derive(Debug)]
pub struct RpcClient {
    program: u32,
    version: u32,
    xids: Arc<dyn XidSource>,
    peer: SocketAddr,
    protocol: Protocol,
    inner: Mutex<Inner>,
}

/// Splits a reply into its verifier and results, turning failures into errors
fn accepted(body: ReplyBody, results: Bytes) -> Result<(OpaqueAuth, Bytes), RpcError> {
    match body {
        ReplyBody::Accepted {
            verifier,
            status: AcceptStatus::Success,
        } => Ok((verifier, results)),
        ReplyBody::Accepted { status, .. } => Err(RpcError::NotAccepted(status)),
        ReplyBody::Denied(r) => Err(RpcError::Rejected(r)),
    }
}

impl RpcClient {
    /// Constructor
    #[must_use]
    pub fn new(
        exchange: Box<dyn Exchange>,
        program: u32,
        version: u32,
        xids: Arc<dyn XidSource>,
        credential: ClientCredential,
    ) -> Self {
        Self {
            program,
            version,
            xids,
            peer: exchange.peer(),
            protocol: exchange.protocol(),
            inner: Mutex::new(Inner {
                exchange,
                credential,
                security: None,
            }),
        }
    }

    /// Address of the peer
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Transport protocol in use
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Remote program number
    #[must_use]
    pub fn program(&self) -> u32 {
        self.program
    }

    fn header(&self, procedure: u32, credential: OpaqueAuth) -> CallHeader {
        CallHeader {
            xid: self.xids.next_xid(),
            program: self.program,
            version: self.version,
            procedure,
            credential,
            verifier: OpaqueAuth::none(),
        }
    }

    /// One call with a plain credential; returns the reply verifier and results
    async fn plain_call(
        &self,
        inner: &mut Inner,
        procedure: u32,
        credential: OpaqueAuth,
        args: &[u8],
    ) -> Result<(OpaqueAuth, Bytes), RpcError> {
        let header = self.header(procedure, credential);
        let request = encode_call(&header, args)?;
        trace!("call xid {:#x} proc {procedure} to {}", header.xid, self.peer);
        let reply = decode_reply(inner.exchange.exchange(header.xid, request).await?)?;
        accepted(reply.body, reply.results)
    }

    /// One call under an established security context
    async fn secure_call(
        &self,
        inner: &mut Inner,
        procedure: u32,
        args: &[u8],
        destroy: bool,
    ) -> Result<Bytes, RpcError> {
        let Some(session) = inner.security.as_mut() else {
            return Err(RpcError::Security("no security context".into()));
        };
        let cred = if destroy {
            session.destroy_credential()?
        } else {
            session.next_credential()?
        };
        let seq_num = cred.seq_num;
        let mut header = self.header(procedure, Credential::SecurityContext(cred).to_opaque()?);
        let mut p = Packer::with_capacity(128 + args.len());
        header.pack_to_credential(&mut p)?;
        header.verifier = session.call_verifier(p.as_slice())?;
        header.verifier.pack(&mut p)?;
        let _ = p.pack_raw(&session.seal(seq_num, args)?);

        let reply = decode_reply(inner.exchange.exchange(header.xid, p.finish()).await?)?;
        let (verifier, results) = accepted(reply.body, reply.results)?;
        session.open(seq_num, &verifier, results)
    }

    /// Calls a procedure with XDR-encoded arguments
    pub async fn call_raw(&self, procedure: u32, args: Bytes) -> Result<Bytes, RpcError> {
        let mut inner = self.inner.lock().await;
        if inner.security.is_some() {
            self.secure_call(&mut inner, procedure, &args, false).await
        } else {
            let cred = inner.credential.to_opaque()?;
            let (_, results) = self.plain_call(&mut inner, procedure, cred, &args).await?;
            Ok(results)
        }
    }

    /// Calls the null procedure
    pub async fn null(&self) -> Result<(), RpcError> {
        let results = self.call_raw(NULL_PROCEDURE, Bytes::new()).await?;
        Unpacker::new(results).finish()?;
        Ok(())
    }

    /// Negotiates a security context; subsequent calls use it.
    pub async fn establish_security(
        &self,
        mut mechanism: Box<dyn SecurityMechanism>,
        service: GssService,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().await;
        let mut procedure = GssProc::Init;
        let mut handle = Bytes::new();
        let mut reply_token = Bytes::new();
        let mut peer_major = None;
        let mut window = 0;
        let mut window_verifier = OpaqueAuth::none();

        for _ in 0..MAX_ESTABLISH_ROUNDS {
            let step = mechanism.step(&reply_token)?;
            if !step.complete && peer_major == Some(GSS_S_COMPLETE) {
                return Err(RpcError::Security(
                    "peer completed context establishment before we did".into(),
                ));
            }
            if !step.token.is_empty() && peer_major != Some(GSS_S_COMPLETE) {
                let cred = Credential::SecurityContext(GssCredential {
                    procedure,
                    seq_num: 0,
                    service: GssService::None,
                    handle: handle.clone(),
                })
                .to_opaque()?;
                let mut p = Packer::new();
                let _ = p.pack_opaque(&step.token);
                let (verifier, results) = self
                    .plain_call(&mut inner, NULL_PROCEDURE, cred, p.as_slice())
                    .await?;
                let mut u = Unpacker::new(results);
                let result = GssInitResult::unpack(&mut u)?;
                u.finish()?;
                if result.major != GSS_S_COMPLETE && result.major != GSS_S_CONTINUE_NEEDED {
                    return Err(RpcError::Security(format!(
                        "peer reported major status {}, minor {}",
                        result.major, result.minor
                    )));
                }
                debug!(
                    "{} context step with {}: major {}",
                    mechanism.name(),
                    self.peer,
                    result.major
                );
                handle = result.handle;
                window = result.seq_window;
                reply_token = result.token;
                peer_major = Some(result.major);
                window_verifier = verifier;
                procedure = GssProc::ContinueInit;
            }
            if step.complete {
                if peer_major != Some(GSS_S_COMPLETE) {
                    return Err(RpcError::Security(
                        "we completed context establishment before the peer did".into(),
                    ));
                }
                verify_window(mechanism.as_ref(), window, &window_verifier)?;
                debug!("security context established with {}", self.peer);
                trace!("using {service} service");
                inner.security = Some(SecuritySession::new(mechanism, handle, service, window));
                return Ok(());
            }
        }
        Err(RpcError::Security(
            "context establishment did not converge".into(),
        ))
    }

    /// Tears down the security context (if any) and reverts to the plain credential
    pub async fn destroy_security(&self) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().await;
        if inner.security.is_none() {
            return Ok(());
        }
        let result = self
            .secure_call(&mut inner, NULL_PROCEDURE, &[], true)
            .await;
        inner.security = None;
        result.map(|_| ())
    }

    /// Is a security context in use?
    pub async fn is_secure(&self) -> bool {
        self.inner.lock().await.security.is_some()
    }
}

#[async_trait]
impl CallChannel for RpcClient {
    async fn call(&self, procedure: u32, args: Bytes) -> Result<Bytes, RpcError> {
        self.call_raw(procedure, args).await
    }
}
