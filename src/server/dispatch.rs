//! Call decoding and procedure dispatch for responders
// (c) 2025 Ross Younger

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::protocol::FormatError;
use crate::protocol::auth::{AuthFlavor, Credential};
use crate::protocol::rpc::{
    AcceptStatus, AuthStat, Message, NULL_PROCEDURE, RPC_VERSION, RejectStatus, ReplyBody,
    decode_message, encode_reply, peek_xid,
};
use crate::transport::Protocol;

/// Why a procedure could not produce results
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcedureError {
    /// No such procedure
    #[error("procedure unavailable")]
    Unavailable,
    /// The arguments could not be decoded
    #[error("garbage arguments")]
    GarbageArguments,
    /// Something went wrong locally
    #[error("system error")]
    SystemError,
}

impl From<FormatError> for ProcedureError {
    fn from(_: FormatError) -> Self {
        ProcedureError::GarbageArguments
    }
}

/// Who sent a call, and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Address the call came from
    pub peer: SocketAddr,
    /// Protocol it came over
    pub protocol: Protocol,
    /// Decoded caller credential
    pub credential: Credential,
}

/// A program served by a responder
#[async_trait]
pub trait Program: Send + Sync + Debug {
    /// Program number
    fn program(&self) -> u32;

    /// Program version
    fn version(&self) -> u32;

    /// Runs a procedure other than the null procedure.
    ///
    /// This is called from the listener task, so it must not block on application logic;
    /// long-running work should be queued.
    async fn call(
        &self,
        procedure: u32,
        args: Bytes,
        context: &CallContext,
    ) -> Result<Bytes, ProcedureError>;
}

fn reply(xid: u32, body: &ReplyBody, results: &[u8]) -> Option<Bytes> {
    match encode_reply(xid, body, results) {
        Ok(b) => Some(b),
        Err(e) => {
            warn!("failed to encode reply to xid {xid:#x}: {e}");
            None
        }
    }
}

fn denied(xid: u32, status: AuthStat) -> Option<Bytes> {
    reply(
        xid,
        &ReplyBody::Denied(RejectStatus::AuthenticationError(status)),
        &[],
    )
}

/// Decodes one incoming message, runs it against `program`, and returns the encoded reply.
///
/// Returns `None` when nothing should be sent back: the message was a reply, or
/// could not be decoded far enough to identify it.
pub async fn handle_request(
    program: &dyn Program,
    message: Bytes,
    peer: SocketAddr,
    protocol: Protocol,
) -> Option<Bytes> {
    let call = match decode_message(message.clone()) {
        Ok(Message::Call(c)) => c,
        Ok(Message::Reply(r)) => {
            debug!("ignoring reply (xid {:#x}) from {peer}", r.xid);
            return None;
        }
        Err(FormatError::UnsupportedRpcVersion(v)) => {
            let xid = peek_xid(&message)?;
            debug!("call from {peer} uses RPC version {v}");
            return reply(
                xid,
                &ReplyBody::Denied(RejectStatus::RpcVersionMismatch {
                    low: RPC_VERSION,
                    high: RPC_VERSION,
                }),
                &[],
            );
        }
        Err(e) => {
            warn!("undecodable message from {peer}: {e}");
            return None;
        }
    };
    let header = &call.header;
    let xid = header.xid;

    let credential = match header.credential.known_flavor() {
        Some(AuthFlavor::None | AuthFlavor::Sys) => {
            match Credential::from_opaque(&header.credential) {
                Ok(c) => c,
                Err(e) => {
                    debug!("bad credential from {peer}: {e}");
                    return denied(xid, AuthStat::BadCredential);
                }
            }
        }
        _ => {
            debug!(
                "call from {peer} uses unsupported credential flavor {}",
                header.credential.flavor
            );
            return denied(xid, AuthStat::TooWeak);
        }
    };

    if header.program != program.program() {
        return reply(xid, &ReplyBody::accepted(AcceptStatus::ProgramUnavailable), &[]);
    }
    if header.version != program.version() {
        let v = program.version();
        return reply(
            xid,
            &ReplyBody::accepted(AcceptStatus::ProgramVersionMismatch { low: v, high: v }),
            &[],
        );
    }
    if header.procedure == NULL_PROCEDURE {
        trace!("null call from {peer}");
        return reply(xid, &ReplyBody::accepted(AcceptStatus::Success), &[]);
    }

    let context = CallContext {
        peer,
        protocol,
        credential,
    };
    let (status, results) = match program.call(header.procedure, call.args, &context).await {
        Ok(r) => (AcceptStatus::Success, r),
        Err(ProcedureError::Unavailable) => (AcceptStatus::ProcedureUnavailable, Bytes::new()),
        Err(ProcedureError::GarbageArguments) => (AcceptStatus::GarbageArguments, Bytes::new()),
        Err(ProcedureError::SystemError) => (AcceptStatus::SystemError, Bytes::new()),
    };
    if status != AcceptStatus::Success {
        debug!(
            "procedure {} of {:#x} from {peer}: {status}",
            header.procedure, header.program
        );
    }
    reply(xid, &ReplyBody::accepted(status), &results)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{CallContext, ProcedureError, Program, handle_request};
    use crate::protocol::auth::{AuthFlavor, OpaqueAuth};
    use crate::protocol::rpc::{
        AcceptStatus, AuthStat, CallHeader, RejectStatus, ReplyBody, decode_reply, encode_call,
        encode_reply,
    };
    use crate::protocol::xdr::{Packer, Unpacker};
    use crate::transport::Protocol;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl Program for Echo {
        fn program(&self) -> u32 {
            0x2000_0001
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
            match procedure {
                1 => {
                    let mut u = Unpacker::new(args);
                    let s = u.unpack_string()?;
                    u.finish()?;
                    let mut p = Packer::new();
                    let _ = p.pack_string(&s.to_uppercase());
                    Ok(p.finish())
                }
                2 => Err(ProcedureError::SystemError),
                _ => Err(ProcedureError::Unavailable),
            }
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1234)
    }

    fn call(
        program: u32,
        version: u32,
        procedure: u32,
        credential: OpaqueAuth,
        args: &[u8],
    ) -> Bytes {
        let h = CallHeader {
            xid: 77,
            program,
            version,
            procedure,
            credential,
            verifier: OpaqueAuth::none(),
        };
        encode_call(&h, args).unwrap()
    }

    async fn run(msg: Bytes) -> Option<ReplyBody> {
        handle_request(&Echo, msg, peer(), Protocol::Tcp)
            .await
            .map(|r| decode_reply(r).unwrap().body)
    }

    #[tokio::test]
    async fn successful_call() {
        let mut p = Packer::new();
        let _ = p.pack_string("abc");
        let r = handle_request(
            &Echo,
            call(0x2000_0001, 1, 1, OpaqueAuth::none(), &p.finish()),
            peer(),
            Protocol::Udp,
        )
        .await
        .unwrap();
        let r = decode_reply(r).unwrap();
        assert_eq!(r.xid, 77);
        assert_eq!(r.body, ReplyBody::accepted(AcceptStatus::Success));
        let mut u = Unpacker::new(r.results);
        assert_eq!(u.unpack_string().unwrap(), "ABC");
    }

    #[rstest]
    #[case(0x2000_0002, 1, 1, b"".as_slice(), AcceptStatus::ProgramUnavailable)]
    #[case(
        0x2000_0001,
        3,
        1,
        b"".as_slice(),
        AcceptStatus::ProgramVersionMismatch { low: 1, high: 1 }
    )]
    #[case(0x2000_0001, 1, 9, b"".as_slice(), AcceptStatus::ProcedureUnavailable)]
    #[case(0x2000_0001, 1, 1, b"\0\0\0\x09abc".as_slice(), AcceptStatus::GarbageArguments)]
    #[case(0x2000_0001, 1, 2, b"".as_slice(), AcceptStatus::SystemError)]
    #[case(0x2000_0001, 1, 0, b"".as_slice(), AcceptStatus::Success)]
    #[tokio::test]
    async fn dispatch_outcomes(
        #[case] program: u32,
        #[case] version: u32,
        #[case] procedure: u32,
        #[case] args: &[u8],
        #[case] expected: AcceptStatus,
    ) {
        let body = run(call(program, version, procedure, OpaqueAuth::none(), args))
            .await
            .unwrap();
        assert_eq!(body, ReplyBody::accepted(expected));
    }

    #[tokio::test]
    async fn credential_checks() {
        let gss = OpaqueAuth::new(AuthFlavor::RpcsecGss, Bytes::from_static(b"\0\0\0\x01"));
        assert_eq!(
            run(call(0x2000_0001, 1, 0, gss, &[])).await.unwrap(),
            ReplyBody::Denied(RejectStatus::AuthenticationError(AuthStat::TooWeak))
        );
        let garbled = OpaqueAuth::new(AuthFlavor::Sys, Bytes::from_static(b"\0\0"));
        assert_eq!(
            run(call(0x2000_0001, 1, 0, garbled, &[])).await.unwrap(),
            ReplyBody::Denied(RejectStatus::AuthenticationError(AuthStat::BadCredential))
        );
        let unknown = OpaqueAuth {
            flavor: 99,
            body: Bytes::new(),
        };
        assert_eq!(
            run(call(0x2000_0001, 1, 0, unknown, &[])).await.unwrap(),
            ReplyBody::Denied(RejectStatus::AuthenticationError(AuthStat::TooWeak))
        );
    }

    #[tokio::test]
    async fn wrong_rpc_version() {
        let mut msg = call(0x2000_0001, 1, 0, OpaqueAuth::none(), &[]).to_vec();
        msg[11] = 3;
        assert_eq!(
            run(Bytes::from(msg)).await.unwrap(),
            ReplyBody::Denied(RejectStatus::RpcVersionMismatch { low: 2, high: 2 })
        );
    }

    #[tokio::test]
    async fn replies_and_garbage_get_no_answer() {
        let r = encode_reply(5, &ReplyBody::accepted(AcceptStatus::Success), &[]).unwrap();
        assert!(run(r).await.is_none());
        assert!(run(Bytes::from_static(b"\0\0")).await.is_none());
    }
}
