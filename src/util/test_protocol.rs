//! Test helpers for functions dealing with on-wire protocols
// (c) 2025 Ross Younger

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::auth::{
    AuthFlavor, Credential, GSS_S_COMPLETE, GssCredential, GssInitResult, GssProc, OpaqueAuth,
};
use crate::protocol::rpc::{AcceptStatus, Call, Message, ReplyBody, decode_message, encode_reply};
use crate::protocol::soss::{SossBody, SossMessage};
use crate::protocol::xdr::{Packer, Unpacker};
use crate::transport::security::{SecurityMechanism as _, SharedKeyMechanism};
use crate::transport::{CallChannel, Connector, Exchange, Protocol, RpcError};

type Script = Box<dyn FnMut(Call) -> Option<Bytes> + Send + Sync>;

/// An [`Exchange`] that hands each decoded call to a closure instead of a network.
/// The closure returns the encoded reply, or `None` to simulate silence.
pub(crate) struct ScriptedExchange {
    script: Script,
}

impl std::fmt::Debug for ScriptedExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScriptedExchange")
    }
}

impl ScriptedExchange {
    pub(crate) fn new<F>(script: F) -> Self
    where
        F: FnMut(Call) -> Option<Bytes> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
        }
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn exchange(&mut self, _xid: u32, request: Bytes) -> Result<Bytes, RpcError> {
        let Message::Call(call) = decode_message(request)? else {
            return Err(RpcError::Transport("not a call".into()));
        };
        (self.script)(call).ok_or(RpcError::Timeout { attempts: 1 })
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn peer(&self) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9)
    }
}

/// Encodes a reply to `call`
pub(crate) fn reply_with(call: &Call, body: &ReplyBody, results: &[u8]) -> Bytes {
    encode_reply(call.header.xid, body, results).unwrap()
}

/// Plays the server side of a shared-key security context with the integrity service.
/// DATA calls have their arguments echoed back.
pub(crate) struct SharedKeyResponder {
    mechanism: SharedKeyMechanism,
    seq_window: u32,
    /// Flip a bit in every DATA reply's checksum
    pub(crate) corrupt_results: bool,
    /// Every security context credential received
    pub(crate) seen: Arc<Mutex<Vec<GssCredential>>>,
}

impl SharedKeyResponder {
    pub(crate) fn new(key: &[u8], seq_window: u32) -> Self {
        Self {
            mechanism: SharedKeyMechanism::new(key),
            seq_window,
            corrupt_results: false,
            seen: Arc::default(),
        }
    }

    fn verifier_over(&self, n: u32) -> OpaqueAuth {
        OpaqueAuth::new(
            AuthFlavor::RpcsecGss,
            self.mechanism.get_mic(&n.to_be_bytes()).unwrap(),
        )
    }

    pub(crate) fn respond(&self, call: &Call) -> Option<Bytes> {
        let Credential::SecurityContext(cred) =
            Credential::from_opaque(&call.header.credential).unwrap()
        else {
            panic!("expected a security context credential");
        };
        self.seen.lock().unwrap().push(cred.clone());
        match cred.procedure {
            GssProc::Init | GssProc::ContinueInit => {
                let mut u = Unpacker::new(call.args.clone());
                let token = u.unpack_opaque().unwrap();
                let result = GssInitResult {
                    handle: Bytes::from_static(b"ctx1"),
                    major: GSS_S_COMPLETE,
                    minor: 0,
                    seq_window: self.seq_window,
                    token: self.mechanism.accept(&token).unwrap(),
                };
                let mut p = Packer::new();
                result.pack(&mut p);
                let body = ReplyBody::Accepted {
                    verifier: self.verifier_over(self.seq_window),
                    status: AcceptStatus::Success,
                };
                Some(reply_with(call, &body, &p.finish()))
            }
            GssProc::Data | GssProc::Destroy => {
                self.mechanism
                    .verify_mic(&call.signed_portion, &call.header.verifier.body)
                    .unwrap();
                let mut u = Unpacker::new(call.args.clone());
                let body = u.unpack_opaque().unwrap();
                let mic = u.unpack_opaque().unwrap();
                self.mechanism.verify_mic(&body, &mic).unwrap();
                assert_eq!(body[..4], cred.seq_num.to_be_bytes());

                let mut mic = self.mechanism.get_mic(&body).unwrap().to_vec();
                if self.corrupt_results {
                    mic[0] ^= 1;
                }
                let mut p = Packer::new();
                let _ = p.pack_opaque(&body).pack_opaque(&mic);
                let reply = ReplyBody::Accepted {
                    verifier: self.verifier_over(cred.seq_num),
                    status: AcceptStatus::Success,
                };
                Some(reply_with(call, &reply, &p.finish()))
            }
        }
    }
}

/// A [`CallChannel`] that records what it was asked to send and answers from a closure
pub(crate) struct RecordingChannel {
    #[allow(clippy::type_complexity)]
    answer: Box<dyn Fn(u32, &Bytes) -> Result<Bytes, RpcError> + Send + Sync>,
    /// Every (procedure, args) sent
    pub(crate) sent: Mutex<Vec<(u32, Bytes)>>,
}

impl std::fmt::Debug for RecordingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordingChannel")
    }
}

impl RecordingChannel {
    pub(crate) fn new<F>(answer: F) -> Self
    where
        F: Fn(u32, &Bytes) -> Result<Bytes, RpcError> + Send + Sync + 'static,
    {
        Self {
            answer: Box::new(answer),
            sent: Mutex::default(),
        }
    }

    /// A channel on which every call returns XDR `true`
    pub(crate) fn accepting() -> Self {
        Self::new(|_, _| Ok(Bytes::from_static(b"\0\0\0\x01")))
    }

    pub(crate) fn sent(&self) -> Vec<(u32, Bytes)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallChannel for RecordingChannel {
    async fn call(&self, procedure: u32, args: Bytes) -> Result<Bytes, RpcError> {
        let result = (self.answer)(procedure, &args);
        self.sent.lock().unwrap().push((procedure, args));
        result
    }
}

/// A [`Connector`] whose channels decode every SOSS message sent through them
/// and record it with the destination host
#[derive(Clone, Debug, Default)]
pub(crate) struct SossRecorder {
    messages: Arc<Mutex<Vec<(String, SossMessage)>>>,
    failing: bool,
}

impl SossRecorder {
    /// A recorder whose calls all fail at the transport level
    pub(crate) fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Everything sent so far
    pub(crate) fn messages(&self) -> Vec<(String, SossMessage)> {
        self.messages.lock().unwrap().clone()
    }

    /// Just the message bodies sent so far
    pub(crate) fn bodies(&self) -> Vec<SossBody> {
        self.messages().into_iter().map(|(_, m)| m.body).collect()
    }
}

#[async_trait]
impl Connector for SossRecorder {
    async fn connect(&self, host: &str) -> Result<Arc<dyn CallChannel>, RpcError> {
        let messages = self.messages.clone();
        let failing = self.failing;
        let host = host.to_string();
        Ok(Arc::new(RecordingChannel::new(move |_, args| {
            if failing {
                return Err(RpcError::Transport("connection refused".into()));
            }
            let mut u = Unpacker::new(args.clone());
            let text = u.unpack_string()?;
            let message = SossMessage::parse(&text)?;
            messages.lock().unwrap().push((host.clone(), message));
            Ok(Bytes::from_static(b"\0\0\0\x01"))
        })))
    }
}
