//! ONC-RPC call and reply messages (RFC 5531)
// (c) 2025 Ross Younger

use bytes::Bytes;

use super::FormatError;
use super::auth::OpaqueAuth;
use super::xdr::{Packer, Unpacker};

/// The only RPC protocol version we speak
pub const RPC_VERSION: u32 = 2;
/// Every program supports this procedure; it takes no arguments and returns nothing.
pub const NULL_PROCEDURE: u32 = 0;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const REPLY_ACCEPTED: u32 = 0;
const REPLY_DENIED: u32 = 1;
const REJECT_RPC_MISMATCH: u32 = 0;
const REJECT_AUTH_ERROR: u32 = 1;

/// Header of a call message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallHeader {
    /// Transaction id, echoed by the reply
    pub xid: u32,
    /// Remote program number
    pub program: u32,
    /// Remote program version
    pub version: u32,
    /// Procedure within the program
    pub procedure: u32,
    /// Caller credential
    pub credential: OpaqueAuth,
    /// Caller verifier
    pub verifier: OpaqueAuth,
}

impl CallHeader {
    /// Encodes the header up to and including the credential.
    /// This is the portion a security context signs.
    pub fn pack_to_credential(&self, p: &mut Packer) -> Result<(), FormatError> {
        let _ = p
            .pack_u32(self.xid)
            .pack_u32(MSG_CALL)
            .pack_u32(RPC_VERSION)
            .pack_u32(self.program)
            .pack_u32(self.version)
            .pack_u32(self.procedure);
        self.credential.pack(p)
    }

    /// Encodes the whole header
    pub fn pack(&self, p: &mut Packer) -> Result<(), FormatError> {
        self.pack_to_credential(p)?;
        self.verifier.pack(p)
    }
}

/// A decoded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// Header
    pub header: CallHeader,
    /// Encoded arguments, not yet interpreted
    pub args: Bytes,
    /// The bytes of the header from the xid through the credential, as received
    pub signed_portion: Bytes,
}

/// Authentication failure reasons
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u32)]
pub enum AuthStat {
    /// Success (not used in rejections)
    Ok = 0,
    /// Bad credential (seal broken)
    BadCredential = 1,
    /// Client must begin a new session
    RejectedCredential = 2,
    /// Bad verifier (seal broken)
    BadVerifier = 3,
    /// Verifier expired or replayed
    RejectedVerifier = 4,
    /// Rejected for security reasons
    TooWeak = 5,
    /// Bogus response verifier
    InvalidResponse = 6,
    /// Reason unknown
    Failed = 7,
    /// No credentials for user
    GssCredentialProblem = 13,
    /// Problem with the context
    GssContextProblem = 14,
}

/// Outcome of a call which was accepted by the server
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum AcceptStatus {
    /// The procedure ran
    #[display("success")]
    Success,
    /// The remote has not exported the program
    #[display("program unavailable")]
    ProgramUnavailable,
    /// The remote cannot support the requested version
    #[display("program version mismatch (supported {low}..={high})")]
    ProgramVersionMismatch {
        /// Lowest supported version
        low: u32,
        /// Highest supported version
        high: u32,
    },
    /// The program cannot support the requested procedure
    #[display("procedure unavailable")]
    ProcedureUnavailable,
    /// The arguments could not be decoded
    #[display("garbage arguments")]
    GarbageArguments,
    /// An error occurred on the server side
    #[display("system error")]
    SystemError,
}

/// Reason a call was denied
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum RejectStatus {
    /// The RPC version was not supported
    #[display("RPC version mismatch (supported {low}..={high})")]
    RpcVersionMismatch {
        /// Lowest supported version
        low: u32,
        /// Highest supported version
        high: u32,
    },
    /// Authentication failed
    #[display("authentication error: {_0}")]
    AuthenticationError(AuthStat),
}

/// Body of a reply message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    /// The call was accepted (which does not mean it succeeded)
    Accepted {
        /// Server verifier
        verifier: OpaqueAuth,
        /// Outcome
        status: AcceptStatus,
    },
    /// The call was denied
    Denied(RejectStatus),
}

impl ReplyBody {
    /// Convenience constructor for an accepted reply with a null verifier
    #[must_use]
    pub fn accepted(status: AcceptStatus) -> Self {
        Self::Accepted {
            verifier: OpaqueAuth::none(),
            status,
        }
    }
}

/// A decoded reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Transaction id of the call this answers
    pub xid: u32,
    /// Status information
    pub body: ReplyBody,
    /// Encoded results; empty unless the call succeeded
    pub results: Bytes,
}

/// Any RPC message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// A call
    Call(Call),
    /// A reply
    Reply(Reply),
}

/// Encodes a call message
pub fn encode_call(header: &CallHeader, args: &[u8]) -> Result<Bytes, FormatError> {
    let mut p = Packer::with_capacity(64 + args.len());
    header.pack(&mut p)?;
    let _ = p.pack_raw(args);
    Ok(p.finish())
}

/// Encodes a reply message
pub fn encode_reply(xid: u32, body: &ReplyBody, results: &[u8]) -> Result<Bytes, FormatError> {
    let mut p = Packer::with_capacity(32 + results.len());
    let _ = p.pack_u32(xid).pack_u32(MSG_REPLY);
    match body {
        ReplyBody::Accepted { verifier, status } => {
            let _ = p.pack_u32(REPLY_ACCEPTED);
            verifier.pack(&mut p)?;
            match status {
                AcceptStatus::Success => {
                    let _ = p.pack_u32(0).pack_raw(results);
                }
                AcceptStatus::ProgramUnavailable => {
                    let _ = p.pack_u32(1);
                }
                AcceptStatus::ProgramVersionMismatch { low, high } => {
                    let _ = p.pack_u32(2).pack_u32(*low).pack_u32(*high);
                }
                AcceptStatus::ProcedureUnavailable => {
                    let _ = p.pack_u32(3);
                }
                AcceptStatus::GarbageArguments => {
                    let _ = p.pack_u32(4);
                }
                AcceptStatus::SystemError => {
                    let _ = p.pack_u32(5);
                }
            }
        }
        ReplyBody::Denied(RejectStatus::RpcVersionMismatch { low, high }) => {
            let _ = p
                .pack_u32(REPLY_DENIED)
                .pack_u32(REJECT_RPC_MISMATCH)
                .pack_u32(*low)
                .pack_u32(*high);
        }
        ReplyBody::Denied(RejectStatus::AuthenticationError(stat)) => {
            let _ = p
                .pack_u32(REPLY_DENIED)
                .pack_u32(REJECT_AUTH_ERROR)
                .pack_u32(*stat as u32);
        }
    }
    Ok(p.finish())
}

/// Reads the transaction id from the front of a message without decoding the rest
#[must_use]
pub fn peek_xid(data: &[u8]) -> Option<u32> {
    data.get(0..4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_be_bytes)
}

/// Decodes any RPC message.
///
/// A call with an RPC version other than 2 fails with [`FormatError::UnsupportedRpcVersion`];
/// a responder can still answer it using [`peek_xid`].
pub fn decode_message(data: Bytes) -> Result<Message, FormatError> {
    let whole = data.clone();
    let mut u = Unpacker::new(data);
    let xid = u.unpack_u32()?;
    match u.unpack_u32()? {
        MSG_CALL => decode_call_body(xid, &whole, u).map(Message::Call),
        MSG_REPLY => decode_reply_body(xid, u).map(Message::Reply),
        other => Err(FormatError::BadDiscriminant {
            what: "message type",
            value: other,
        }),
    }
}

/// Decodes a message which must be a reply
pub fn decode_reply(data: Bytes) -> Result<Reply, FormatError> {
    match decode_message(data)? {
        Message::Reply(r) => Ok(r),
        Message::Call(_) => Err(FormatError::BadDiscriminant {
            what: "message type (expected reply)",
            value: MSG_CALL,
        }),
    }
}

fn decode_call_body(xid: u32, whole: &Bytes, mut u: Unpacker) -> Result<Call, FormatError> {
    let rpcvers = u.unpack_u32()?;
    if rpcvers != RPC_VERSION {
        return Err(FormatError::UnsupportedRpcVersion(rpcvers));
    }
    let program = u.unpack_u32()?;
    let version = u.unpack_u32()?;
    let procedure = u.unpack_u32()?;
    let credential = OpaqueAuth::unpack(&mut u)?;
    let signed_len = whole.len() - u.remaining();
    let verifier = OpaqueAuth::unpack(&mut u)?;
    Ok(Call {
        header: CallHeader {
            xid,
            program,
            version,
            procedure,
            credential,
            verifier,
        },
        args: u.take_rest(),
        signed_portion: whole.slice(0..signed_len),
    })
}

fn decode_reply_body(xid: u32, mut u: Unpacker) -> Result<Reply, FormatError> {
    let body = match u.unpack_u32()? {
        REPLY_ACCEPTED => {
            let verifier = OpaqueAuth::unpack(&mut u)?;
            let status = match u.unpack_u32()? {
                0 => AcceptStatus::Success,
                1 => AcceptStatus::ProgramUnavailable,
                2 => AcceptStatus::ProgramVersionMismatch {
                    low: u.unpack_u32()?,
                    high: u.unpack_u32()?,
                },
                3 => AcceptStatus::ProcedureUnavailable,
                4 => AcceptStatus::GarbageArguments,
                5 => AcceptStatus::SystemError,
                other => {
                    return Err(FormatError::BadDiscriminant {
                        what: "accept status",
                        value: other,
                    });
                }
            };
            ReplyBody::Accepted { verifier, status }
        }
        REPLY_DENIED => match u.unpack_u32()? {
            REJECT_RPC_MISMATCH => ReplyBody::Denied(RejectStatus::RpcVersionMismatch {
                low: u.unpack_u32()?,
                high: u.unpack_u32()?,
            }),
            REJECT_AUTH_ERROR => {
                let stat = u.unpack_u32()?;
                let stat = AuthStat::from_repr(stat).ok_or(FormatError::BadDiscriminant {
                    what: "auth status",
                    value: stat,
                })?;
                ReplyBody::Denied(RejectStatus::AuthenticationError(stat))
            }
            other => {
                return Err(FormatError::BadDiscriminant {
                    what: "reject status",
                    value: other,
                });
            }
        },
        other => {
            return Err(FormatError::BadDiscriminant {
                what: "reply status",
                value: other,
            });
        }
    };
    let results = if matches!(
        body,
        ReplyBody::Accepted {
            status: AcceptStatus::Success,
            ..
        }
    ) {
        u.take_rest()
    } else {
        u.finish()?;
        Bytes::new()
    };
    Ok(Reply { xid, body, results })
}
