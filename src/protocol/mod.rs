// (c) 2025 Ross Younger
//! # 📖 Wire protocols
//!
//! insint speaks two layered protocols to the instrument control computer (OBCP):
//!
//! 1. **ONC-RPC** (RFC 5531) carries every exchange.
//!    * Data is encoded with [XDR](xdr).
//!    * Over TCP each message is wrapped in [record marking](record) fragments;
//!      over UDP one datagram holds one message.
//!    * Credentials may be `AUTH_NONE`, `AUTH_SYS` or an RPCSEC_GSS-shaped
//!      security context; see [auth].
//! 2. **SOSS messages** ride inside RPC procedure 1 as a single XDR string.
//!    See [soss] for the header layout and the message kinds.
//!
//! #### Transaction shapes
//!
//! Command (we initiate):
//! * ➡️ `CT,CD` command text, sent to the OBCP's receive program
//! * ⬅️ `CT,AB` acknowledgement carrying our sequence number and a result
//! * ⬅️ `CT,EN` completion carrying our sequence number, a result and a payload
//!
//! Status request and through-command (the OBCP initiates):
//! * ⬅️ `CT,CD`
//! * ➡️ `CT,AB` then ➡️ `CT,EN`
//!
//! File transfer (the OBCP initiates):
//! * ⬅️ `DT,DS` file manifest
//! * ➡️ `DT,AB`, files are fetched, then ➡️ `DT,DE` with per-file results
//!
//! Status push (the OBCP initiates, no reply beyond the RPC result):
//! * ⬅️ `ST,SD`
//!
//! Every SOSS call is answered at the RPC level with XDR `bool` `true`.
//! The program numbers involved are listed by [`service::Service`].

pub mod auth;
pub mod fits;
pub mod record;
pub mod rpc;
pub mod service;
pub mod soss;
pub mod xdr;

/// A message could not be decoded (or encoded)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The message ended before a complete item could be read
    #[error("message truncated at offset {offset}: wanted {wanted} bytes, {available} available")]
    Truncated {
        /// Byte offset of the failed read
        offset: usize,
        /// Bytes required
        wanted: usize,
        /// Bytes remaining
        available: usize,
    },
    /// Bytes were left over after all expected items were read.
    /// This usually means the two peers disagree about a message schema.
    #[error("{0} bytes of unextracted data")]
    TrailingData(usize),
    /// An enumerated field held a value we do not understand
    #[error("invalid value {value} for {what}")]
    BadDiscriminant {
        /// Name of the field
        what: &'static str,
        /// The value received
        value: u32,
    },
    /// A length-limited field was too long
    #[error("{what} too long ({len} bytes, limit {max})")]
    TooLong {
        /// Name of the field
        what: &'static str,
        /// Length received
        len: usize,
        /// Permitted maximum
        max: usize,
    },
    /// A string was not valid UTF-8
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// The RPC version is not 2
    #[error("unsupported RPC version {0}")]
    UnsupportedRpcVersion(u32),
    /// A SOSS message header or payload was malformed
    #[error("malformed SOSS message: {0}")]
    Soss(String),
}
