//! # 🔌 Interfaces
// (c) 2025 Ross Younger
//!
//! Each interface handles one SOSS service for one instrument control computer (OBCP):
//!
//! | Name   | Type                               | Who initiates | Purpose |
//! |--------|------------------------------------|---------------|---------|
//! | `cmd`  | [`command::CommandChannel`]        | us            | device-dependent commands |
//! | `thru` | [`through::ThroughCommand`]        | OBCP          | through commands (always refused) |
//! | `sreq` | [`status_request::StatusRequest`]  | OBCP          | status value lookups |
//! | `sdst` | [`status_receiver::StatusReceiver`]| OBCP          | status table pushes |
//! | `file` | [`archive::Archive`]               | OBCP          | frame file transfers |
//!
//! Every interface talks through a [`link::SossLink`] and implements
//! [`link::SossHandler`]. Handlers run as worker pool tasks, never on the listener.

use std::collections::HashSet;

use crate::protocol::FormatError;
use crate::store::StoreError;
use crate::transport::RpcError;

pub mod archive;
pub mod collaborators;
pub mod command;
pub mod link;
pub mod status_receiver;
pub mod status_request;
pub mod through;

/// Errors raised while handling an interface transaction
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transaction bookkeeping failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A remote call failed
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// A received message could not be decoded
    #[error(transparent)]
    Format(#[from] FormatError),
    /// A second acknowledgement arrived for one transaction
    #[error("duplicate ack for sequence number {seq} ({tag})")]
    DuplicateAck {
        /// Sequence number
        seq: u32,
        /// Transaction tag
        tag: String,
    },
    /// A second completion arrived for one transaction
    #[error("duplicate end for sequence number {seq} ({tag})")]
    DuplicateEnd {
        /// Sequence number
        seq: u32,
        /// Transaction tag
        tag: String,
    },
    /// A completion arrived but its acknowledgement never did
    #[error("no ack for sequence number {seq} within {waited:?} of its end")]
    AckTimeout {
        /// Sequence number
        seq: u32,
        /// How long we waited
        waited: std::time::Duration,
    },
    /// The peer reported a non-zero result
    #[error("peer reported result {result}: {payload}")]
    Result {
        /// Result code
        result: i32,
        /// Explanation sent by the peer (may be empty)
        payload: String,
    },
    /// A transferred file is not the size we were told
    #[error("file size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Size from the manifest
        expected: u64,
        /// Size on disk
        actual: u64,
    },
    /// A request could not be understood
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// A message of a kind this interface does not handle
    #[error("unexpected {kind} message from {sender}")]
    UnexpectedMessage {
        /// Two letter message type
        kind: String,
        /// Sending host
        sender: String,
    },
    /// A file transfer failed
    #[error("transfer failed: {0}")]
    Transfer(String),
    /// Local I/O failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The set of hosts allowed to make requests of an interface.
///
/// An empty filter allows everyone. Host names are compared case-insensitively.
/// Requests from other hosts are dropped without reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostFilter(Option<HashSet<String>>);

impl HostFilter {
    /// A filter that allows every host
    #[must_use]
    pub fn allow_all() -> Self {
        Self(None)
    }

    /// A filter allowing only the given hosts. An empty list allows every host.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: HashSet<String> = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if set.is_empty() {
            Self(None)
        } else {
            Self(Some(set))
        }
    }

    /// Is `host` allowed?
    #[must_use]
    pub fn allows(&self, host: &str) -> bool {
        match &self.0 {
            None => true,
            Some(set) => set.contains(&host.trim().to_lowercase()),
        }
    }
}
