//! Security contexts (RPCSEC_GSS style)
// (c) 2025 Ross Younger
//!
//! A client first establishes a context with the server by exchanging mechanism
//! tokens in INIT and CONTINUE_INIT calls. Afterwards every call carries a DATA
//! credential with a strictly increasing sequence number, a verifier that is a
//! checksum (MIC) over the call header, and (with the integrity service) a
//! checksummed argument body. The server's reply verifier is a checksum over the
//! sequence number; any mismatch is a [`RpcError::Security`].
//!
//! The cryptography is supplied by a [`SecurityMechanism`]. We ship one,
//! [`SharedKeyMechanism`], which authenticates both ends with a pre-shared key.

use std::fmt::Debug;

use bytes::Bytes;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;

use super::RpcError;
use crate::protocol::auth::{
    AuthFlavor, GssCredential, GssProc, GssService, MAXSEQ, OpaqueAuth,
};
use crate::protocol::xdr::{Packer, Unpacker};

type HmacSha256 = Hmac<Sha256>;

/// One step of context establishment, as seen by the local mechanism
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MechanismStep {
    /// The local side considers the context established
    pub complete: bool,
    /// Token to send to the peer; empty if there is nothing to send
    pub token: Bytes,
}

/// Cryptographic mechanism behind a security context
pub trait SecurityMechanism: Send + Sync + Debug {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Advances context establishment. `peer_token` is empty on the first step.
    fn step(&mut self, peer_token: &[u8]) -> Result<MechanismStep, RpcError>;

    /// Computes a checksum over `message`
    fn get_mic(&self, message: &[u8]) -> Result<Bytes, RpcError>;

    /// Checks a checksum produced by the peer
    fn verify_mic(&self, message: &[u8], mic: &[u8]) -> Result<(), RpcError>;

    /// Encrypts `message` (privacy service)
    fn wrap(&self, _message: &[u8]) -> Result<Bytes, RpcError> {
        Err(RpcError::Security(format!(
            "{} does not support the privacy service",
            self.name()
        )))
    }

    /// Decrypts `message` (privacy service)
    fn unwrap(&self, _message: &[u8]) -> Result<Bytes, RpcError> {
        Err(RpcError::Security(format!(
            "{} does not support the privacy service",
            self.name()
        )))
    }
}

/// Token prefix identifying the shared-key mechanism
const SHARED_KEY_MAGIC: &[u8] = b"ISK1";
const NONCE_LEN: usize = 16;

/// A mechanism based on a key known to both ends.
///
/// The initiator sends a random nonce; the acceptor proves knowledge of the key
/// by returning an HMAC-SHA256 of the nonce. Checksums are HMAC-SHA256 over the
/// message. Privacy is not supported.
#[derive(Clone, derive_more::Debug)]
pub struct SharedKeyMechanism {
    #[debug(skip)]
    key: Vec<u8>,
    nonce: Option<[u8; NONCE_LEN]>,
}

impl SharedKeyMechanism {
    /// Constructor
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            nonce: None,
        }
    }

    fn mac(&self) -> Result<HmacSha256, RpcError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| RpcError::Security(format!("unusable key: {e}")))
    }

    fn proof(&self, nonce: &[u8]) -> Result<Bytes, RpcError> {
        let mut mac = self.mac()?;
        mac.update(b"acceptor");
        mac.update(nonce);
        Ok(Bytes::from(mac.finalize().into_bytes().to_vec()))
    }

    /// Acceptor side: answers an initiator's first token
    pub fn accept(&self, initiator_token: &[u8]) -> Result<Bytes, RpcError> {
        let nonce = initiator_token
            .strip_prefix(SHARED_KEY_MAGIC)
            .filter(|n| n.len() == NONCE_LEN)
            .ok_or_else(|| RpcError::Security("malformed shared-key token".into()))?;
        self.proof(nonce)
    }
}

impl SecurityMechanism for SharedKeyMechanism {
    fn name(&self) -> &'static str {
        "shared-key"
    }

    fn step(&mut self, peer_token: &[u8]) -> Result<MechanismStep, RpcError> {
        match self.nonce {
            None => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                self.nonce = Some(nonce);
                let mut token = SHARED_KEY_MAGIC.to_vec();
                token.extend_from_slice(&nonce);
                Ok(MechanismStep {
                    complete: false,
                    token: token.into(),
                })
            }
            Some(nonce) => {
                let mut mac = self.mac()?;
                mac.update(b"acceptor");
                mac.update(&nonce);
                mac.verify_slice(peer_token)
                    .map_err(|_| RpcError::Security("peer failed to prove the shared key".into()))?;
                Ok(MechanismStep {
                    complete: true,
                    token: Bytes::new(),
                })
            }
        }
    }

    fn get_mic(&self, message: &[u8]) -> Result<Bytes, RpcError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(Bytes::from(mac.finalize().into_bytes().to_vec()))
    }

    fn verify_mic(&self, message: &[u8], mic: &[u8]) -> Result<(), RpcError> {
        let mut mac = self.mac()?;
        mac.update(message);
        mac.verify_slice(mic)
            .map_err(|_| RpcError::Security("checksum mismatch".into()))
    }
}

/// XDR encoding of a single `u32`, as checksummed in verifiers
fn xdr_u32(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// An established security context, owned by one channel
#[derive(Debug)]
pub struct SecuritySession {
    mechanism: Box<dyn SecurityMechanism>,
    handle: Bytes,
    service: GssService,
    seq_num: u32,
    seq_window: u32,
}

impl SecuritySession {
    /// Wraps a freshly established context
    pub(crate) fn new(
        mechanism: Box<dyn SecurityMechanism>,
        handle: Bytes,
        service: GssService,
        seq_window: u32,
    ) -> Self {
        Self {
            mechanism,
            handle,
            service,
            seq_num: 0,
            seq_window,
        }
    }

    /// The server's replay window, as reported during establishment
    #[must_use]
    pub fn seq_window(&self) -> u32 {
        self.seq_window
    }

    /// The sequence number of the most recent DATA call
    #[must_use]
    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    /// Allocates the credential for the next DATA call
    pub(crate) fn next_credential(&mut self) -> Result<GssCredential, RpcError> {
        let next = self.seq_num + 1;
        if next >= MAXSEQ {
            return Err(RpcError::Security(
                "sequence numbers exhausted; the context must be re-established".into(),
            ));
        }
        self.seq_num = next;
        Ok(GssCredential {
            procedure: GssProc::Data,
            seq_num: next,
            service: self.service,
            handle: self.handle.clone(),
        })
    }

    /// Credential for tearing down the context
    pub(crate) fn destroy_credential(&mut self) -> Result<GssCredential, RpcError> {
        let mut cred = self.next_credential()?;
        cred.procedure = GssProc::Destroy;
        Ok(cred)
    }

    /// Verifier for a call whose header (xid through credential) is `header`
    pub(crate) fn call_verifier(&self, header: &[u8]) -> Result<OpaqueAuth, RpcError> {
        Ok(OpaqueAuth::new(
            AuthFlavor::RpcsecGss,
            self.mechanism.get_mic(header)?,
        ))
    }

    /// Applies the service protection to call arguments
    pub(crate) fn seal(&self, seq_num: u32, args: &[u8]) -> Result<Bytes, RpcError> {
        if self.service == GssService::None {
            return Ok(Bytes::copy_from_slice(args));
        }
        let mut body = Vec::with_capacity(4 + args.len());
        body.extend_from_slice(&xdr_u32(seq_num));
        body.extend_from_slice(args);
        let mut p = Packer::with_capacity(body.len() + 48);
        match self.service {
            GssService::None => (),
            GssService::Integrity => {
                let mic = self.mechanism.get_mic(&body)?;
                let _ = p.pack_opaque(&body).pack_opaque(&mic);
            }
            GssService::Privacy => {
                let sealed = self.mechanism.wrap(&body)?;
                let _ = p.pack_opaque(&sealed);
            }
        }
        Ok(p.finish())
    }

    /// Checks the reply verifier and removes the service protection from the results
    pub(crate) fn open(
        &self,
        seq_num: u32,
        verifier: &OpaqueAuth,
        results: Bytes,
    ) -> Result<Bytes, RpcError> {
        if verifier.known_flavor() != Some(AuthFlavor::RpcsecGss) {
            return Err(RpcError::Security(format!(
                "reply verifier has flavor {}",
                verifier.flavor
            )));
        }
        self.mechanism
            .verify_mic(&xdr_u32(seq_num), &verifier.body)
            .map_err(|e| RpcError::Security(format!("reply verifier: {e}")))?;

        let body = match self.service {
            GssService::None => return Ok(results),
            GssService::Integrity => {
                let mut u = Unpacker::new(results);
                let body = u.unpack_opaque()?;
                let mic = u.unpack_opaque()?;
                u.finish()?;
                self.mechanism.verify_mic(&body, &mic)?;
                body
            }
            GssService::Privacy => {
                let mut u = Unpacker::new(results);
                let sealed = u.unpack_opaque()?;
                u.finish()?;
                self.mechanism.unwrap(&sealed)?
            }
        };
        let mut u = Unpacker::new(body);
        let echoed = u.unpack_u32()?;
        if echoed != seq_num {
            return Err(RpcError::Security(format!(
                "reply carries sequence number {echoed}, expected {seq_num}"
            )));
        }
        Ok(u.take_rest())
    }
}

/// Checks the verifier that completes context establishment: a checksum over the window size
pub(crate) fn verify_window(
    mechanism: &dyn SecurityMechanism,
    seq_window: u32,
    verifier: &OpaqueAuth,
) -> Result<(), RpcError> {
    if verifier.known_flavor() != Some(AuthFlavor::RpcsecGss) {
        return Err(RpcError::Security(
            "context established without a verifier".into(),
        ));
    }
    mechanism.verify_mic(&xdr_u32(seq_window), &verifier.body)
}
