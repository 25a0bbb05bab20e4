//! RPC authentication flavors and credential bodies
// (c) 2025 Ross Younger

use bytes::Bytes;

use super::FormatError;
use super::xdr::{Packer, Unpacker};

/// Maximum length of any credential or verifier body
pub const MAX_AUTH_BYTES: usize = 400;
/// Maximum length of the machine name in a Unix-like credential
pub const MAX_MACHINE_NAME: usize = 255;
/// Maximum number of supplementary groups in a Unix-like credential
pub const MAX_GROUPS: usize = 16;
/// Security context sequence numbers must stay below this value
pub const MAXSEQ: u32 = 0x8000_0000;
/// RPCSEC_GSS credential version
pub const GSS_VERSION: u32 = 1;
/// Mechanism status: context establishment is complete
pub const GSS_S_COMPLETE: u32 = 0;
/// Mechanism status: another token exchange is required
pub const GSS_S_CONTINUE_NEEDED: u32 = 1;

/// Authentication flavors we recognise
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u32)]
pub enum AuthFlavor {
    /// No authentication
    #[strum(serialize = "AUTH_NONE")]
    None = 0,
    /// Unix-like (uid/gid) credentials
    #[strum(serialize = "AUTH_SYS")]
    Sys = 1,
    /// Short-hand verifier issued by a server
    #[strum(serialize = "AUTH_SHORT")]
    Short = 2,
    /// Diffie-Hellman
    #[strum(serialize = "AUTH_DH")]
    Dh = 3,
    /// RPCSEC_GSS security context
    #[strum(serialize = "RPCSEC_GSS")]
    RpcsecGss = 6,
}

/// An opaque authentication item as carried on the wire (credential or verifier)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueAuth {
    /// Flavor discriminant
    pub flavor: u32,
    /// Flavor-specific body (at most [`MAX_AUTH_BYTES`])
    pub body: Bytes,
}

impl Default for OpaqueAuth {
    fn default() -> Self {
        Self::none()
    }
}

impl OpaqueAuth {
    /// The null authenticator
    #[must_use]
    pub fn none() -> Self {
        Self {
            flavor: AuthFlavor::None as u32,
            body: Bytes::new(),
        }
    }

    /// Constructor
    #[must_use]
    pub fn new(flavor: AuthFlavor, body: Bytes) -> Self {
        Self {
            flavor: flavor as u32,
            body,
        }
    }

    /// Encodes this item. Bodies longer than [`MAX_AUTH_BYTES`] are refused.
    pub fn pack(&self, p: &mut Packer) -> Result<(), FormatError> {
        if self.body.len() > MAX_AUTH_BYTES {
            return Err(FormatError::TooLong {
                what: "auth body",
                len: self.body.len(),
                max: MAX_AUTH_BYTES,
            });
        }
        let _ = p.pack_u32(self.flavor).pack_opaque(&self.body);
        Ok(())
    }

    /// Decodes an item
    pub fn unpack(u: &mut Unpacker) -> Result<Self, FormatError> {
        let flavor = u.unpack_u32()?;
        let body = u.unpack_opaque_max(MAX_AUTH_BYTES, "auth body")?;
        Ok(Self { flavor, body })
    }

    /// The flavor, if we recognise it
    #[must_use]
    pub fn known_flavor(&self) -> Option<AuthFlavor> {
        AuthFlavor::from_repr(self.flavor)
    }
}

/// Unix-like credential (`AUTH_SYS`)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnixCredential {
    /// Arbitrary caller-chosen stamp, conventionally a timestamp
    pub stamp: u32,
    /// Caller's host name
    pub machine: String,
    /// Effective user id
    pub uid: u32,
    /// Effective group id
    pub gid: u32,
    /// Supplementary groups
    pub gids: Vec<u32>,
}

impl UnixCredential {
    fn encode(&self) -> Result<Bytes, FormatError> {
        if self.machine.len() > MAX_MACHINE_NAME {
            return Err(FormatError::TooLong {
                what: "machine name",
                len: self.machine.len(),
                max: MAX_MACHINE_NAME,
            });
        }
        if self.gids.len() > MAX_GROUPS {
            return Err(FormatError::TooLong {
                what: "group list",
                len: self.gids.len(),
                max: MAX_GROUPS,
            });
        }
        let mut p = Packer::new();
        let _ = p
            .pack_u32(self.stamp)
            .pack_string(&self.machine)
            .pack_u32(self.uid)
            .pack_u32(self.gid)
            .pack_array(&self.gids, |p, g| {
                let _ = p.pack_u32(*g);
            });
        Ok(p.finish())
    }

    fn decode(body: Bytes) -> Result<Self, FormatError> {
        let mut u = Unpacker::new(body);
        let stamp = u.unpack_u32()?;
        let machine = u.unpack_opaque_max(MAX_MACHINE_NAME, "machine name")?;
        let machine = String::from_utf8(machine.to_vec()).map_err(|_| FormatError::InvalidUtf8)?;
        let uid = u.unpack_u32()?;
        let gid = u.unpack_u32()?;
        let gids = u.unpack_array(Unpacker::unpack_u32)?;
        if gids.len() > MAX_GROUPS {
            return Err(FormatError::TooLong {
                what: "group list",
                len: gids.len(),
                max: MAX_GROUPS,
            });
        }
        u.finish()?;
        Ok(Self {
            stamp,
            machine,
            uid,
            gid,
            gids,
        })
    }
}

/// Security context control procedure
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u32)]
pub enum GssProc {
    /// Normal data exchange within an established context
    Data = 0,
    /// First context establishment call
    Init = 1,
    /// Subsequent context establishment calls
    ContinueInit = 2,
    /// Tear down the context
    Destroy = 3,
}

/// Protection applied to call arguments and results
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::FromRepr, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum GssService {
    /// Header authentication only
    None = 1,
    /// Arguments and results carry a checksum
    #[default]
    Integrity = 2,
    /// Arguments and results are encrypted
    Privacy = 3,
}

/// Security context credential body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GssCredential {
    /// Control procedure
    pub procedure: GssProc,
    /// Per-call sequence number
    pub seq_num: u32,
    /// Protection level
    pub service: GssService,
    /// Context handle issued by the server (empty during INIT)
    pub handle: Bytes,
}

impl GssCredential {
    fn encode(&self) -> Bytes {
        let mut p = Packer::new();
        let _ = p
            .pack_u32(GSS_VERSION)
            .pack_u32(self.procedure as u32)
            .pack_u32(self.seq_num)
            .pack_u32(self.service as u32)
            .pack_opaque(&self.handle);
        p.finish()
    }

    fn decode(body: Bytes) -> Result<Self, FormatError> {
        let mut u = Unpacker::new(body);
        let version = u.unpack_u32()?;
        if version != GSS_VERSION {
            return Err(FormatError::BadDiscriminant {
                what: "security context version",
                value: version,
            });
        }
        let procedure = u.unpack_u32()?;
        let procedure = GssProc::from_repr(procedure).ok_or(FormatError::BadDiscriminant {
            what: "security context procedure",
            value: procedure,
        })?;
        let seq_num = u.unpack_u32()?;
        let service = u.unpack_u32()?;
        let service = GssService::from_repr(service).ok_or(FormatError::BadDiscriminant {
            what: "security context service",
            value: service,
        })?;
        let handle = u.unpack_opaque()?;
        u.finish()?;
        Ok(Self {
            procedure,
            seq_num,
            service,
            handle,
        })
    }
}

/// Result of a context establishment call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GssInitResult {
    /// Context handle
    pub handle: Bytes,
    /// Mechanism major status ([`GSS_S_COMPLETE`] or [`GSS_S_CONTINUE_NEEDED`]; anything else is failure)
    pub major: u32,
    /// Mechanism minor status
    pub minor: u32,
    /// Size of the server's replay window
    pub seq_window: u32,
    /// Token for the next establishment step
    pub token: Bytes,
}

impl GssInitResult {
    /// Encoder
    pub fn pack(&self, p: &mut Packer) {
        let _ = p
            .pack_opaque(&self.handle)
            .pack_u32(self.major)
            .pack_u32(self.minor)
            .pack_u32(self.seq_window)
            .pack_opaque(&self.token);
    }

    /// Decoder
    pub fn unpack(u: &mut Unpacker) -> Result<Self, FormatError> {
        Ok(Self {
            handle: u.unpack_opaque()?,
            major: u.unpack_u32()?,
            minor: u.unpack_u32()?,
            seq_window: u.unpack_u32()?,
            token: u.unpack_opaque()?,
        })
    }
}

/// Decoded caller credential
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Credential {
    /// No authentication
    #[default]
    None,
    /// Unix-like uid/gid assertion
    UnixLike(UnixCredential),
    /// Security context
    SecurityContext(GssCredential),
}

impl Credential {
    /// Converts to the wire representation
    pub fn to_opaque(&self) -> Result<OpaqueAuth, FormatError> {
        Ok(match self {
            Credential::None => OpaqueAuth::none(),
            Credential::UnixLike(c) => OpaqueAuth::new(AuthFlavor::Sys, c.encode()?),
            Credential::SecurityContext(c) => OpaqueAuth::new(AuthFlavor::RpcsecGss, c.encode()),
        })
    }

    /// Converts from the wire representation.
    ///
    /// Flavors we do not implement are reported as [`FormatError::BadDiscriminant`].
    pub fn from_opaque(auth: &OpaqueAuth) -> Result<Self, FormatError> {
        match auth.known_flavor() {
            Some(AuthFlavor::None) => Ok(Credential::None),
            Some(AuthFlavor::Sys) => Ok(Credential::UnixLike(UnixCredential::decode(
                auth.body.clone(),
            )?)),
            Some(AuthFlavor::RpcsecGss) => Ok(Credential::SecurityContext(GssCredential::decode(
                auth.body.clone(),
            )?)),
            _ => Err(FormatError::BadDiscriminant {
                what: "auth flavor",
                value: auth.flavor,
            }),
        }
    }
}
