//! Directory of SOSS services and their RPC program numbers
// (c) 2025 Ross Younger

use std::fmt::Display;

/// Number of instrument control computers a deployment may address
pub const MAX_OBCP: u8 = 32;
/// Number of status push units
pub const MAX_MONITOR_UNIT: u8 = 5;

/// A SOSS service
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    /// Device-dependent commands to OBCP `n`
    Command(u8),
    /// Through commands from the OBCP
    Through,
    /// Status requests from the OBCP
    StatusRequest,
    /// Status pushes from a monitor unit
    StatusPush(u8),
    /// File transfer requests from OBCP `n`
    FileTransfer(u8),
    /// In-band FITS data from OBCP `n`
    FitsData(u8),
}

impl Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::Command(n) => write!(f, "OBStoOBCP{n}(cmd)"),
            Service::Through => write!(f, "OBCPtoOBS(thru)"),
            Service::StatusRequest => write!(f, "OBCPtoOBS(sreq)"),
            Service::StatusPush(u) => write!(f, "toOBS{u}(sdst)"),
            Service::FileTransfer(n) => write!(f, "OBCP{n}toOBC(file)"),
            Service::FitsData(n) => write!(f, "OBCP{n}toOBC(rpc)"),
        }
    }
}

/// The program numbers for a service.
///
/// The transaction initiator listens on `server_send` and calls `server_receive`;
/// the responder does the reverse.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProgramPair {
    /// Program the responder serves
    pub server_receive: u32,
    /// Program the initiator serves, if the service has a reply path
    pub server_send: Option<u32>,
}

/// A service number was out of range
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no such service: {0:?}")]
pub struct UnknownService(pub Service);

impl Service {
    /// Looks up the program numbers for this service
    pub fn programs(self) -> Result<ProgramPair, UnknownService> {
        let per_obcp = |n: u8, suffix: u32| {
            if (1..=MAX_OBCP).contains(&n) {
                let n = u32::from(n) << 8;
                Ok(ProgramPair {
                    server_receive: 0x2101_0000 | n | suffix,
                    server_send: Some(0x2102_0000 | n | suffix),
                })
            } else {
                Err(UnknownService(self))
            }
        };
        match self {
            Service::Command(n) => per_obcp(n, 0x03),
            Service::FileTransfer(n) => per_obcp(n, 0x41),
            Service::FitsData(n) => per_obcp(n, 0x51),
            Service::Through => Ok(ProgramPair {
                server_receive: 0x2101_0011,
                server_send: Some(0x2102_0011),
            }),
            Service::StatusRequest => Ok(ProgramPair {
                server_receive: 0x2101_0012,
                server_send: Some(0x2102_0012),
            }),
            Service::StatusPush(u) if (1..=MAX_MONITOR_UNIT).contains(&u) => Ok(ProgramPair {
                server_receive: 0x2103_0020 | u32::from(u),
                server_send: None,
            }),
            Service::StatusPush(_) => Err(UnknownService(self)),
        }
    }
}
