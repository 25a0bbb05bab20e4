//! SOSS messages: a fixed 128-byte text header followed by a kind-specific payload
// (c) 2025 Ross Younger
//!
//! The header is a comma-separated record of fixed-width fields:
//!
//! | Field | Width | Notes |
//! |---|---|---|
//! | total length | 10 | zero padded |
//! | time sent | 18 | `YYYYmmddHHMMSS.mmm`, local time |
//! | protocol version | 8 | always `SUBARUV1` |
//! | sequence number | 8 | zero padded |
//! | sender | 8 | host name, left justified |
//! | process code | 5 | |
//! | uid | 5 | often blank |
//! | gid | 5 | often blank |
//! | receiver | 8 | host name, left justified |
//! | packet type | 2 | see [`PacketType`] |
//! | message type | 2 | see [`SossBody`] |
//! | payload length | 10 | zero padded |
//! | reserved | 27 | spaces |

use std::sync::atomic::{AtomicU32, Ordering};

use super::FormatError;

/// Length of the text header
pub const HEADER_LEN: usize = 128;
/// Value of the protocol version field
pub const PROTOCOL_VERSION: &str = "SUBARUV1";
/// Largest sequence number that fits the eight-digit field
pub const MAX_SEQUENCE: u32 = 99_999_999;
static_assertions::const_assert!(MAX_SEQUENCE < 100_000_000);

/// Packet family
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr)]
pub enum PacketType {
    /// Command transactions, status requests
    #[strum(serialize = "CT")]
    Command,
    /// File transfer transactions
    #[strum(serialize = "DT")]
    Data,
    /// Archive system transactions
    #[strum(serialize = "FT")]
    Fits,
    /// Status pushes
    #[strum(serialize = "ST")]
    Status,
}

/// One file in a transfer manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSpec {
    /// Path on the sending host
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Frame identifier (always upper case once parsed)
    pub frame_id: String,
}

/// Message payloads
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SossBody {
    /// `AB`: acknowledgement of a request
    Ack {
        /// Sequence number of the request being acknowledged
        seq: u32,
        /// 0 means accepted
        result: i32,
    },
    /// `CD`: a command or request
    Command {
        /// Command text
        command: String,
    },
    /// `EN`: completion of a command
    End {
        /// Sequence number of the request
        seq: u32,
        /// 0 means success
        status: i32,
        /// Application payload
        payload: String,
    },
    /// `DS`: file transfer manifest
    FileManifest {
        /// Files to fetch, in order
        files: Vec<FileSpec>,
    },
    /// `DE`: completion of a file transfer
    DataEnd {
        /// Sequence number of the manifest
        seq: u32,
        /// Aggregate result, 0 if every file succeeded
        result: i32,
        /// Per-file results, in manifest order
        statuses: Vec<i32>,
    },
    /// `FS`: archive system transfer request
    FitsStart {
        /// Path of the FITS file
        fits_path: String,
        /// Size of the FITS file
        fits_size: u64,
        /// Frame identifier
        frame_id: String,
        /// Proposal id
        prop_id: String,
        /// Destination directory
        dest_dir: String,
        /// Archive version string
        version: String,
        /// Path of the index file
        index_path: String,
        /// Size of the index file
        index_size: u64,
    },
    /// `FE`: archive system transfer completion
    FitsEnd {
        /// Sequence number of the request
        seq: u32,
        /// Aggregate result
        result: i32,
        /// Result for the FITS file
        status1: i32,
        /// Result for the index file
        status2: i32,
    },
    /// `SD`: status table push
    StatusData {
        /// Table name (eight characters, as sent)
        table: String,
        /// Opaque status data
        data: String,
    },
}

impl SossBody {
    /// Two-letter message type code
    #[must_use]
    pub fn msg_type(&self) -> &'static str {
        match self {
            SossBody::Ack { .. } => "AB",
            SossBody::Command { .. } => "CD",
            SossBody::End { .. } => "EN",
            SossBody::FileManifest { .. } => "DS",
            SossBody::DataEnd { .. } => "DE",
            SossBody::FitsStart { .. } => "FS",
            SossBody::FitsEnd { .. } => "FE",
            SossBody::StatusData { .. } => "SD",
        }
    }

    /// The packet type this kind always travels in.
    /// Acknowledgements are shared between families and have none.
    #[must_use]
    pub fn fixed_packet_type(&self) -> Option<PacketType> {
        match self {
            SossBody::Ack { .. } => None,
            SossBody::Command { .. } | SossBody::End { .. } => Some(PacketType::Command),
            SossBody::FileManifest { .. } | SossBody::DataEnd { .. } => Some(PacketType::Data),
            SossBody::FitsStart { .. } | SossBody::FitsEnd { .. } => Some(PacketType::Fits),
            SossBody::StatusData { .. } => Some(PacketType::Status),
        }
    }

    fn format_payload(&self) -> String {
        match self {
            SossBody::Ack { seq, result } => format!("{seq:08},{result:4}"),
            SossBody::Command { command } => command.clone(),
            SossBody::End {
                seq,
                status,
                payload,
            } => format!("{seq:08},{status:4},{payload}"),
            SossBody::FileManifest { files } => files
                .iter()
                .map(|f| format!("{},{},{}", f.path, f.size, f.frame_id))
                .collect::<Vec<_>>()
                .join(","),
            SossBody::DataEnd {
                seq,
                result,
                statuses,
            } => {
                let mut parts = vec![format!("{seq:08}"), format!("{result:4}")];
                parts.extend(statuses.iter().map(|s| format!("{s:4}")));
                parts.join(",")
            }
            SossBody::FitsStart {
                fits_path,
                fits_size,
                frame_id,
                prop_id,
                dest_dir,
                version,
                index_path,
                index_size,
            } => format!(
                "{fits_path},{fits_size},{frame_id},{prop_id},{dest_dir},{version},{index_path},{index_size}"
            ),
            SossBody::FitsEnd {
                seq,
                result,
                status1,
                status2,
            } => format!("{seq:08},{result:4},{status1:4},{status2:4}"),
            SossBody::StatusData { table, data } => format!("{table:<8.8},{data}"),
        }
    }

    /// Parses a payload given its two-letter message type
    pub fn parse(msg_type: &str, payload: &str) -> Result<Self, FormatError> {
        let fields: Vec<&str> = payload.split(',').collect();
        match msg_type {
            "AB" => {
                let [seq, result] = fields[..] else {
                    return Err(soss_error("AB", "expected 2 fields"));
                };
                Ok(SossBody::Ack {
                    seq: number(seq, "AB sequence")?,
                    result: number(result, "AB result")?,
                })
            }
            "CD" => Ok(SossBody::Command {
                command: payload.trim().to_string(),
            }),
            "EN" => {
                let mut parts = payload.splitn(3, ',');
                let (Some(seq), Some(status)) = (parts.next(), parts.next()) else {
                    return Err(soss_error("EN", "expected at least 2 fields"));
                };
                Ok(SossBody::End {
                    seq: number(seq, "EN sequence")?,
                    status: number(status, "EN status")?,
                    payload: parts.next().unwrap_or_default().to_string(),
                })
            }
            "DS" => {
                if fields.len() % 3 != 0 {
                    return Err(soss_error("DS", "field count is not a multiple of 3"));
                }
                let files = fields
                    .chunks_exact(3)
                    .map(|c| {
                        Ok(FileSpec {
                            path: c[0].trim().to_string(),
                            size: number(c[1], "DS size")?,
                            frame_id: c[2].trim().to_uppercase(),
                        })
                    })
                    .collect::<Result<Vec<_>, FormatError>>()?;
                Ok(SossBody::FileManifest { files })
            }
            "DE" => {
                let [seq, result, rest @ ..] = &fields[..] else {
                    return Err(soss_error("DE", "expected at least 2 fields"));
                };
                Ok(SossBody::DataEnd {
                    seq: number(seq, "DE sequence")?,
                    result: number(result, "DE result")?,
                    statuses: rest
                        .iter()
                        .map(|s| number(s, "DE status"))
                        .collect::<Result<_, _>>()?,
                })
            }
            "FS" => {
                let [
                    fits_path,
                    fits_size,
                    frame_id,
                    prop_id,
                    dest_dir,
                    version,
                    index_path,
                    index_size,
                ] = fields[..]
                else {
                    return Err(soss_error("FS", "expected 8 fields"));
                };
                Ok(SossBody::FitsStart {
                    fits_path: fits_path.to_string(),
                    fits_size: number(fits_size, "FS size")?,
                    frame_id: frame_id.to_string(),
                    prop_id: prop_id.to_string(),
                    dest_dir: dest_dir.to_string(),
                    version: version.to_string(),
                    index_path: index_path.to_string(),
                    index_size: number(index_size, "FS index size")?,
                })
            }
            "FE" => {
                let [seq, result, status1, status2] = fields[..] else {
                    return Err(soss_error("FE", "expected 4 fields"));
                };
                Ok(SossBody::FitsEnd {
                    seq: number(seq, "FE sequence")?,
                    result: number(result, "FE result")?,
                    status1: number(status1, "FE status")?,
                    status2: number(status2, "FE status")?,
                })
            }
            "SD" => {
                let table: String = payload.chars().take(8).collect();
                let data: String = payload.chars().skip(9).collect();
                Ok(SossBody::StatusData { table, data })
            }
            other => Err(FormatError::Soss(format!("unknown message type {other:?}"))),
        }
    }
}

fn soss_error(kind: &str, detail: &str) -> FormatError {
    FormatError::Soss(format!("{kind} payload: {detail}"))
}

fn number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, FormatError> {
    field
        .trim()
        .parse()
        .map_err(|_| FormatError::Soss(format!("{what}: not a number: {field:?}")))
}

/// Header fields that are not derived from the payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SossHeader {
    /// Time the message was sent, `YYYYmmddHHMMSS.mmm`
    pub time_sent: String,
    /// Protocol version string
    pub protocol_version: String,
    /// Sender's sequence number for this message
    pub seq_num: u32,
    /// Sending host (short name)
    pub sender: String,
    /// Sender's process code
    pub process_code: u32,
    /// Sender's uid (often blank)
    pub uid: String,
    /// Sender's gid (often blank)
    pub gid: String,
    /// Receiving host (short name)
    pub receiver: String,
    /// Packet family
    pub packet_type: PacketType,
}

impl SossHeader {
    /// Creates a header stamped with the current local time and our process id
    #[must_use]
    pub fn new(sender: &str, receiver: &str, packet_type: PacketType, seq_num: u32) -> Self {
        Self {
            time_sent: crate::util::time::soss_timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            seq_num,
            sender: sender.to_string(),
            process_code: std::process::id() % 100_000,
            uid: String::new(),
            gid: String::new(),
            receiver: receiver.to_string(),
            packet_type,
        }
    }
}

/// A complete SOSS message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SossMessage {
    /// Header
    pub header: SossHeader,
    /// Payload
    pub body: SossBody,
}

impl SossMessage {
    /// Builds a new outbound message.
    /// The packet type comes from the body where it is fixed, otherwise `packet_type`.
    #[must_use]
    pub fn new(
        sender: &str,
        receiver: &str,
        seq_num: u32,
        packet_type: PacketType,
        body: SossBody,
    ) -> Self {
        let packet_type = body.fixed_packet_type().unwrap_or(packet_type);
        Self {
            header: SossHeader::new(sender, receiver, packet_type, seq_num),
            body,
        }
    }

    /// Renders the message as sent on the wire
    #[must_use]
    pub fn format(&self) -> String {
        let h = &self.header;
        let payload = self.body.format_payload();
        format!(
            "{:010},{:>18.18},{:>8.8},{:08},{:<8.8},{:5},{:>5.5},{:>5.5},{:<8.8},{:>2.2},{:>2.2},{:010},{:>27.27}{}",
            HEADER_LEN + payload.len(),
            h.time_sent,
            h.protocol_version,
            h.seq_num,
            h.sender,
            h.process_code,
            h.uid,
            h.gid,
            h.receiver,
            h.packet_type.as_ref(),
            self.body.msg_type(),
            payload.len(),
            "",
            payload
        )
    }

    /// Parses a received message
    pub fn parse(message: &str) -> Result<Self, FormatError> {
        let (header, msg_type, payload) = Self::parse_header(message)?;
        let body = SossBody::parse(msg_type, payload)?;
        Ok(Self { header, body })
    }

    /// Parses only the header of a received message.
    ///
    /// Returns the header, the message type and the raw payload, so that a
    /// receiver can still reply to a message whose payload is malformed.
    pub fn parse_header(message: &str) -> Result<(SossHeader, &str, &str), FormatError> {
        let fields: Vec<&str> = message.splitn(13, ',').collect();
        if fields.len() < 12 {
            return Err(FormatError::Soss(format!(
                "header has {} fields, expected at least 12",
                fields.len()
            )));
        }
        let payload = message
            .get(HEADER_LEN..)
            .ok_or_else(|| {
                FormatError::Soss(format!("message too short ({} bytes)", message.len()))
            })?;
        let _total_len: usize = number(fields[0], "total length")?;
        let packet_type = fields[9]
            .trim()
            .parse()
            .map_err(|_| FormatError::Soss(format!("unknown packet type {:?}", fields[9])))?;
        let _payload_len: usize = number(fields[11], "payload length")?;
        let header = SossHeader {
            time_sent: fields[1].trim().to_string(),
            protocol_version: fields[2].trim().to_string(),
            seq_num: number(fields[3], "sequence number")?,
            sender: fields[4].trim().to_string(),
            process_code: number(fields[5], "process code")?,
            uid: fields[6].trim().to_string(),
            gid: fields[7].trim().to_string(),
            receiver: fields[8].trim().to_string(),
            packet_type,
        };
        Ok((header, fields[10].trim(), payload))
    }
}

/// A shared, atomically advanced SOSS sequence counter
#[derive(Debug)]
pub struct SequenceNumber(AtomicU32);

impl Default for SequenceNumber {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SequenceNumber {
    /// Constructor
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self(AtomicU32::new(Self::clamp(initial)))
    }

    fn clamp(n: u32) -> u32 {
        if n == 0 || n > MAX_SEQUENCE { 1 } else { n }
    }

    /// Sets the next value to be returned by [`bump`](Self::bump)
    pub fn reset(&self, next: u32) {
        self.0.store(Self::clamp(next), Ordering::SeqCst);
    }

    /// Returns the current value and advances the counter, wrapping after [`MAX_SEQUENCE`]
    pub fn bump(&self) -> u32 {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(if n >= MAX_SEQUENCE { 1 } else { n + 1 })
            });
        // fetch_update only fails if the closure returns None
        match previous {
            Ok(n) | Err(n) => n,
        }
    }

    /// Peeks at the value the next [`bump`](Self::bump) will return
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{
        FileSpec, HEADER_LEN, MAX_SEQUENCE, PacketType, SequenceNumber, SossBody, SossHeader,
        SossMessage,
    };

    fn fixed_header(packet_type: PacketType) -> SossHeader {
        SossHeader {
            time_sent: "20250102030405.678".into(),
            protocol_version: "SUBARUV1".into(),
            seq_num: 12,
            sender: "obs1".into(),
            process_code: 4321,
            uid: String::new(),
            gid: String::new(),
            receiver: "obc1".into(),
            packet_type,
        }
    }

    #[test]
    fn header_layout() {
        let msg = SossMessage {
            header: fixed_header(PacketType::Command),
            body: SossBody::Command {
                command: "EXEC SUBSYS CMD".into(),
            },
        };
        let s = msg.format();
        let blank = " ".repeat(5);
        let reserved = " ".repeat(27);
        assert_eq!(
            s[..HEADER_LEN],
            format!(
                "0000000143,20250102030405.678,SUBARUV1,00000012,obs1    , 4321,{blank},{blank},obc1    ,CT,CD,0000000015,{reserved}"
            )
        );
        assert_eq!(&s[HEADER_LEN..], "EXEC SUBSYS CMD");
        assert_eq!(SossMessage::parse(&s).unwrap(), msg);
    }

    #[rstest]
    #[case(PacketType::Command, SossBody::Ack { seq: 12, result: 0 }, "00000012,   0")]
    #[case(
        PacketType::Command,
        SossBody::End { seq: 12, status: 1, payload: "ERROR,".into() },
        "00000012,   1,ERROR,"
    )]
    #[case(
        PacketType::Data,
        SossBody::DataEnd { seq: 3, result: 1, statuses: vec![0, 0, 1] },
        "00000003,   1,   0,   0,   1"
    )]
    #[case(
        PacketType::Fits,
        SossBody::FitsEnd { seq: 3, result: 0, status1: 0, status2: 0 },
        "00000003,   0,   0,   0"
    )]
    #[case(
        PacketType::Status,
        SossBody::StatusData { table: "TSCS".into(), data: "abc,def".into() },
        "TSCS    ,abc,def"
    )]
    fn payload_layout(#[case] pt: PacketType, #[case] body: SossBody, #[case] expected: &str) {
        let msg = SossMessage {
            header: fixed_header(pt),
            body,
        };
        let s = msg.format();
        assert_eq!(&s[HEADER_LEN..], expected);
        let parsed = SossMessage::parse(&s).unwrap();
        if let SossBody::StatusData { table, data } = &parsed.body {
            // the table name is reported as it was padded on the wire
            assert_eq!(table, "TSCS    ");
            assert_eq!(data, "abc,def");
        } else {
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn end_payload_keeps_commas() {
        let body = SossBody::parse("EN", "00000012,   0,COMPLETE,a b,c").unwrap();
        assert_eq!(
            body,
            SossBody::End {
                seq: 12,
                status: 0,
                payload: "COMPLETE,a b,c".into()
            }
        );
        let body = SossBody::parse("EN", "00000012,   0").unwrap();
        assert_eq!(
            body,
            SossBody::End {
                seq: 12,
                status: 0,
                payload: String::new()
            }
        );
    }

    #[test]
    fn manifest_parsing() {
        let body = SossBody::parse(
            "DS",
            "/data/a.fits,2880,irca0001, /data/b.fits ,5760,IRCA0002",
        )
        .unwrap();
        assert_eq!(
            body,
            SossBody::FileManifest {
                files: vec![
                    FileSpec {
                        path: "/data/a.fits".into(),
                        size: 2880,
                        frame_id: "IRCA0001".into()
                    },
                    FileSpec {
                        path: "/data/b.fits".into(),
                        size: 5760,
                        frame_id: "IRCA0002".into()
                    },
                ]
            }
        );
        assert_eq!(
            SossMessage::new("a", "b", 1, PacketType::Command, body).header.packet_type,
            PacketType::Data
        );
    }

    #[rstest]
    #[case("DS", "/a,12")]
    #[case("DS", "/a,big,X")]
    #[case("DS", "")]
    #[case("AB", "00000001")]
    #[case("AB", "x,0")]
    #[case("EN", "00000001")]
    #[case("DE", "00000001")]
    #[case("FE", "1,2,3")]
    #[case("FS", "a,1,b")]
    #[case("ZZ", "")]
    fn malformed_payloads(#[case] kind: &str, #[case] payload: &str) {
        let _ = SossBody::parse(kind, payload).expect_err("an error was expected");
    }

    #[test]
    fn malformed_headers() {
        let _ = SossMessage::parse("short").expect_err("an error was expected");
        let good = SossMessage {
            header: fixed_header(PacketType::Command),
            body: SossBody::Ack { seq: 1, result: 0 },
        }
        .format();
        let bad = good.replacen(",CT,", ",XX,", 1);
        let _ = SossMessage::parse(&bad).expect_err("an error was expected");
        let bad = good.replacen("00000012", "0000001x", 1);
        let _ = SossMessage::parse(&bad).expect_err("an error was expected");
    }

    #[test]
    fn fresh_header_is_fixed_width() {
        let msg = SossMessage::new(
            "a-very-long-host-name",
            "obc1",
            MAX_SEQUENCE,
            PacketType::Command,
            SossBody::Command { command: "X".into() },
        );
        let s = msg.format();
        assert_eq!(s.len(), HEADER_LEN + 1);
        let parsed = SossMessage::parse(&s).unwrap();
        assert_eq!(parsed.header.sender, "a-very-l");
        assert_eq!(parsed.header.seq_num, MAX_SEQUENCE);
    }

    #[test]
    fn sequence_wraps() {
        let seq = SequenceNumber::new(MAX_SEQUENCE - 1);
        assert_eq!(seq.bump(), MAX_SEQUENCE - 1);
        assert_eq!(seq.bump(), MAX_SEQUENCE);
        assert_eq!(seq.bump(), 1);
        assert_eq!(seq.peek(), 2);
        seq.reset(40);
        assert_eq!(seq.bump(), 40);
        seq.reset(0);
        assert_eq!(seq.bump(), 1);
    }
}
