//! In-band FITS frames, for devices that push image data inside RPC calls
// (c) 2025 Ross Younger

use bytes::Bytes;

use super::FormatError;
use super::xdr::{Packer, Unpacker};

/// Frame id that marks the end of a sequence of frames
pub const END_MARKER: &str = "END";
/// Only this many leading characters of the frame id are significant
pub const FRAME_ID_LEN: usize = 12;

/// One in-band frame: procedure 1 of the FITS data program
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FitsFrame {
    /// Frame identifier, possibly space or NUL padded
    pub frame_id: String,
    /// Primary header unit
    pub header: Bytes,
    /// Primary data unit
    pub data: Bytes,
}

impl FitsFrame {
    /// The significant part of the frame id, upper-cased
    #[must_use]
    pub fn normalized_id(&self) -> String {
        self.frame_id
            .chars()
            .take(FRAME_ID_LEN)
            .collect::<String>()
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_uppercase()
    }

    /// Is this the end-of-sequence marker?
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.normalized_id() == END_MARKER
    }

    /// Encoder
    pub fn pack(&self, p: &mut Packer) {
        let _ = p
            .pack_string(&self.frame_id)
            .pack_opaque(&self.header)
            .pack_opaque(&self.data);
    }

    /// Decoder; the arguments must be fully consumed
    pub fn unpack(args: Bytes) -> Result<Self, FormatError> {
        let mut u = Unpacker::new(args);
        let frame = Self {
            frame_id: u.unpack_string()?,
            header: u.unpack_opaque()?,
            data: u.unpack_opaque()?,
        };
        u.finish()?;
        Ok(frame)
    }
}
