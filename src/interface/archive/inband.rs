//! In-band FITS data: the device pushes each frame to us inside an RPC call
// (c) 2025 Ross Younger

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::interface::Error;
use crate::interface::link::{SOSS_PROCEDURE, SOSS_VERSION};
use crate::protocol::fits::FitsFrame;
use crate::protocol::xdr::Packer;
use crate::server::{CallContext, ProcedureError, Program};

/// Serves the FITS data program, queueing every frame it is given
#[derive(Debug)]
pub struct FitsProgram {
    program: u32,
    queue: mpsc::UnboundedSender<FitsFrame>,
}

/// The consuming end of the frame queue
#[derive(Debug)]
pub struct InbandReceiver {
    queue: Mutex<mpsc::UnboundedReceiver<FitsFrame>>,
}

/// Creates a connected program and receiver
#[must_use]
pub fn inband_channel(program: u32) -> (FitsProgram, InbandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FitsProgram { program, queue: tx },
        InbandReceiver {
            queue: Mutex::new(rx),
        },
    )
}

#[async_trait]
impl Program for FitsProgram {
    fn program(&self) -> u32 {
        self.program
    }

    fn version(&self) -> u32 {
        SOSS_VERSION
    }

    async fn call(
        &self,
        procedure: u32,
        args: Bytes,
        context: &CallContext,
    ) -> Result<Bytes, ProcedureError> {
        if procedure != SOSS_PROCEDURE {
            return Err(ProcedureError::Unavailable);
        }
        let frame = FitsFrame::unpack(args)?;
        debug!(
            "FITS frame {:?} from {} ({} + {} bytes)",
            frame.frame_id,
            context.peer,
            frame.header.len(),
            frame.data.len()
        );
        if self.queue.send(frame).is_err() {
            // receiver gone: the interface is shutting down
            return Err(ProcedureError::SystemError);
        }
        let mut p = Packer::new();
        let _ = p.pack_bool(true);
        Ok(p.finish())
    }
}

impl InbandReceiver {
    /// Waits for the next frame and writes it to `dest`. Returns the number of bytes written.
    ///
    /// A frame whose id differs from `frame_id` is still saved, with a warning.
    /// The end marker means the device has nothing for us.
    pub async fn receive(&self, frame_id: &str, dest: &Path, wait: Duration) -> Result<u64, Error> {
        let frame = {
            let mut queue = self.queue.lock().await;
            match tokio::time::timeout(wait, queue.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(Error::Transfer("FITS data receiver closed".into())),
                Err(_) => return Err(Error::Transfer("timed out waiting for FITS data".into())),
            }
        };
        let got = frame.normalized_id();
        info!("received FITS frame {got}");
        if frame.is_end() {
            return Err(Error::Transfer(format!(
                "end of data before frame {frame_id} arrived"
            )));
        }
        if got != frame_id {
            warn!("received frame {got} does not match expected frame {frame_id}");
        }
        let mut file = tokio::fs::File::create(dest).await?;
        file.write_all(&frame.header).await?;
        file.write_all(&frame.data).await?;
        file.flush().await?;
        Ok((frame.header.len() + frame.data.len()) as u64)
    }
}
