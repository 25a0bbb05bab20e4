//! Through commands: commands an OBCP asks us to run on its behalf.
// (c) 2025 Ross Younger
//!
//! These are not supported. Each one is acknowledged and then refused.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::Error;
use super::link::{Inbound, SossHandler, SossSender};
use crate::protocol::soss::{PacketType, SequenceNumber, SossBody, SossMessage};

/// Payload of the End sent for every through command
pub const REFUSAL: &str = "ERROR,through commands not supported";

/// Acknowledges and refuses through commands
#[derive(Debug)]
pub struct ThroughCommand {
    my_host: String,
    seq: SequenceNumber,
    sender: Arc<SossSender>,
}

impl ThroughCommand {
    /// Constructor
    #[must_use]
    pub fn new(my_host: &str, sender: Arc<SossSender>) -> Self {
        Self {
            my_host: my_host.to_string(),
            seq: SequenceNumber::default(),
            sender,
        }
    }

    async fn reply(&self, to: &str, body: SossBody) -> Result<(), Error> {
        let m = SossMessage::new(&self.my_host, to, self.seq.bump(), PacketType::Command, body);
        Ok(self.sender.send(&m).await?)
    }

    async fn process(&self, message: Inbound) -> Result<(), Error> {
        let sender = message.sender();
        let command = match message.body? {
            SossBody::Command { command } => command,
            other => {
                return Err(Error::UnexpectedMessage {
                    kind: other.msg_type().to_string(),
                    sender,
                });
            }
        };
        info!("through command from {sender}: {command:?}");
        let seq = message.header.seq_num;
        self.reply(&sender, SossBody::Ack { seq, result: 0 }).await?;
        self.reply(
            &sender,
            SossBody::End {
                seq,
                status: 1,
                payload: REFUSAL.to_string(),
            },
        )
        .await?;
        debug!("refused through command seq {seq}");
        Ok(())
    }
}

#[async_trait]
impl SossHandler for ThroughCommand {
    async fn handle(&self, message: Inbound) {
        let seq = message.header.seq_num;
        let from = message.sender();
        if let Err(e) = self.process(message).await {
            error!("through command seq {seq} from {from}: {e}");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::{REFUSAL, ThroughCommand};
    use crate::interface::link::{Inbound, SossHandler as _, SossSender};
    use crate::protocol::soss::{PacketType, SossBody, SossMessage};
    use crate::transport::LazyClient;
    use crate::util::test_protocol::SossRecorder;

    #[tokio::test]
    async fn acknowledged_then_refused() {
        let rec = SossRecorder::default();
        let thru = ThroughCommand::new(
            "obs",
            Arc::new(SossSender::new(0x2102_0011, LazyClient::new(Box::new(rec.clone())))),
        );
        let m = SossMessage::new(
            "OBCP3",
            "obs",
            41,
            PacketType::Command,
            SossBody::Command {
                command: "EXEC TSC AG".into(),
            },
        );
        thru.handle(Inbound::parse(&m.format()).unwrap()).await;

        let sent = rec.messages();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(host, _)| host == "obcp3"));
        assert_eq!(sent[0].1.body, SossBody::Ack { seq: 41, result: 0 });
        assert_eq!(
            sent[1].1.body,
            SossBody::End {
                seq: 41,
                status: 1,
                payload: REFUSAL.into()
            }
        );
        // each reply carries a fresh sequence number of our own
        assert_eq!(sent[0].1.header.seq_num + 1, sent[1].1.header.seq_num);
    }
}
