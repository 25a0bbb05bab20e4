//! Status requests from an OBCP
// (c) 2025 Ross Younger
//!
//! The request is a CD message `STATUS,<alias> <alias> ...`. We acknowledge it
//! straight away, look the aliases up, and send the values back in an End.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::collaborators::StatusSource;
use super::link::{Inbound, SossHandler, SossSender};
use super::{Error, HostFilter};
use crate::protocol::soss::{PacketType, SequenceNumber, SossBody, SossMessage};

/// Value sent for an alias that could not be looked up
pub const UNDEFINED: &str = "UNDEF";
/// Width every value is padded or truncated to
pub const VALUE_WIDTH: usize = 64;

/// Splits a request into its aliases. `$` signs are dropped.
pub fn parse_request(command: &str) -> Result<Vec<String>, Error> {
    let Some((verb, aliases)) = command.split_once(',') else {
        return Err(Error::MalformedRequest(format!(
            "status request format error: {command:?}"
        )));
    };
    if verb != "STATUS" {
        return Err(Error::MalformedRequest(format!(
            "status request format error: {command:?}"
        )));
    }
    Ok(aliases
        .replace('$', "")
        .split_whitespace()
        .map(ToString::to_string)
        .collect())
}

/// Renders one value the way the requester expects it
#[must_use]
pub fn format_value(value: &str) -> String {
    format!("{value:<VALUE_WIDTH$.VALUE_WIDTH$}")
}

/// Answers status requests
#[derive(Debug)]
pub struct StatusRequest {
    my_host: String,
    seq: SequenceNumber,
    filter: HostFilter,
    source: Arc<dyn StatusSource>,
    sender: Arc<SossSender>,
}

impl StatusRequest {
    /// Constructor. `sender` should cache one channel per requesting host.
    #[must_use]
    pub fn new(
        my_host: &str,
        filter: HostFilter,
        source: Arc<dyn StatusSource>,
        sender: Arc<SossSender>,
    ) -> Self {
        Self {
            my_host: my_host.to_string(),
            seq: SequenceNumber::default(),
            filter,
            source,
            sender,
        }
    }

    async fn reply(&self, to: &str, body: SossBody) -> Result<(), Error> {
        let m = SossMessage::new(&self.my_host, to, self.seq.bump(), PacketType::Command, body);
        Ok(self.sender.send(&m).await?)
    }

    /// Looks up the aliases and builds the End status and payload
    async fn lookup(&self, aliases: &[String]) -> (i32, String) {
        match self.source.fetch(aliases).await {
            Ok(values) => {
                let rendered: Vec<String> = aliases
                    .iter()
                    .map(|a| match values.get(a) {
                        Some(v) => format_value(&v.to_string()),
                        None => {
                            error!("error getting status for {a:?}");
                            format_value(UNDEFINED)
                        }
                    })
                    .collect();
                (0, format!("COMPLETE,{}", rendered.join(" ")))
            }
            Err(e) => {
                error!("error getting status: {e:#}");
                (1, "ERROR,".to_string())
            }
        }
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
        if !self.filter.allows(&sender) {
            warn!("host {sender} not in filter list; dropping request");
            return Ok(());
        }
        let aliases = parse_request(&command)?;
        let seq = message.header.seq_num;
        self.reply(&sender, SossBody::Ack { seq, result: 0 }).await?;

        let (status, payload) = self.lookup(&aliases).await;
        self.reply(
            &sender,
            SossBody::End {
                seq,
                status,
                payload,
            },
        )
        .await?;
        debug!("answered status request seq {seq} ({} aliases)", aliases.len());
        Ok(())
    }
}

#[async_trait]
impl SossHandler for StatusRequest {
    async fn handle(&self, message: Inbound) {
        let seq = message.header.seq_num;
        let from = message.sender();
        if let Err(e) = self.process(message).await {
            error!("status request seq {seq} from {from}: {e}");
        }
    }
}
