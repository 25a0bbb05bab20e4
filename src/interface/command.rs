//! Device-dependent commands, sent by us to an OBCP
// (c) 2025 Ross Younger
//!
//! A command transaction goes through these states:
//!
//! ```text
//! Idle --send--> Sent --AB--> Acked --EN--> Completed
//!                  \            \
//!                   +------------+--error--> Failed
//! ```
//!
//! An End that overtakes its Ack is tolerated with a warning; the transaction
//! completes when both have been seen, and fails if the Ack has not turned up
//! within [`DEFAULT_ACK_WAIT`] of the End. Every other irregularity fails the
//! transaction. Either way exactly one terminal event (`done: true`, with `result`
//! 0 or -1) is published on the channel's event topic and the record leaves the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Instrument as _, debug, error, info, info_span, warn};

use super::Error;
use super::link::{Inbound, SossHandler, SossSender};
use crate::protocol::soss::{PacketType, SequenceNumber, SossBody, SossMessage};
use crate::store::{Fields, StoreError, TransactionStore, fields};
use crate::util::time::now_seconds;

/// How long a transaction whose End overtook its Ack waits for the Ack
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Event topic for commands to OBCP `n`
#[must_use]
pub fn channel_name(obcp: u8) -> String {
    format!("INSint{obcp}")
}

/// Strips anything after the first `;`, and surrounding whitespace
#[must_use]
pub fn normalize(command: &str) -> &str {
    command
        .split_once(';')
        .map_or(command, |(c, _)| c)
        .trim()
}

/// Where a command transaction has got to
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum CommandState {
    /// Recorded, not yet sent
    Idle,
    /// Sent, not yet acknowledged (an End may already have arrived)
    Sent,
    /// Acknowledged
    Acked,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
}

/// Typed view of a command transaction record
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Transaction {
    /// Command text, as sent
    pub cmd_str: Option<String>,
    /// When [`CommandChannel::begin`] was called
    pub time_start: Option<f64>,
    /// Sequence number
    pub seq_num: Option<u32>,
    /// When the command was sent
    pub cmd_time: Option<f64>,
    /// When the Ack arrived
    pub ack_time: Option<f64>,
    /// Ack result code
    pub ack_result: Option<i32>,
    /// When the End arrived
    pub end_time: Option<f64>,
    /// End result code
    pub end_result: Option<i32>,
    /// End payload
    pub end_payload: Option<String>,
    /// Terminal result: 0 success, -1 failure
    pub result: Option<i32>,
    /// Set once the transaction is over
    pub done: Option<bool>,
}

impl Transaction {
    /// Reads the typed view from a record
    pub fn from_fields(record: &Fields) -> Result<Self, serde_json::Error> {
        Self::deserialize(&Value::Object(record.clone()))
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CommandState {
        if self.done == Some(true) {
            return if self.result == Some(0) {
                CommandState::Completed
            } else {
                CommandState::Failed
            };
        }
        // an End without its Ack still counts as awaiting the Ack
        match (self.cmd_time, self.ack_time) {
            (None, _) => CommandState::Idle,
            (Some(_), None) => CommandState::Sent,
            (Some(_), Some(_)) => CommandState::Acked,
        }
    }
}

fn has(record: &Fields, key: &str) -> bool {
    record.get(key).is_some_and(|v| !v.is_null())
}

fn terminal(message: &str, result: i32) -> Fields {
    fields(json!({
        "message": message,
        "time_done": now_seconds(),
        "result": result,
        "done": true,
    }))
}

/// Sends commands to one OBCP and tracks their replies
#[derive(Debug)]
pub struct CommandChannel {
    obcp: u8,
    obcp_host: String,
    my_host: String,
    channel: String,
    seq: SequenceNumber,
    store: Arc<TransactionStore>,
    sender: Arc<SossSender>,
    ack_wait: Duration,
}

impl CommandChannel {
    /// Constructor.
    /// Numbering carries on from the last sequence number the store remembers for this OBCP.
    #[must_use]
    pub fn new(
        obcp: u8,
        obcp_host: &str,
        my_host: &str,
        store: Arc<TransactionStore>,
        sender: Arc<SossSender>,
    ) -> Self {
        let channel = channel_name(obcp);
        let seq = SequenceNumber::default();
        if let Some(last) = store.last_sequence(&channel) {
            seq.reset(last.wrapping_add(1));
            debug!("{channel}: continuing from sequence number {}", seq.peek());
        }
        Self {
            obcp,
            obcp_host: obcp_host.to_string(),
            my_host: my_host.to_string(),
            channel,
            seq,
            store,
            sender,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }

    /// Sets how long to wait for an Ack that has been overtaken by its End
    #[must_use]
    pub fn with_ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = wait;
        self
    }

    /// Event topic this channel publishes on
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// OBCP number
    #[must_use]
    pub fn obcp(&self) -> u8 {
        self.obcp
    }

    /// Starts tracking a command. Nothing is sent.
    ///
    /// Returns the normalized command text.
    pub fn begin(&self, tag: &str, command: &str) -> Result<String, Error> {
        let command = normalize(command);
        if command.is_empty() {
            return Err(Error::MalformedRequest(format!("{tag}: empty command")));
        }
        self.store.put(tag, Fields::new())?;
        self.store.setvals(
            &[self.channel.as_str()],
            tag,
            fields(json!({ "cmd_str": command, "time_start": now_seconds() })),
        );
        Ok(command.to_string())
    }

    /// Sends a command previously passed to [`begin`](Self::begin).
    /// Returns the sequence number used.
    ///
    /// On failure the transaction is finished with result -1.
    pub async fn transmit(&self, tag: &str, command: &str) -> Result<u32, Error> {
        let result = self
            .try_transmit(tag, command)
            .instrument(info_span!("cmd", tag))
            .await;
        if let Err(e) = &result {
            self.fail(tag, e);
        }
        result
    }

    async fn try_transmit(&self, tag: &str, command: &str) -> Result<u32, Error> {
        let seq = self.seq.bump();
        let message = SossMessage::new(
            &self.my_host,
            &self.obcp_host,
            seq,
            PacketType::Command,
            SossBody::Command {
                command: command.to_string(),
            },
        );
        self.store.setvals(
            &[self.channel.as_str()],
            tag,
            fields(json!({ "seq_num": seq, "cmd_time": now_seconds() })),
        );
        self.store.bind_sequence(seq, tag)?;
        self.store.set_last_sequence(&self.channel, seq);
        info!("sending seq {seq} to {}: {command}", self.obcp_host);
        self.sender.send(&message).await?;
        Ok(seq)
    }

    /// [`begin`](Self::begin) then [`transmit`](Self::transmit)
    pub async fn send(&self, tag: &str, command: &str) -> Result<u32, Error> {
        let command = self.begin(tag, command)?;
        self.transmit(tag, &command).await
    }

    fn fail(&self, tag: &str, err: &Error) {
        error!("{tag}: command failed: {err}");
        self.store
            .setvals(&[self.channel.as_str()], tag, terminal(&err.to_string(), -1));
        self.store.discard(tag);
    }

    /// Both halves have been seen and were good
    fn complete(&self, tag: &str, seq: u32) -> Result<(), Error> {
        self.store
            .setvals(&[self.channel.as_str()], tag, terminal("command completed", 0));
        info!("seq {seq} completed");
        self.store.delete(tag)?;
        Ok(())
    }

    fn on_ack(&self, tag: &str, seq: u32, result: i32) -> Result<(), Error> {
        let end_seen = self.store.update(&[self.channel.as_str()], tag, |rec| {
            if has(rec, "ack_time") {
                return Err(Error::DuplicateAck {
                    seq,
                    tag: tag.to_string(),
                });
            }
            let changes = fields(json!({ "ack_time": now_seconds(), "ack_result": result }));
            Ok((changes, has(rec, "end_time")))
        })?;
        if end_seen {
            warn!("ack for seq {seq} arrived after its end");
        }
        if result != 0 {
            return Err(Error::Result {
                result,
                payload: String::new(),
            });
        }
        debug!("seq {seq} acknowledged");
        // a failed End would already have finished the transaction
        if end_seen {
            self.complete(tag, seq)?;
        }
        Ok(())
    }

    fn on_end(&self, tag: &str, seq: u32, status: i32, payload: &str) -> Result<(), Error> {
        let ack_seen = self.store.update(&[self.channel.as_str()], tag, |rec| {
            if has(rec, "end_time") {
                return Err(Error::DuplicateEnd {
                    seq,
                    tag: tag.to_string(),
                });
            }
            let changes = fields(json!({
                "end_time": now_seconds(),
                "end_result": status,
                "end_payload": payload,
            }));
            Ok((changes, has(rec, "ack_time")))
        })?;
        if status != 0 {
            return Err(Error::Result {
                result: status,
                payload: payload.to_string(),
            });
        }
        if ack_seen {
            return self.complete(tag, seq);
        }
        warn!("end for seq {seq} arrived before its ack");
        self.expire_without_ack(tag, seq);
        Ok(())
    }

    /// Fails the transaction if its Ack has not arrived after `ack_wait`
    fn expire_without_ack(&self, tag: &str, seq: u32) {
        let store = self.store.clone();
        let channel = self.channel.clone();
        let tag = tag.to_string();
        let waited = self.ack_wait;
        drop(tokio::spawn(
            async move {
                tokio::time::sleep(waited).await;
                let err = Error::AckTimeout { seq, waited };
                let expired = store.update(&[channel.as_str()], &tag, |rec| {
                    let pending = !has(rec, "ack_time")
                        && rec.get("seq_num").and_then(Value::as_u64) == Some(u64::from(seq));
                    if pending {
                        Ok::<_, StoreError>((terminal(&err.to_string(), -1), true))
                    } else {
                        Ok((Fields::new(), false))
                    }
                });
                if expired == Ok(true) {
                    error!("{tag}: command failed: {err}");
                    store.discard(&tag);
                }
            }
            .in_current_span(),
        ));
    }

    fn on_reply(&self, sender: &str, seq: u32, apply: impl FnOnce(&str) -> Result<(), Error>) {
        let tag = match self.store.tag_for(seq) {
            Ok(t) => t,
            Err(e) => {
                error!("reply from {sender}: {e}");
                return;
            }
        };
        let _span = info_span!("cmd", tag = %tag).entered();
        if let Err(e) = apply(&tag) {
            self.fail(&tag, &e);
        }
    }
}

#[async_trait]
impl SossHandler for CommandChannel {
    async fn handle(&self, message: Inbound) {
        let sender = message.sender();
        let body = match message.body {
            Ok(b) => b,
            Err(e) => {
                error!(
                    "undecodable {} reply from {sender} (seq {}): {e}",
                    message.msg_type, message.header.seq_num
                );
                return;
            }
        };
        match body {
            SossBody::Ack { seq, result } => {
                self.on_reply(&sender, seq, |tag| self.on_ack(tag, seq, result));
            }
            SossBody::End {
                seq,
                status,
                payload,
            } => {
                self.on_reply(&sender, seq, |tag| self.on_end(tag, seq, status, &payload));
            }
            other => {
                let e = Error::UnexpectedMessage {
                    kind: other.msg_type().to_string(),
                    sender,
                };
                error!("{}: {e}", self.channel);
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assertables::assert_contains;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::{CommandChannel, CommandState, Transaction, normalize};
    use crate::interface::Error;
    use crate::interface::link::{Inbound, SossHandler as _, SossSender};
    use crate::protocol::soss::{PacketType, SossBody, SossMessage};
    use crate::store::{Event, StoreError, Subscription, TransactionStore, fields};
    use crate::transport::LazyClient;
    use crate::util::test_protocol::SossRecorder;

    struct Rig {
        store: Arc<TransactionStore>,
        recorder: SossRecorder,
        channel: CommandChannel,
        events: Subscription,
    }

    fn rig_with(store: Arc<TransactionStore>, recorder: SossRecorder) -> Rig {
        let sender = Arc::new(SossSender::new(
            0x2101_0903,
            LazyClient::new(Box::new(recorder.clone())),
        ));
        let events = store.events().subscribe(&["INSint9"]);
        let channel = CommandChannel::new(9, "OBCP9", "obs", store.clone(), sender);
        Rig {
            store,
            recorder,
            channel,
            events,
        }
    }

    fn rig() -> Rig {
        rig_with(Arc::new(TransactionStore::new()), SossRecorder::default())
    }

    fn reply(body: SossBody) -> Inbound {
        let m = SossMessage::new("obcp9", "obs", 500, PacketType::Command, body);
        Inbound::parse(&m.format()).unwrap()
    }

    fn ack(seq: u32, result: i32) -> Inbound {
        reply(SossBody::Ack { seq, result })
    }

    fn end(seq: u32, status: i32, payload: &str) -> Inbound {
        reply(SossBody::End {
            seq,
            status,
            payload: payload.into(),
        })
    }

    fn terminal_events(sub: &mut Subscription) -> Vec<Event> {
        std::iter::from_fn(|| sub.try_recv())
            .filter(|e| e.fields.contains_key("done"))
            .collect()
    }

    #[rstest]
    #[case("EXEC TSC MOVE ; ", "EXEC TSC MOVE")]
    #[case("  EXEC A B=1;junk;more", "EXEC A B=1")]
    #[case("EXEC", "EXEC")]
    fn normalization(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input), expected);
    }

    #[tokio::test]
    async fn round_trip() {
        let store = Arc::new(TransactionStore::new());
        store.set_last_sequence("INSint9", 11);
        let mut r = rig_with(store, SossRecorder::default());

        let seq = r.channel.send("act.47", "EXEC OBS TIMER;").await.unwrap();
        assert_eq!(seq, 12);
        let sent = r.recorder.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "obcp9");
        assert_eq!(sent[0].1.header.seq_num, 12);
        assert_eq!(
            sent[0].1.body,
            SossBody::Command {
                command: "EXEC OBS TIMER".into()
            }
        );
        let t = Transaction::from_fields(&r.store.get("act.47").unwrap()).unwrap();
        assert_eq!(t.state(), CommandState::Sent);

        r.channel.handle(ack(12, 0)).await;
        let t = Transaction::from_fields(&r.store.get("act.47").unwrap()).unwrap();
        assert_eq!(t.state(), CommandState::Acked);

        r.channel.handle(end(12, 0, "DONE:")).await;
        assert!(r.store.is_empty());
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].tag, "act.47");
        assert_eq!(done[0].fields["result"], 0);
        assert_eq!(done[0].fields["done"], true);
        assert_eq!(r.store.last_sequence("INSint9"), Some(12));
    }

    #[tokio::test]
    async fn duplicate_tag_is_refused_locally() {
        let r = rig();
        let _ = r.channel.send("t1", "EXEC A").await.unwrap();
        let e = r
            .channel
            .send("t1", "EXEC B")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::Store(StoreError::DuplicateTag(_))));
        assert_eq!(r.recorder.messages().len(), 1);
        let t = Transaction::from_fields(&r.store.get("t1").unwrap()).unwrap();
        assert_eq!(t.cmd_str.as_deref(), Some("EXEC A"));
    }

    #[tokio::test]
    async fn end_before_ack_completes() {
        let mut r = rig();
        let seq = r.channel.send("t", "EXEC A").await.unwrap();
        r.channel.handle(end(seq, 0, "")).await;
        assert!(r.store.contains("t"));
        r.channel.handle(ack(seq, 0)).await;
        assert!(r.store.is_empty());
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fields["result"], 0);
    }

    #[tokio::test]
    async fn end_then_refused_ack_fails_once() {
        let mut r = rig();
        let seq = r.channel.send("t", "EXEC A").await.unwrap();
        r.channel.handle(end(seq, 0, "")).await;
        let t = Transaction::from_fields(&r.store.get("t").unwrap()).unwrap();
        assert_eq!(t.state(), CommandState::Sent);
        assert!(terminal_events(&mut r.events).is_empty());

        r.channel.handle(ack(seq, 4)).await;
        assert!(r.store.is_empty());
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fields["result"], -1);
    }

    #[tokio::test]
    async fn duplicate_end_after_completion_is_ignored() {
        let mut r = rig();
        let seq = r.channel.send("t", "EXEC A").await.unwrap();
        r.channel.handle(ack(seq, 0)).await;
        r.channel.handle(end(seq, 0, "")).await;
        r.channel.handle(end(seq, 0, "")).await;
        assert!(r.store.is_empty());
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fields["result"], 0);
    }

    #[tokio::test]
    async fn missing_ack_expires() {
        let mut r = rig();
        r.channel = r.channel.with_ack_wait(Duration::from_millis(50));
        let seq = r.channel.send("t", "EXEC A").await.unwrap();
        r.channel.handle(end(seq, 0, "")).await;
        assert!(r.store.contains("t"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(r.store.is_empty());
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fields["result"], -1);
        assert_contains!(done[0].fields["message"].to_string(), "no ack");

        // the Ack turning up afterwards changes nothing
        r.channel.handle(ack(seq, 0)).await;
        assert!(terminal_events(&mut r.events).is_empty());
    }

    #[tokio::test]
    async fn late_ack_beats_expiry() {
        let mut r = rig();
        r.channel = r.channel.with_ack_wait(Duration::from_millis(100));
        let seq = r.channel.send("t", "EXEC A").await.unwrap();
        r.channel.handle(end(seq, 0, "")).await;
        r.channel.handle(ack(seq, 0)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fields["result"], 0);
    }

    #[rstest]
    #[case::ack_refused(vec![ack(1, 3)])]
    #[case::end_refused(vec![ack(1, 0), end(1, 2, "ERROR,bad")])]
    #[case::duplicate_ack(vec![ack(1, 0), ack(1, 0)])]
    #[case::duplicate_end_awaiting_ack(vec![end(1, 0, ""), end(1, 0, "")])]
    #[tokio::test]
    async fn failures_finish_the_transaction(#[case] replies: Vec<Inbound>) {
        let mut r = rig();
        let seq = r.channel.send("t", "EXEC A").await.unwrap();
        assert_eq!(seq, 1);
        for m in replies {
            r.channel.handle(m).await;
        }
        assert!(r.store.is_empty());
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fields["result"], -1);
        // late replies for a finished transaction are only logged
        r.channel.handle(end(1, 0, "")).await;
        assert!(r.store.is_empty());
    }

    #[tokio::test]
    async fn send_failure_finishes_the_transaction() {
        let mut r = rig_with(Arc::new(TransactionStore::new()), SossRecorder::failing());
        let e = r
            .channel
            .send("t", "EXEC A")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::Rpc(_)));
        assert!(r.store.is_empty());
        let done = terminal_events(&mut r.events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fields["result"], -1);
        assert_eq!(done[0].fields["done"], json!(true));
    }

    #[tokio::test]
    async fn unknown_sequence_is_ignored() {
        let r = rig();
        r.store.put("other", fields(json!({}))).unwrap();
        r.channel.handle(ack(77, 0)).await;
        r.channel
            .handle(reply(SossBody::Command {
                command: "x".into(),
            }))
            .await;
        assert_eq!(r.store.len(), 1);
    }

    #[test]
    fn empty_command_is_malformed() {
        let r = rig();
        assert!(matches!(
            r.channel.begin("t", " ;x"),
            Err(Error::MalformedRequest(_))
        ));
        assert!(r.store.is_empty());
    }
}
