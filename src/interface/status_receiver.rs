//! Status table pushes (SD messages) from a monitor unit
// (c) 2025 Ross Younger

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::Error;
use super::collaborators::StatusSink;
use super::link::{Inbound, SossHandler};
use crate::protocol::soss::SossBody;

/// Hands pushed status tables to a [`StatusSink`]. Nothing is sent back.
#[derive(Debug)]
pub struct StatusReceiver {
    unit: u8,
    sink: Arc<dyn StatusSink>,
}

impl StatusReceiver {
    /// Constructor
    #[must_use]
    pub fn new(unit: u8, sink: Arc<dyn StatusSink>) -> Self {
        Self { unit, sink }
    }

    fn process(&self, message: Inbound) -> Result<(), Error> {
        match message.body? {
            SossBody::StatusData { table, data } => {
                info!("got table [{table}]");
                self.sink
                    .put_table(&table, &data)
                    .map_err(|e| Error::Transfer(format!("storing table {table}: {e:#}")))
            }
            other => Err(Error::UnexpectedMessage {
                kind: other.msg_type().to_string(),
                sender: message.header.sender.to_lowercase(),
            }),
        }
    }
}

#[async_trait]
impl SossHandler for StatusReceiver {
    async fn handle(&self, message: Inbound) {
        if let Err(e) = self.process(message) {
            error!("status unit {}: {e}", self.unit);
        }
    }
}
