//! # 🗃️ Transaction store
// (c) 2025 Ross Younger
//!
//! A keyed table of transaction records shared by every interface in a container.
//! Records are loosely typed field maps; interfaces that want a typed view
//! (e.g. [`crate::interface::command`]) convert with serde.
//!
//! All mutations are serialised by one lock. Changes made by [`TransactionStore::setvals`]
//! are published on the [`EventBus`] after the mutation is applied and in the
//! order the mutations happened.
//!
//! The store also keeps two small side tables: a map from SOSS sequence number to
//! tag (so Ack and End replies can be matched), and the last sequence number used
//! by each command channel (so a restarted channel does not reuse numbers).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tracing::{error, trace};

mod events;
pub use events::{Event, EventBus, Subscription};

/// A transaction record
pub type Fields = Map<String, Value>;

/// Converts a JSON object into [`Fields`]. Anything other than an object gives an empty map.
#[must_use]
pub fn fields(v: Value) -> Fields {
    match v {
        Value::Object(m) => m,
        _ => Fields::new(),
    }
}

/// Fields that must all be present before a command transaction may be deleted
pub const COMPLETION_FIELDS: [&str; 3] = ["cmd_time", "ack_time", "end_time"];

/// Errors from the transaction store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The tag is already being tracked
    #[error("duplicate tag {0}")]
    DuplicateTag(String),
    /// The tag is not being tracked
    #[error("unknown tag {0}")]
    UnknownTag(String),
    /// No transaction is bound to the sequence number
    #[error("unknown sequence number {0}")]
    UnknownSequence(u32),
    /// The sequence number is already bound to another transaction
    #[error("sequence number {seq} already in use by {tag}")]
    DuplicateSequence {
        /// Sequence number
        seq: u32,
        /// Tag currently holding it
        tag: String,
    },
    /// Deletion was attempted before the transaction completed
    #[error("transaction {tag} is incomplete (missing {missing})")]
    IncompleteTransaction {
        /// Tag
        tag: String,
        /// Name of the first missing field
        missing: &'static str,
    },
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, Fields>,
    sequences: HashMap<u32, String>,
    last_sequence: HashMap<String, u32>,
}

impl Inner {
    fn unbind(&mut self, tag: &str) {
        self.sequences.retain(|_, t| t != tag);
    }
}

/// The shared transaction table
#[derive(Debug, Default)]
pub struct TransactionStore {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl TransactionStore {
    /// Constructor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The event bus that [`TransactionStore::setvals`] publishes on
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Starts tracking a new transaction
    pub fn put(&self, tag: &str, record: Fields) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.records.contains_key(tag) {
            return Err(StoreError::DuplicateTag(tag.to_string()));
        }
        let _ = inner.records.insert(tag.to_string(), record);
        trace!("tracking {tag}");
        Ok(())
    }

    /// Returns a copy of a transaction record
    pub fn get(&self, tag: &str) -> Result<Fields, StoreError> {
        self.lock()
            .records
            .get(tag)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTag(tag.to_string()))
    }

    /// Is the tag being tracked?
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.lock().records.contains_key(tag)
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Is the store empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges `values` into the record for `tag` (creating it if necessary), then
    /// publishes the change on each of `channels`.
    pub fn setvals(&self, channels: &[&str], tag: &str, values: Fields) {
        let mut inner = self.lock();
        inner
            .records
            .entry(tag.to_string())
            .or_default()
            .extend(values.clone());
        for ch in channels {
            self.events.publish(Event {
                channel: (*ch).to_string(),
                tag: tag.to_string(),
                fields: values.clone(),
            });
        }
    }

    /// Read-modify-write of an existing record, under the lock.
    ///
    /// `f` inspects the current record and returns the fields to merge plus a value
    /// for the caller. If `f` fails, nothing changes. The merged fields are then
    /// published on `channels` as [`setvals`](Self::setvals) would; an empty
    /// change publishes nothing.
    pub fn update<R, E, F>(&self, channels: &[&str], tag: &str, f: F) -> Result<R, E>
    where
        E: From<StoreError>,
        F: FnOnce(&Fields) -> Result<(Fields, R), E>,
    {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(tag)
            .ok_or_else(|| StoreError::UnknownTag(tag.to_string()))?;
        let (changes, result) = f(record)?;
        if changes.is_empty() {
            return Ok(result);
        }
        record.extend(changes.clone());
        for ch in channels {
            self.events.publish(Event {
                channel: (*ch).to_string(),
                tag: tag.to_string(),
                fields: changes.clone(),
            });
        }
        Ok(result)
    }

    /// Publishes values on the given channels without recording them
    pub fn publish(&self, channels: &[&str], tag: &str, values: &Fields) {
        let _guard = self.lock();
        for ch in channels {
            self.events.publish(Event {
                channel: (*ch).to_string(),
                tag: tag.to_string(),
                fields: values.clone(),
            });
        }
    }

    /// Removes a completed transaction. Removing an absent tag is not an error.
    ///
    /// A transaction is complete once it has all of [`COMPLETION_FIELDS`].
    pub fn delete(&self, tag: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(record) = inner.records.get(tag) else {
            return Ok(());
        };
        if let Some(missing) = COMPLETION_FIELDS
            .iter()
            .find(|f| record.get(**f).is_none_or(Value::is_null))
        {
            error!("attempt to delete incomplete transaction {tag} (no {missing})");
            return Err(StoreError::IncompleteTransaction {
                tag: tag.to_string(),
                missing,
            });
        }
        let _ = inner.records.remove(tag);
        inner.unbind(tag);
        Ok(())
    }

    /// Removes a transaction whatever its state (used on error paths)
    pub fn discard(&self, tag: &str) {
        let mut inner = self.lock();
        if inner.records.remove(tag).is_some() {
            trace!("discarded {tag}");
        }
        inner.unbind(tag);
    }

    /// Associates a sequence number with a tag
    pub fn bind_sequence(&self, seq: u32, tag: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.sequences.get(&seq) {
            return Err(StoreError::DuplicateSequence {
                seq,
                tag: existing.clone(),
            });
        }
        let _ = inner.sequences.insert(seq, tag.to_string());
        Ok(())
    }

    /// Looks up the tag bound to a sequence number
    pub fn tag_for(&self, seq: u32) -> Result<String, StoreError> {
        self.lock()
            .sequences
            .get(&seq)
            .cloned()
            .ok_or(StoreError::UnknownSequence(seq))
    }

    /// Records the last sequence number used by a channel
    pub fn set_last_sequence(&self, channel: &str, seq: u32) {
        let _ = self.lock().last_sequence.insert(channel.to_string(), seq);
    }

    /// The last sequence number recorded for a channel
    #[must_use]
    pub fn last_sequence(&self, channel: &str) -> Option<u32> {
        self.lock().last_sequence.get(channel).copied()
    }
}
