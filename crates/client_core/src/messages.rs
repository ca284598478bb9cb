use chrono::{DateTime, Utc};
use shared::{
    domain::{DeliveryState, Identity, MessageId},
    protocol::{supersedes, MessageRecord, Revision},
};
use uuid::Uuid;

use crate::error::{CommandResult, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stable for the lifetime of the entry, including across acknowledgment.
    pub local_id: Uuid,
    /// Absent until the server acknowledges the message.
    pub message_id: Option<MessageId>,
    pub author: Identity,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_updated_by: Option<Identity>,
    pub state: DeliveryState,
}

impl Message {
    pub(crate) fn placeholder(author: Identity, body: String) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            message_id: None,
            author,
            body,
            created_at: Utc::now(),
            updated_at: None,
            last_updated_by: None,
            state: DeliveryState::Pending,
        }
    }

    pub(crate) fn from_record(record: MessageRecord, local_id: Uuid) -> Self {
        Self {
            local_id,
            message_id: Some(record.message_id),
            author: record.author,
            body: record.body,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_updated_by: record.last_updated_by,
            state: DeliveryState::Sent,
        }
    }

    fn absorb(&mut self, record: MessageRecord) {
        self.message_id = Some(record.message_id);
        self.author = record.author;
        self.body = record.body;
        self.created_at = record.created_at;
        self.updated_at = record.updated_at;
        self.last_updated_by = record.last_updated_by;
        self.state = DeliveryState::Sent;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Acknowledged {
    /// First confirmation of this message; observers have not seen it yet.
    Added(Message),
    /// Already visible through an earlier echo or acknowledgment.
    Merged(Message),
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    revision: Revision,
    message: Message,
}

impl Entry {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.message.created_at, self.seq)
    }

    fn note(&mut self, revision: Revision) {
        self.revision = self.revision.max(revision);
    }
}

/// Messages of one channel ordered by creation time, ties broken by insertion.
#[derive(Debug, Default)]
pub(crate) struct MessageLog {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl MessageLog {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn all(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub(crate) fn get_local(&self, local_id: Uuid) -> Option<&Message> {
        self.position_local(local_id)
            .map(|index| &self.entries[index].message)
    }

    pub(crate) fn get_by_id(&self, message_id: &MessageId) -> Option<&Message> {
        self.position_id(message_id)
            .map(|index| &self.entries[index].message)
    }

    pub(crate) fn contains_id(&self, message_id: &MessageId) -> bool {
        self.position_id(message_id).is_some()
    }

    /// Inserts a placeholder on first send, or re-arms a failed one.
    pub(crate) fn stage(&mut self, message: &Message) -> CommandResult<Message> {
        match self.position_local(message.local_id) {
            None => {
                let mut staged = message.clone();
                staged.message_id = None;
                staged.state = DeliveryState::Pending;
                self.insert(staged.clone(), 0);
                Ok(staged)
            }
            Some(index) => {
                let entry = &mut self.entries[index].message;
                match entry.state {
                    DeliveryState::Failed => {
                        entry.state = DeliveryState::Pending;
                        Ok(entry.clone())
                    }
                    DeliveryState::Pending => {
                        Err(SyncError::validation("message is already being sent"))
                    }
                    DeliveryState::Sent => Err(SyncError::validation("message was already sent")),
                }
            }
        }
    }

    pub(crate) fn mark_failed(&mut self, local_id: Uuid) -> Option<Message> {
        let index = self.position_local(local_id)?;
        let message = &mut self.entries[index].message;
        if message.state != DeliveryState::Pending {
            return None;
        }
        message.state = DeliveryState::Failed;
        Some(message.clone())
    }

    pub(crate) fn acknowledge(&mut self, local_id: Uuid, record: MessageRecord) -> Acknowledged {
        let placeholder = self.position_local(local_id);
        let echoed = self.position_id(&record.message_id);
        match (placeholder, echoed) {
            (Some(p), Some(e)) if p == e => {
                let entry = &mut self.entries[p];
                entry.note(record.revision);
                entry.message.state = DeliveryState::Sent;
                Acknowledged::Merged(entry.message.clone())
            }
            (Some(p), Some(_)) => {
                self.entries.remove(p);
                let Some(e) = self.position_id(&record.message_id) else {
                    let revision = record.revision;
                    let message = Message::from_record(record, local_id);
                    return Acknowledged::Added(self.insert(message, revision));
                };
                let entry = &mut self.entries[e];
                entry.note(record.revision);
                entry.message.local_id = local_id;
                Acknowledged::Merged(entry.message.clone())
            }
            (Some(p), None) => {
                let mut entry = self.entries.remove(p);
                entry.note(record.revision);
                entry.message.absorb(record);
                let message = entry.message.clone();
                self.reinsert(entry);
                Acknowledged::Added(message)
            }
            (None, Some(e)) => {
                let entry = &mut self.entries[e];
                entry.note(record.revision);
                Acknowledged::Merged(entry.message.clone())
            }
            (None, None) => {
                let revision = record.revision;
                let message = Message::from_record(record, local_id);
                Acknowledged::Added(self.insert(message, revision))
            }
        }
    }

    /// Applies a message observed on the server. `None` when already present.
    pub(crate) fn apply_add(&mut self, record: MessageRecord) -> Option<Message> {
        if self.contains_id(&record.message_id) {
            return None;
        }
        let own = record
            .nonce
            .as_deref()
            .and_then(|nonce| Uuid::parse_str(nonce).ok())
            .and_then(|local_id| self.position_local(local_id))
            .filter(|&index| self.entries[index].message.message_id.is_none());
        match own {
            Some(index) => {
                let mut entry = self.entries.remove(index);
                entry.note(record.revision);
                entry.message.absorb(record);
                let message = entry.message.clone();
                self.reinsert(entry);
                Some(message)
            }
            None => {
                let revision = record.revision;
                Some(self.insert(Message::from_record(record, Uuid::new_v4()), revision))
            }
        }
    }

    /// Applies an edit by server id. `None` when unknown, unchanged, or older
    /// than the edit already applied.
    pub(crate) fn apply_edit(&mut self, record: MessageRecord) -> Option<Message> {
        let index = self.position_id(&record.message_id)?;
        let entry = &mut self.entries[index];
        if !supersedes(record.revision, entry.revision) {
            return None;
        }
        entry.note(record.revision);
        let message = &mut entry.message;
        if message.body == record.body
            && message.updated_at == record.updated_at
            && message.last_updated_by == record.last_updated_by
        {
            return None;
        }
        message.body = record.body;
        message.updated_at = record.updated_at;
        message.last_updated_by = record.last_updated_by;
        Some(message.clone())
    }

    pub(crate) fn remove_by_id(&mut self, message_id: &MessageId) -> Option<Message> {
        let index = self.position_id(message_id)?;
        Some(self.entries.remove(index).message)
    }

    pub(crate) fn discard_local(&mut self, local_id: Uuid) -> Option<Message> {
        let index = self.position_local(local_id)?;
        Some(self.entries.remove(index).message)
    }

    fn position_local(&self, local_id: Uuid) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.local_id == local_id)
    }

    fn position_id(&self, message_id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.message_id.as_ref() == Some(message_id))
    }

    fn insert(&mut self, message: Message, revision: Revision) -> Message {
        let seq = self.next_seq;
        self.next_seq += 1;
        let copy = message.clone();
        self.reinsert(Entry {
            seq,
            revision,
            message,
        });
        copy
    }

    fn reinsert(&mut self, entry: Entry) {
        let key = entry.key();
        let index = self.entries.partition_point(|existing| existing.key() <= key);
        self.entries.insert(index, entry);
    }
}
