use std::collections::HashMap;

use shared::{domain::ChannelId, protocol::ChannelRecord};
use tracing::{debug, warn};

use crate::{
    channel::{Channel, ChannelSnapshot, Optimistic},
    coordinator::CommandId,
    error::{CommandResult, SyncError},
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Upsert {
    Added(ChannelSnapshot),
    Changed(ChannelSnapshot),
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadStart {
    /// The caller owns a fresh load and must request the first page.
    Started,
    Attached,
    AlreadyComplete,
}

#[derive(Debug, Default)]
enum ListSync {
    #[default]
    Idle,
    Loading {
        waiters: Vec<CommandId>,
    },
    Complete,
}

/// Every channel visible to the session, indexed by id and by unique name.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: HashMap<ChannelId, Channel>,
    order: Vec<ChannelId>,
    by_unique_name: HashMap<String, ChannelId>,
    list_sync: ListSync,
    displaced: Vec<ChannelId>,
}

impl ChannelRegistry {
    pub(crate) fn get(&self, channel_id: &ChannelId) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub(crate) fn get_mut(&mut self, channel_id: &ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(channel_id)
    }

    pub(crate) fn by_unique_name(&self, unique_name: &str) -> Option<&Channel> {
        self.by_unique_name
            .get(unique_name)
            .and_then(|id| self.channels.get(id))
    }

    pub(crate) fn all_loaded_so_far(&self) -> Vec<ChannelSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.channels.get(id))
            .map(Channel::snapshot)
            .collect()
    }

    pub(crate) fn upsert(&mut self, record: ChannelRecord) -> Upsert {
        let channel_id = record.channel_id.clone();
        match self.channels.get_mut(&channel_id) {
            Some(channel) => {
                let before = channel.unique_name.displayed().clone();
                if !channel.apply_record(record) {
                    debug!(channel_id = %channel_id, "registry: ignoring stale channel record");
                    return Upsert::Unchanged;
                }
                let after = channel.unique_name.displayed().clone();
                self.reindex(&channel_id, before, after);
                match self.channels.get_mut(&channel_id).and_then(Channel::take_change) {
                    Some(snapshot) => Upsert::Changed(snapshot),
                    None => Upsert::Unchanged,
                }
            }
            None => {
                let channel = Channel::from_record(record);
                let unique_name = channel.unique_name.displayed().clone();
                let snapshot = channel.snapshot();
                self.channels.insert(channel_id.clone(), channel);
                self.order.push(channel_id.clone());
                self.reindex(&channel_id, None, unique_name);
                Upsert::Added(snapshot)
            }
        }
    }

    pub(crate) fn remove(&mut self, channel_id: &ChannelId) -> Option<Channel> {
        let channel = self.channels.remove(channel_id)?;
        self.order.retain(|id| id != channel_id);
        if let Some(name) = channel.unique_name.displayed() {
            if self.by_unique_name.get(name) == Some(channel_id) {
                self.by_unique_name.remove(name);
            }
        }
        Some(channel)
    }

    /// Applies a local rename ahead of confirmation. Fails without touching
    /// state when another channel already holds the name.
    pub(crate) fn propose_unique_name(
        &mut self,
        channel_id: &ChannelId,
        command: CommandId,
        unique_name: String,
    ) -> CommandResult<()> {
        if let Some(holder) = self.by_unique_name.get(&unique_name) {
            if holder != channel_id {
                return Err(SyncError::NameConflict(unique_name));
            }
        }
        self.edit_unique_name(channel_id, |field| field.propose(command, Some(unique_name)))
    }

    pub(crate) fn confirm_unique_name(
        &mut self,
        channel_id: &ChannelId,
        command: CommandId,
        unique_name: Option<String>,
    ) -> CommandResult<()> {
        self.edit_unique_name(channel_id, |field| field.confirm(command, unique_name))
    }

    pub(crate) fn reject_unique_name(
        &mut self,
        channel_id: &ChannelId,
        command: CommandId,
    ) -> CommandResult<()> {
        self.edit_unique_name(channel_id, |field| field.reject(command))
    }

    /// Channels that lost their unique name to an authoritative rename since
    /// the last call.
    pub(crate) fn take_displaced(&mut self) -> Vec<ChannelId> {
        std::mem::take(&mut self.displaced)
    }

    pub(crate) fn begin_load(&mut self, command: CommandId) -> LoadStart {
        match &mut self.list_sync {
            ListSync::Complete => LoadStart::AlreadyComplete,
            ListSync::Loading { waiters } => {
                waiters.push(command);
                LoadStart::Attached
            }
            ListSync::Idle => {
                self.list_sync = ListSync::Loading {
                    waiters: vec![command],
                };
                LoadStart::Started
            }
        }
    }

    /// Ends the in-flight load, returning the commands attached to it. A failed
    /// load returns to idle so the next caller starts over.
    pub(crate) fn finish_load(&mut self, succeeded: bool) -> Vec<CommandId> {
        let next = if succeeded {
            ListSync::Complete
        } else {
            ListSync::Idle
        };
        match std::mem::replace(&mut self.list_sync, next) {
            ListSync::Loading { waiters } => waiters,
            ListSync::Idle | ListSync::Complete => Vec::new(),
        }
    }

    fn edit_unique_name(
        &mut self,
        channel_id: &ChannelId,
        edit: impl FnOnce(&mut Optimistic<Option<String>>),
    ) -> CommandResult<()> {
        let channel = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| SyncError::NotFound(format!("channel {channel_id}")))?;
        let before = channel.unique_name.displayed().clone();
        edit(&mut channel.unique_name);
        let after = channel.unique_name.displayed().clone();
        self.reindex(channel_id, before, after);
        Ok(())
    }

    fn reindex(&mut self, channel_id: &ChannelId, before: Option<String>, after: Option<String>) {
        if before == after {
            return;
        }
        if let Some(old) = before {
            if self.by_unique_name.get(&old) == Some(channel_id) {
                self.by_unique_name.remove(&old);
            }
        }
        let Some(new) = after else {
            return;
        };
        if let Some(holder) = self.by_unique_name.get(&new).cloned() {
            if &holder != channel_id {
                warn!(
                    channel_id = %holder,
                    unique_name = %new,
                    "registry: unique name moved to {channel_id}"
                );
                if let Some(loser) = self.channels.get_mut(&holder) {
                    loser.unique_name.force(None);
                }
                self.displaced.push(holder);
            }
        }
        self.by_unique_name.insert(new, channel_id.clone());
    }
}
