use serde_json::Value;
use shared::{
    domain::{Attributes, ChannelId, ChannelStatus, ChannelType, HistoryState, MessageId},
    protocol::{supersedes, ChannelRecord, ClientRequest, Revision},
};

use crate::{
    coordinator::CommandId,
    error::{CommandResult, SyncError},
    members::MemberSet,
    messages::MessageLog,
};

/// A field edited locally ahead of server confirmation.
///
/// The displayed value is the newest pending edit, or the confirmed value when
/// nothing is pending. Server results always overwrite what is displayed.
#[derive(Debug, Clone)]
pub(crate) struct Optimistic<T> {
    confirmed: T,
    displayed: T,
    pending: Vec<(CommandId, T)>,
}

impl<T: Clone + PartialEq> Optimistic<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            confirmed: value.clone(),
            displayed: value,
            pending: Vec::new(),
        }
    }

    pub(crate) fn displayed(&self) -> &T {
        &self.displayed
    }

    pub(crate) fn confirmed(&self) -> &T {
        &self.confirmed
    }

    pub(crate) fn propose(&mut self, command: CommandId, value: T) {
        self.displayed = value.clone();
        self.pending.push((command, value));
    }

    pub(crate) fn confirm(&mut self, command: CommandId, value: T) {
        self.pending.retain(|(id, _)| *id != command);
        self.force(value);
    }

    pub(crate) fn reject(&mut self, command: CommandId) {
        self.pending.retain(|(id, _)| *id != command);
        self.displayed = self
            .pending
            .last()
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| self.confirmed.clone());
    }

    /// Authoritative value from the server outside of any local command.
    pub(crate) fn force(&mut self, value: T) {
        self.confirmed = value.clone();
        self.displayed = value;
    }
}

/// Point-in-time copy of a channel handed to callers and observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub channel_id: ChannelId,
    pub unique_name: Option<String>,
    pub friendly_name: Option<String>,
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    pub attributes: Attributes,
    pub history: HistoryState,
}

#[derive(Debug, Clone, PartialEq)]
struct ConfirmedFields {
    unique_name: Option<String>,
    friendly_name: Option<String>,
    status: ChannelStatus,
    attributes: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusChange {
    Join,
    Decline,
    Leave,
}

impl StatusChange {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Join => "join_channel",
            Self::Decline => "decline_invitation",
            Self::Leave => "leave_channel",
        }
    }

    pub(crate) fn request(self, channel_id: ChannelId) -> ClientRequest {
        match self {
            Self::Join => ClientRequest::JoinChannel { channel_id },
            Self::Decline => ClientRequest::DeclineInvitation { channel_id },
            Self::Leave => ClientRequest::LeaveChannel { channel_id },
        }
    }
}

pub(crate) struct Channel {
    pub(crate) channel_id: ChannelId,
    pub(crate) channel_type: ChannelType,
    pub(crate) unique_name: Optimistic<Option<String>>,
    pub(crate) friendly_name: Optimistic<Option<String>>,
    pub(crate) attributes: Optimistic<Attributes>,
    pub(crate) status: Optimistic<ChannelStatus>,
    pub(crate) members: MemberSet,
    pub(crate) messages: MessageLog,
    pub(crate) history: HistoryState,
    /// Oldest message id of the last history page, used as the next `before`.
    pub(crate) history_cursor: Option<MessageId>,
    /// Newest server revision applied to the confirmed fields.
    revision: Revision,
    observed: ConfirmedFields,
}

impl Channel {
    pub(crate) fn from_record(record: ChannelRecord) -> Self {
        let mut channel = Self {
            revision: record.revision,
            channel_id: record.channel_id,
            channel_type: record.channel_type,
            unique_name: Optimistic::new(record.unique_name),
            friendly_name: Optimistic::new(record.friendly_name),
            attributes: Optimistic::new(record.attributes),
            status: Optimistic::new(record.status),
            members: MemberSet::default(),
            messages: MessageLog::default(),
            history: HistoryState::NotStarted,
            history_cursor: None,
            observed: ConfirmedFields {
                unique_name: None,
                friendly_name: None,
                status: ChannelStatus::NotParticipating,
                attributes: Attributes::new(),
            },
        };
        channel.observed = channel.confirmed_fields();
        channel
    }

    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: self.channel_id.clone(),
            unique_name: self.unique_name.displayed().clone(),
            friendly_name: self.friendly_name.displayed().clone(),
            channel_type: self.channel_type,
            status: *self.status.displayed(),
            attributes: self.attributes.displayed().clone(),
            history: self.history,
        }
    }

    /// Overwrites every field with the server's view. Visibility never changes.
    /// A record older than what was already applied is ignored and `false`
    /// returned.
    pub(crate) fn apply_record(&mut self, record: ChannelRecord) -> bool {
        if !self.accepts(record.revision) {
            return false;
        }
        self.note_revision(record.revision);
        self.unique_name.force(record.unique_name);
        self.friendly_name.force(record.friendly_name);
        self.attributes.force(record.attributes);
        self.status.force(record.status);
        true
    }

    pub(crate) fn accepts(&self, revision: Revision) -> bool {
        supersedes(revision, self.revision)
    }

    pub(crate) fn note_revision(&mut self, revision: Revision) {
        self.revision = self.revision.max(revision);
    }

    /// Returns a snapshot when confirmed state moved away from what observers
    /// last saw, and marks it as seen.
    pub(crate) fn take_change(&mut self) -> Option<ChannelSnapshot> {
        let current = self.confirmed_fields();
        if current == self.observed {
            return None;
        }
        self.observed = current;
        Some(self.snapshot())
    }

    pub(crate) fn is_joined(&self) -> bool {
        *self.status.confirmed() == ChannelStatus::Joined
    }

    pub(crate) fn target_status(&self, change: StatusChange) -> CommandResult<ChannelStatus> {
        let current = *self.status.displayed();
        match (change, current) {
            (StatusChange::Join, ChannelStatus::Invited) => Ok(ChannelStatus::Joined),
            (StatusChange::Join, ChannelStatus::NotParticipating)
                if self.channel_type == ChannelType::Public =>
            {
                Ok(ChannelStatus::Joined)
            }
            (StatusChange::Join, ChannelStatus::NotParticipating) => Err(SyncError::validation(
                "a private channel can only be joined through an invitation",
            )),
            (StatusChange::Decline, ChannelStatus::Invited) => Ok(ChannelStatus::NotParticipating),
            (StatusChange::Leave, ChannelStatus::Joined) => Ok(ChannelStatus::NotParticipating),
            (change, status) => Err(SyncError::Validation(format!(
                "cannot {} while channel status is {status:?}",
                change.name()
            ))),
        }
    }

    fn confirmed_fields(&self) -> ConfirmedFields {
        ConfirmedFields {
            unique_name: self.unique_name.confirmed().clone(),
            friendly_name: self.friendly_name.confirmed().clone(),
            status: *self.status.confirmed(),
            attributes: self.attributes.confirmed().clone(),
        }
    }
}

/// Parameters for creating a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOptions {
    pub friendly_name: Option<String>,
    pub unique_name: Option<String>,
    pub channel_type: ChannelType,
    pub attributes: Attributes,
}

impl ChannelOptions {
    /// Builds options from a loosely typed map using the keys `friendlyName`,
    /// `uniqueName`, `type` and `attributes`.
    pub fn from_map(map: &serde_json::Map<String, Value>) -> CommandResult<Self> {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "friendlyName" => options.friendly_name = Some(string_option(key, value)?),
                "uniqueName" => options.unique_name = Some(string_option(key, value)?),
                "type" => {
                    options.channel_type = match value.as_str() {
                        Some("public") => ChannelType::Public,
                        Some("private") => ChannelType::Private,
                        _ => {
                            return Err(SyncError::Validation(format!(
                                "channel type must be \"public\" or \"private\", got {value}"
                            )))
                        }
                    }
                }
                "attributes" => match value {
                    Value::Object(attributes) => options.attributes = attributes.clone(),
                    other => {
                        return Err(SyncError::Validation(format!(
                            "attributes must be an object, got {other}"
                        )))
                    }
                },
                other => {
                    return Err(SyncError::Validation(format!(
                        "unknown channel option {other:?}"
                    )))
                }
            }
        }
        Ok(options)
    }

    pub(crate) fn into_request(self) -> ClientRequest {
        ClientRequest::CreateChannel {
            friendly_name: self.friendly_name,
            unique_name: self.unique_name,
            channel_type: self.channel_type,
            attributes: self.attributes,
        }
    }
}

fn string_option(key: &str, value: &Value) -> CommandResult<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| SyncError::Validation(format!("{key} must be a string, got {value}")))
}
